//! The persisted content of one checkpoint

use runtime_core::{CheckpointFormat, Error, Iteration, Result, RunConfigSnapshot};

use crate::rng::RNG_STATE_KEY;
use crate::state::{StateDict, StateValue};

pub const ARGS_KEY: &str = "args";
pub const CHECKPOINT_VERSION_KEY: &str = "checkpoint_version";
pub const ITERATION_KEY: &str = "iteration";
pub const LEGACY_ITERATION_KEY: &str = "total_iters";
pub const MODEL_KEY: &str = "model";
pub const OPTIMIZER_KEY: &str = "optimizer";
pub const SCHEDULER_KEY: &str = "opt_param_scheduler";
pub const LEGACY_SCHEDULER_KEY: &str = "lr_scheduler";
pub const FLOPS_KEY: &str = "num_floating_point_operations_so_far";
pub const PARAMETER_STATE_KEY: &str = "param_state";

/// Version tag written into every record
pub const CHECKPOINT_VERSION: f64 = 3.0;

/// State dict key of model stage `stage` out of `num_stages`
pub fn model_key(stage: usize, num_stages: usize) -> String {
    if num_stages == 1 {
        MODEL_KEY.to_string()
    } else {
        format!("{}{}", MODEL_KEY, stage)
    }
}

/// One checkpoint's full state dict together with its on-disk format
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub format: CheckpointFormat,
    entries: StateDict,
}

impl CheckpointRecord {
    pub fn new(format: CheckpointFormat) -> Self {
        Self {
            format,
            entries: StateDict::new(),
        }
    }

    pub fn from_entries(format: CheckpointFormat, entries: StateDict) -> Self {
        Self { format, entries }
    }

    pub fn entries(&self) -> &StateDict {
        &self.entries
    }

    pub fn into_entries(self) -> StateDict {
        self.entries
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn set_run_config(&mut self, snapshot: &RunConfigSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.entries.insert(ARGS_KEY.to_string(), StateValue::Text(json));
        Ok(())
    }

    /// Run configuration captured at save time, if the record has one
    pub fn run_config(&self) -> Result<Option<RunConfigSnapshot>> {
        match self.entries.get(ARGS_KEY) {
            None => Ok(None),
            Some(StateValue::Text(json)) => Ok(Some(serde_json::from_str(json)?)),
            Some(_) => Err(Error::Serialization(format!("{} entry is not JSON text", ARGS_KEY))),
        }
    }

    /// Saved iteration, falling back to the older `total_iters` key
    pub fn iteration(&self) -> Option<Iteration> {
        self.entries
            .get(ITERATION_KEY)
            .or_else(|| self.entries.get(LEGACY_ITERATION_KEY))
            .and_then(StateValue::as_int)
            .and_then(|i| Iteration::try_from(i).ok())
    }

    pub fn set_iteration(&mut self, iteration: Iteration) {
        self.entries
            .insert(ITERATION_KEY.to_string(), StateValue::Int(iteration as i64));
    }

    /// FLOPs counter, zero for records that predate it.
    ///
    /// Stored as a float since long runs exceed every integer width; older
    /// records holding an integer still read.
    pub fn num_floating_point_operations_so_far(&self) -> Result<f64> {
        match self.entries.get(FLOPS_KEY) {
            None => Ok(0.0),
            Some(value) => value
                .as_float()
                .filter(|flops| flops.is_finite() && *flops >= 0.0)
                .ok_or_else(|| Error::Serialization(format!("{} entry is not a non-negative number", FLOPS_KEY))),
        }
    }

    pub fn set_num_floating_point_operations_so_far(&mut self, flops: f64) {
        self.entries.insert(FLOPS_KEY.to_string(), StateValue::Float(flops));
    }

    pub fn checkpoint_version(&self) -> Option<f64> {
        self.entries.get(CHECKPOINT_VERSION_KEY).and_then(StateValue::as_float)
    }

    /// Model entry for one stage
    pub fn model_state(&self, stage: usize, num_stages: usize) -> Option<&StateDict> {
        self.entries
            .get(&model_key(stage, num_stages))
            .and_then(StateValue::as_map)
    }

    pub fn optimizer_state(&self) -> Option<&StateValue> {
        self.entries.get(OPTIMIZER_KEY)
    }

    /// Every Zero2 optimizer partition attached at load
    pub fn zero2_optimizer_states(&self, checkpoint: &str) -> Result<Vec<StateDict>> {
        let missing = || Error::MissingOptimizerState {
            checkpoint: checkpoint.to_string(),
            key: OPTIMIZER_KEY.to_string(),
        };
        let list = self.optimizer_state().and_then(StateValue::as_list).ok_or_else(missing)?;
        list.iter()
            .map(|entry| entry.as_map().cloned().ok_or_else(missing))
            .collect()
    }

    /// Scheduler entry, preferring the older `lr_scheduler` key when present
    pub fn scheduler_state(&self) -> Option<&StateDict> {
        self.entries
            .get(LEGACY_SCHEDULER_KEY)
            .or_else(|| self.entries.get(SCHEDULER_KEY))
            .and_then(StateValue::as_map)
    }

    pub fn rng_state(&self) -> Option<&StateValue> {
        self.entries.get(RNG_STATE_KEY)
    }
}
