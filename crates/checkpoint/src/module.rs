//! Collaborator interfaces for the objects whose state gets persisted
//!
//! The numerical model, optimizer and scheduler live outside this crate.
//! Checkpointing only needs them to produce and consume state dicts.

use runtime_core::{Error, OptimizerShardingType, Result};
use std::collections::BTreeSet;

use crate::state::{StateDict, StateValue};

/// A model chunk, or a wrapper around one.
///
/// Wrappers return the wrapped module from [`Module::inner`]; bare modules
/// keep the default `None` and implement the state methods.
pub trait Module: Send + Sync {
    /// Module wrapped by this layer, if this is a wrapper
    fn inner(&self) -> Option<&dyn Module> {
        None
    }

    fn inner_mut(&mut self) -> Option<&mut dyn Module> {
        None
    }

    /// Short type name used in log and error messages
    fn name(&self) -> &str {
        "module"
    }

    /// Dense state of every parameter and buffer
    fn state_dict_for_save_checkpoint(&self) -> Result<StateDict> {
        Err(not_bare(self.name()))
    }

    /// Shard descriptors for this rank's slice of every parameter
    fn sharded_state_dict(&self) -> Result<StateDict> {
        Err(not_bare(self.name()))
    }

    /// Copy `state` into the module's parameters.
    ///
    /// In strict mode any missing or unexpected key fails with
    /// [`Error::StateKeyMismatch`]; lenient mode loads the overlap.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<()> {
        let _ = (state, strict);
        Err(not_bare(self.name()))
    }
}

fn not_bare(name: &str) -> Error {
    Error::Internal {
        message: format!("{} is a wrapper; unwrap it before touching its state", name),
    }
}

/// Follow [`Module::inner`] until reaching a module that wraps nothing
pub fn unwrap_module(module: &dyn Module) -> &dyn Module {
    let mut current = module;
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current
}

/// Mutable counterpart of [`unwrap_module`]
pub fn unwrap_module_mut(module: &mut dyn Module) -> &mut dyn Module {
    // Probe with inner() first: returning `module` from the None arm of an
    // inner_mut() match does not borrow-check.
    if module.inner().is_some() {
        match module.inner_mut() {
            Some(inner) => unwrap_module_mut(inner),
            None => unreachable!("inner() and inner_mut() disagree"),
        }
    } else {
        module
    }
}

/// Keys of `state` compared against the keys a module expects
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyMatch {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl KeyMatch {
    pub fn compare<'a>(expected: impl IntoIterator<Item = &'a str>, state: &StateDict) -> Self {
        let expected: BTreeSet<&str> = expected.into_iter().collect();
        let missing = expected
            .iter()
            .filter(|k| !state.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        let unexpected = state
            .keys()
            .filter(|k| !expected.contains(k.as_str()))
            .cloned()
            .collect();
        Self { missing, unexpected }
    }

    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    /// Error in strict mode if the key sets differ
    pub fn enforce(self, module: &str, strict: bool) -> Result<Self> {
        if strict && !self.is_exact() {
            return Err(Error::StateKeyMismatch {
                module: module.to_string(),
                missing: self.missing,
                unexpected: self.unexpected,
            });
        }
        Ok(self)
    }
}

/// Optimizer collaborator
pub trait Optimizer: Send + Sync {
    fn state_dict(&self) -> Result<StateDict>;

    fn load_state_dict(&mut self, state: &StateValue) -> Result<()>;

    /// Shard descriptors for the optimizer state of the parameters described
    /// by `model_state`
    fn sharded_state_dict(
        &self,
        model_state: &StateDict,
        sharding: Option<OptimizerShardingType>,
        is_loading: bool,
    ) -> Result<StateDict>;

    /// This rank's partition of the distributed-optimizer parameter state
    fn parameter_state(&self) -> Result<StateDict> {
        Ok(StateDict::new())
    }

    /// Restore this rank's partition of the distributed-optimizer parameter
    /// state
    fn load_parameter_state(&mut self, state: &StateDict) -> Result<()> {
        let _ = state;
        Ok(())
    }

    /// Restore from every Zero2 partition, ordered data-parallel rank outer,
    /// context-parallel rank inner
    fn load_zero2_state_dicts(&mut self, partitions: &[StateDict]) -> Result<()> {
        let _ = partitions;
        Err(Error::UnsupportedFormatCombination {
            message: "optimizer cannot restore Zero2 partitions".to_string(),
        })
    }

    /// Refresh half-precision model copies from the master parameters
    fn reload_model_params(&mut self) {}
}

/// Learning-rate scheduler collaborator
pub trait Scheduler: Send + Sync {
    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}
