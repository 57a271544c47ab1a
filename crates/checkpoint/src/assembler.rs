//! Builds checkpoint records from live objects and copies them back

use runtime_core::{
    CheckpointFormat, Error, Iteration, OptimizerShardingType, ProcessGroup, Result, RunConfigSnapshot, TrainingArgs,
};
use tracing::{debug, warn};

use crate::module::{Module, Optimizer, Scheduler};
use crate::record::{model_key, CheckpointRecord, CHECKPOINT_VERSION, CHECKPOINT_VERSION_KEY, OPTIMIZER_KEY, SCHEDULER_KEY};
use crate::rng::RNG_STATE_KEY;
use crate::state::StateValue;

/// What goes into a record and in which shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyOptions {
    /// Shard descriptors instead of dense state
    pub sharded: bool,

    /// Omit optimizer and scheduler state
    pub no_save_optim: bool,

    /// Omit RNG state
    pub no_save_rng: bool,

    /// Optimizer state lives in per-rank Zero2 files, not in the record
    pub use_zero2: bool,

    /// Distributed-optimizer sharding for the sharded format
    pub optimizer_sharding: Option<OptimizerShardingType>,

    /// Building a load template rather than a record to save
    pub is_loading: bool,
}

impl AssemblyOptions {
    /// Options for saving under `args`
    pub fn for_save(args: &TrainingArgs) -> Self {
        let sharded = args.checkpoint.use_dist_ckpt;
        Self {
            sharded,
            no_save_optim: args.checkpoint.no_save_optim,
            no_save_rng: args.checkpoint.no_save_rng,
            use_zero2: args.optimizer.use_zero2,
            optimizer_sharding: (sharded && args.optimizer.use_distributed_optimizer).then(|| {
                OptimizerShardingType::from_fully_parallel_save(args.checkpoint.ckpt_fully_parallel_save)
            }),
            is_loading: false,
        }
    }

    /// Options for a sharded load template.
    ///
    /// The optimizer sharding follows what the checkpoint was saved with,
    /// not the live setting.
    pub fn for_load_template(args: &TrainingArgs, recorded: &RunConfigSnapshot) -> Self {
        Self {
            sharded: true,
            no_save_optim: args.checkpoint.no_save_optim,
            no_save_rng: args.checkpoint.no_save_rng,
            use_zero2: args.optimizer.use_zero2,
            optimizer_sharding: args
                .optimizer
                .use_distributed_optimizer
                .then(|| OptimizerShardingType::from_fully_parallel_save(recorded.ckpt_fully_parallel_save)),
            is_loading: true,
        }
    }
}

/// Assembles and disassembles checkpoint records
pub struct StateDictAssembler<'a> {
    group: &'a dyn ProcessGroup,
}

impl<'a> StateDictAssembler<'a> {
    pub fn new(group: &'a dyn ProcessGroup) -> Self {
        Self { group }
    }

    /// Build a record from bare model stages and their optimizer/scheduler.
    ///
    /// A single stage is stored under `model`; several stages under
    /// `model0`, `model1`, ..., each built with its stage selected.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        run_config: &RunConfigSnapshot,
        models: &[&dyn Module],
        optimizer: Option<&dyn Optimizer>,
        scheduler: Option<&dyn Scheduler>,
        rng_state: Option<StateValue>,
        iteration: Option<Iteration>,
        opts: &AssemblyOptions,
    ) -> Result<CheckpointRecord> {
        let format = if opts.sharded {
            CheckpointFormat::Sharded
        } else if opts.use_zero2 {
            CheckpointFormat::Zero2
        } else {
            CheckpointFormat::Monolithic
        };
        let mut record = CheckpointRecord::new(format);

        record.set_run_config(run_config)?;
        record.insert(CHECKPOINT_VERSION_KEY, StateValue::Float(CHECKPOINT_VERSION));
        if let Some(iteration) = iteration {
            record.set_iteration(iteration);
        }

        let num_stages = models.len();
        for (stage, model) in models.iter().enumerate() {
            if num_stages > 1 {
                self.group.set_virtual_pipeline_rank(stage);
            }
            let state = if opts.sharded {
                model.sharded_state_dict()?
            } else {
                model.state_dict_for_save_checkpoint()?
            };
            record.insert(model_key(stage, num_stages), state);
        }

        if !opts.no_save_optim {
            if let Some(optimizer) = optimizer {
                if !opts.use_zero2 {
                    let state = if opts.sharded {
                        optimizer.sharded_state_dict(record.entries(), opts.optimizer_sharding, opts.is_loading)?
                    } else {
                        optimizer.state_dict()?
                    };
                    record.insert(OPTIMIZER_KEY, state);
                }
            }
            if let Some(scheduler) = scheduler {
                record.insert(SCHEDULER_KEY, scheduler.state_dict());
            }
        }

        if !opts.no_save_rng {
            if let Some(rng_state) = rng_state {
                record.insert(RNG_STATE_KEY, rng_state);
            }
        }

        debug!(
            rank = self.group.rank(),
            format = %record.format,
            stages = num_stages,
            keys = record.entries().len(),
            "Assembled checkpoint record"
        );
        Ok(record)
    }

    /// Copy every stage's entry into its bare model, in stage order.
    ///
    /// A stage without an entry fails in strict mode and is skipped with a
    /// warning otherwise.
    pub fn restore_models(
        &self,
        record: &CheckpointRecord,
        models: &mut [&mut dyn Module],
        strict: bool,
        checkpoint: &str,
    ) -> Result<()> {
        let num_stages = models.len();
        for (stage, model) in models.iter_mut().enumerate() {
            if num_stages > 1 {
                self.group.set_virtual_pipeline_rank(stage);
            }
            let key = model_key(stage, num_stages);
            match record.model_state(stage, num_stages) {
                Some(state) => model.load_state_dict(state, strict)?,
                None if strict => {
                    return Err(Error::StateKeyMismatch {
                        module: checkpoint.to_string(),
                        missing: vec![key],
                        unexpected: Vec::new(),
                    })
                }
                None => warn!(key = %key, checkpoint, "Checkpoint has no entry for model stage, skipping"),
            }
        }
        Ok(())
    }
}
