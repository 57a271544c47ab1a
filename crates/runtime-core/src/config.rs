//! Run configuration types
//!
//! `TrainingArgs` is handed by reference to every checkpoint call. The subset
//! persisted inside a checkpoint is `RunConfigSnapshot`.

use crate::types::{ParallelTopology, SampleCounters};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArgs {
    /// Parallel layout of the run
    pub parallel: ParallelConfig,

    /// Checkpoint save/load settings
    pub checkpoint: CheckpointArgs,

    /// Optimizer partitioning and precision
    pub optimizer: OptimizerArgs,

    /// Telemetry settings
    pub logging: LoggingArgs,

    /// Give each data-parallel rank its own RNG streams
    pub data_parallel_random_init: bool,

    /// Total training iterations
    pub train_iters: u64,

    /// Samples per micro batch
    pub micro_batch_size: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            parallel: ParallelConfig::default(),
            checkpoint: CheckpointArgs::default(),
            optimizer: OptimizerArgs::default(),
            logging: LoggingArgs::default(),
            data_parallel_random_init: false,
            train_iters: 0,
            micro_batch_size: 1,
        }
    }
}

impl TrainingArgs {
    /// Parse from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let args: TrainingArgs = serde_json::from_str(json)?;
        args.validate()?;
        Ok(args)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.parallel.validate()?;

        if self.optimizer.use_zero2 && self.checkpoint.use_dist_ckpt {
            return Err(Error::InvalidConfig {
                message: "zero2 optimizer does not support the sharded checkpoint format".to_string(),
            });
        }
        if self.optimizer.use_zero2 && self.optimizer.use_distributed_optimizer {
            return Err(Error::InvalidConfig {
                message: "zero2 and the distributed optimizer are mutually exclusive".to_string(),
            });
        }
        if self.optimizer.use_zero2 && self.parallel.expert_model_parallel_size > 1 {
            return Err(Error::InvalidConfig {
                message: "zero2 optimizer files are not partitioned by expert rank".to_string(),
            });
        }
        if self.optimizer.fp16 && self.optimizer.bf16 {
            return Err(Error::InvalidConfig {
                message: "fp16 and bf16 are mutually exclusive".to_string(),
            });
        }

        Ok(())
    }

    /// Topology of the live run
    pub fn topology(&self) -> ParallelTopology {
        self.parallel.topology()
    }

    /// Capture the fields a checkpoint must remember about this run
    pub fn snapshot(&self, counters: &SampleCounters) -> RunConfigSnapshot {
        RunConfigSnapshot {
            tensor_model_parallel_size: self.parallel.tensor_model_parallel_size,
            pipeline_model_parallel_size: self.parallel.pipeline_model_parallel_size,
            context_parallel_size: self.parallel.context_parallel_size,
            data_parallel_size: self.parallel.data_parallel_size,
            expert_model_parallel_size: self.parallel.expert_model_parallel_size,
            consumed_train_samples: counters.consumed_train_samples,
            consumed_valid_samples: counters.consumed_valid_samples,
            no_save_rng: self.checkpoint.no_save_rng,
            no_save_optim: self.checkpoint.no_save_optim,
            ckpt_fully_parallel_save: self.checkpoint.ckpt_fully_parallel_save,
            use_distributed_optimizer: self.optimizer.use_distributed_optimizer,
            use_zero2: self.optimizer.use_zero2,
            data_parallel_random_init: self.data_parallel_random_init,
            train_iters: self.train_iters,
        }
    }
}

/// Parallel layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub tensor_model_parallel_size: usize,
    pub pipeline_model_parallel_size: usize,
    pub context_parallel_size: usize,
    pub data_parallel_size: usize,
    pub expert_model_parallel_size: usize,

    /// Model chunks per pipeline rank (interleaved schedule)
    pub virtual_pipeline_model_parallel_size: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_model_parallel_size: 1,
            pipeline_model_parallel_size: 1,
            context_parallel_size: 1,
            data_parallel_size: 1,
            expert_model_parallel_size: 1,
            virtual_pipeline_model_parallel_size: None,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("tensor", self.tensor_model_parallel_size),
            ("pipeline", self.pipeline_model_parallel_size),
            ("context", self.context_parallel_size),
            ("data", self.data_parallel_size),
            ("expert", self.expert_model_parallel_size),
        ];
        for (axis, size) in sizes {
            if size == 0 {
                return Err(Error::InvalidConfig {
                    message: format!("{} parallel size must be positive", axis),
                });
            }
        }
        if self.data_parallel_size % self.expert_model_parallel_size != 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "expert parallel size {} must divide data parallel size {}",
                    self.expert_model_parallel_size, self.data_parallel_size
                ),
            });
        }
        if self.virtual_pipeline_model_parallel_size == Some(0) {
            return Err(Error::InvalidConfig {
                message: "virtual pipeline size must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn topology(&self) -> ParallelTopology {
        ParallelTopology {
            tensor: self.tensor_model_parallel_size,
            pipeline: self.pipeline_model_parallel_size,
            context: self.context_parallel_size,
            data: self.data_parallel_size,
            expert: self.expert_model_parallel_size,
        }
    }
}

/// Checkpoint save/load settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointArgs {
    /// Checkpoint root to save into
    pub save: Option<String>,

    /// Checkpoint root to resume from
    pub load: Option<String>,

    /// Checkpoint root used when `load` holds no checkpoint
    pub pretrained_checkpoint: Option<String>,

    /// Load weights only: reset iteration, skip optimizer and RNG
    pub finetune: bool,

    /// Save and load the sharded format
    pub use_dist_ckpt: bool,

    /// Peek at the checkpoint to pick the load path
    pub auto_detect_ckpt_format: bool,

    /// Backend name recorded in sharded checkpoint metadata
    pub dist_ckpt_format: String,

    /// Shard distributed-optimizer state across every data-parallel rank
    pub ckpt_fully_parallel_save: bool,

    pub no_save_optim: bool,
    pub no_save_rng: bool,
    pub no_load_optim: bool,
    pub no_load_rng: bool,

    /// Fail instead of starting from scratch when no checkpoint exists
    pub exit_on_missing_checkpoint: bool,
}

impl Default for CheckpointArgs {
    fn default() -> Self {
        Self {
            save: None,
            load: None,
            pretrained_checkpoint: None,
            finetune: false,
            use_dist_ckpt: false,
            auto_detect_ckpt_format: false,
            dist_ckpt_format: "bincode_shards".to_string(),
            ckpt_fully_parallel_save: false,
            no_save_optim: false,
            no_save_rng: false,
            no_load_optim: false,
            no_load_rng: false,
            exit_on_missing_checkpoint: false,
        }
    }
}

/// Optimizer partitioning and precision settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerArgs {
    /// Optimizer state partitioned across data-parallel ranks
    pub use_distributed_optimizer: bool,

    /// Optimizer state persisted as one file per (dp, cp) rank
    pub use_zero2: bool,

    pub fp16: bool,
    pub bf16: bool,
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingArgs {
    /// Iterations between human-readable log lines
    pub log_interval: u64,

    /// Iterations between time-series scalar writes
    pub tensorboard_log_interval: u64,

    pub log_learning_rate_to_tensorboard: bool,
    pub log_batch_size_to_tensorboard: bool,
    pub log_loss_scale_to_tensorboard: bool,
    pub log_world_size_to_tensorboard: bool,
    pub log_memory_to_tensorboard: bool,
}

impl Default for LoggingArgs {
    fn default() -> Self {
        Self {
            log_interval: 100,
            tensorboard_log_interval: 1,
            log_learning_rate_to_tensorboard: true,
            log_batch_size_to_tensorboard: false,
            log_loss_scale_to_tensorboard: true,
            log_world_size_to_tensorboard: false,
            log_memory_to_tensorboard: false,
        }
    }
}

/// Run configuration captured inside a checkpoint.
///
/// Every field defaults when absent so records written by older versions
/// still parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfigSnapshot {
    pub tensor_model_parallel_size: usize,
    pub pipeline_model_parallel_size: usize,
    pub context_parallel_size: usize,
    pub data_parallel_size: usize,
    pub expert_model_parallel_size: usize,
    pub consumed_train_samples: u64,
    pub consumed_valid_samples: u64,
    pub no_save_rng: bool,
    pub no_save_optim: bool,
    pub ckpt_fully_parallel_save: bool,
    pub use_distributed_optimizer: bool,
    pub use_zero2: bool,
    pub data_parallel_random_init: bool,
    pub train_iters: u64,
}

impl RunConfigSnapshot {
    /// Recorded (tensor, pipeline) parallel sizes
    pub fn tp_pp(&self) -> (usize, usize) {
        (
            self.tensor_model_parallel_size,
            self.pipeline_model_parallel_size,
        )
    }
}
