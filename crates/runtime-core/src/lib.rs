//! Runtime Core - Foundation for checkpointing a partitioned training run
//!
//! Provides the shared types, error taxonomy, run configuration and the
//! process-group collaborator used by the checkpoint and telemetry crates.

pub mod config;
pub mod error;
pub mod group;
pub mod types;

pub use config::{
    CheckpointArgs, LoggingArgs, OptimizerArgs, ParallelConfig, RunConfigSnapshot, TrainingArgs,
};
pub use error::{Error, Result};
pub use group::{GatherScope, LocalProcessGroup, ProcessGroup, ProcessGroupHandle};
pub use types::*;
