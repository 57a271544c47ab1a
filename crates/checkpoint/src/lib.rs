//! Checkpoint persistence for partitioned training runs
//!
//! Saves and restores model, optimizer, scheduler, RNG and progress state
//! across every rank of a job. Three on-disk formats are supported:
//! monolithic per-model-parallel-rank records, Zero2 per-replica optimizer
//! partitions and sharded directories with a metadata file.
//!
//! [`Checkpointer`] is the entry point; the other modules are the pieces it
//! is built from and are public for tooling and tests.

pub mod assembler;
pub mod codec;
pub mod format;
pub mod module;
pub mod orchestrator;
pub mod paths;
pub mod record;
pub mod rng;
pub mod state;

pub use format::{ModuleTable, ParallelismCheck};
pub use module::{unwrap_module, unwrap_module_mut, KeyMatch, Module, Optimizer, Scheduler};
pub use orchestrator::{CheckpointSummary, Checkpointer, LoadSource};
pub use paths::{read_tracker, TrackerEntry};
pub use record::CheckpointRecord;
pub use rng::{RngSnapshot, RngStreams};
pub use state::{ShardDescriptor, StateDict, StateValue, Tensor};
