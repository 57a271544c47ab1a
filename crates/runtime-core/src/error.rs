//! Error types for checkpoint persistence and training telemetry

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Checkpoint discovery errors
    #[error("No checkpoint found in load directory {load_dir} or pretrained directory {pretrained_dir:?}")]
    NoCheckpointFound {
        load_dir: String,
        pretrained_dir: Option<String>,
    },

    #[error("Invalid checkpoint tracker {path}: {content:?}")]
    MalformedTracker { path: String, content: String },

    #[error("A metadata file exists but unable to load iteration from checkpoint {checkpoint}")]
    MissingIteration { checkpoint: String },

    #[error("Checkpoint corrupted: {checkpoint} - {reason}")]
    CheckpointCorrupted { checkpoint: String, reason: String },

    #[error("Shard not found in {checkpoint}: {key} ({path})")]
    ShardNotFound {
        checkpoint: String,
        key: String,
        path: String,
    },

    // Compatibility errors
    #[error(
        "(TP, PP) mismatch after resume: checkpoint ({checkpoint_tp}, {checkpoint_pp}) vs run ({run_tp}, {run_pp}); not supported for DistributedOptimizer"
    )]
    ParallelismMismatch {
        checkpoint_tp: usize,
        checkpoint_pp: usize,
        run_tp: usize,
        run_pp: usize,
    },

    #[error("Unsupported checkpoint format combination: {message}")]
    UnsupportedFormatCombination { message: String },

    #[error("Module {module} not found while deserializing {checkpoint}")]
    ModuleNotFound { module: String, checkpoint: String },

    // Restoration errors
    #[error("Unable to load optimizer from checkpoint {checkpoint}: missing {key}")]
    MissingOptimizerState { checkpoint: String, key: String },

    #[error("Unable to load rng state from checkpoint {checkpoint}: missing {key}")]
    MissingRngState { checkpoint: String, key: String },

    #[error("Corrupt rng state in checkpoint {checkpoint}: empty tracker states")]
    CorruptRngState { checkpoint: String },

    #[error("Consumed sample counters already non-zero (train={train}, valid={valid}); checkpoint loaded twice?")]
    CountersAlreadyConsumed { train: u64, valid: u64 },

    #[error("State dict mismatch for {module}: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    StateKeyMismatch {
        module: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Coordination errors
    #[error("Collective {operation} failed: {message}")]
    Collective { operation: String, message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Collective { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error must stop the run.
    ///
    /// A half-restored training state is never safe to continue from, so every
    /// checkpoint restoration failure is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NoCheckpointFound { .. }
                | Error::MalformedTracker { .. }
                | Error::MissingIteration { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::ShardNotFound { .. }
                | Error::ParallelismMismatch { .. }
                | Error::UnsupportedFormatCombination { .. }
                | Error::ModuleNotFound { .. }
                | Error::MissingOptimizerState { .. }
                | Error::MissingRngState { .. }
                | Error::CorruptRngState { .. }
                | Error::CountersAlreadyConsumed { .. }
                | Error::StateKeyMismatch { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Operator guidance for errors that a command-line flag can avoid
    pub fn operator_hint(&self) -> Option<&'static str> {
        match self {
            Error::MissingOptimizerState { .. } => Some(
                "Specify --no-load-optim or --finetune to prevent attempting to load the optimizer state",
            ),
            Error::MissingRngState { .. } | Error::CorruptRngState { .. } => Some(
                "Specify --no-load-rng or --finetune to prevent attempting to load the rng state",
            ),
            Error::NoCheckpointFound { .. } => {
                Some("Check --load and --pretrained-checkpoint point at a checkpoint root")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
