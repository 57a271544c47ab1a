//! Checkpoint naming and the "latest iteration" tracker
//!
//! Layout under a checkpoint root:
//!
//! ```text
//! <root>/latest_checkpointed_iteration.txt
//! <root>/iter_0000100/                         sharded: metadata.json, common.bin, shards
//! <root>/iter_0000100/mp_rank_01_002/model_optim_rng.pt
//! <root>/iter_0000100/mp_rank_01_002/distrib_optim.pt
//! <root>/iter_0000100/mp_rank_01_002/zero2_optim_dp3_cp1.pt
//! <root>/release/...
//! ```
//!
//! Every rank derives a distinct file name from its own coordinates, so no two
//! ranks ever write the same path.

use bytes::Bytes;
use runtime_core::{Error, Iteration, ParallelRanks, ParallelTopology, ProcessGroup, Result};
use std::fmt;
use storage::{join, parent, StorageBackend};
use tracing::{debug, warn};

pub const TRACKER_FILENAME: &str = "latest_checkpointed_iteration.txt";
pub const RELEASE_DIRNAME: &str = "release";
pub const MODEL_FILENAME: &str = "model_optim_rng.pt";
pub const DISTRIBUTED_OPTIMIZER_FILENAME: &str = "distrib_optim.pt";
pub const ZERO2_OPTIMIZER_PREFIX: &str = "zero2_optim_";

/// Content of the tracker file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEntry {
    Iteration(Iteration),
    Release,
}

impl TrackerEntry {
    /// Parse tracker content: a positive integer or the release marker
    pub fn parse(content: &str, path: &str) -> Result<Self> {
        let trimmed = content.trim();
        if trimmed == RELEASE_DIRNAME {
            return Ok(TrackerEntry::Release);
        }
        match trimmed.parse::<Iteration>() {
            Ok(iteration) if iteration > 0 => Ok(TrackerEntry::Iteration(iteration)),
            _ => Err(Error::MalformedTracker {
                path: path.to_string(),
                content: content.to_string(),
            }),
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, TrackerEntry::Release)
    }

    /// Iteration number; release checkpoints count as iteration 0
    pub fn iteration(&self) -> Iteration {
        match self {
            TrackerEntry::Iteration(iteration) => *iteration,
            TrackerEntry::Release => 0,
        }
    }

    /// Directory name of the checkpoint under its root
    pub fn dirname(&self) -> String {
        match self {
            TrackerEntry::Iteration(iteration) => format!("iter_{:07}", iteration),
            TrackerEntry::Release => RELEASE_DIRNAME.to_string(),
        }
    }
}

impl fmt::Display for TrackerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEntry::Iteration(iteration) => write!(f, "{}", iteration),
            TrackerEntry::Release => write!(f, "{}", RELEASE_DIRNAME),
        }
    }
}

pub fn tracker_path(root: &str) -> String {
    join(root, TRACKER_FILENAME)
}

/// Directory holding every file of one checkpoint
pub fn checkpoint_dir(root: &str, entry: TrackerEntry) -> String {
    join(root, &entry.dirname())
}

/// Model-parallel directory name for (tensor, pipeline, expert) ranks.
///
/// The pipeline and expert suffixes only appear when that axis is split.
pub fn model_parallel_dirname(tensor: usize, pipeline: usize, expert: usize, topology: &ParallelTopology) -> String {
    let mut name = format!("mp_rank_{:02}", tensor);
    if topology.pipeline > 1 {
        name.push_str(&format!("_{:03}", pipeline));
    }
    if topology.expert > 1 {
        name.push_str(&format!("_{:03}", expert));
    }
    name
}

/// Monolithic model file of the process at `ranks`
pub fn model_checkpoint_path(
    root: &str,
    entry: TrackerEntry,
    ranks: &ParallelRanks,
    topology: &ParallelTopology,
) -> String {
    let dir = model_parallel_dirname(ranks.tensor, ranks.pipeline, ranks.expert, topology);
    join(&join(&checkpoint_dir(root, entry), &dir), MODEL_FILENAME)
}

/// Model file of tensor rank 0, pipeline rank 0, expert rank 0
pub fn rank_zero_model_checkpoint_path(root: &str, entry: TrackerEntry, topology: &ParallelTopology) -> String {
    model_checkpoint_path(root, entry, &ParallelRanks::default(), topology)
}

/// Distributed-optimizer parameter state next to the expert-rank-0 model
/// file of this (tensor, pipeline) coordinate.
///
/// Parameter state is gathered over every data and context replica, which
/// spans all expert ranks, so one file per coordinate holds all of it.
pub fn distributed_optimizer_path(
    root: &str,
    entry: TrackerEntry,
    ranks: &ParallelRanks,
    topology: &ParallelTopology,
) -> String {
    let ranks = ParallelRanks { expert: 0, ..*ranks };
    let model = model_checkpoint_path(root, entry, &ranks, topology);
    join(parent(&model), DISTRIBUTED_OPTIMIZER_FILENAME)
}

/// Zero2 optimizer partition of (`data`, `context`) next to `model_path`
pub fn zero2_optimizer_path(model_path: &str, data: usize, context: usize) -> String {
    join(
        parent(model_path),
        &format!("{}dp{}_cp{}.pt", ZERO2_OPTIMIZER_PREFIX, data, context),
    )
}

/// Every Zero2 partition for `model_path`, data-parallel rank outer,
/// context-parallel rank inner
pub fn zero2_optimizer_paths(model_path: &str, topology: &ParallelTopology) -> Vec<String> {
    (0..topology.data)
        .flat_map(|data| (0..topology.context).map(move |context| (data, context)))
        .map(|(data, context)| zero2_optimizer_path(model_path, data, context))
        .collect()
}

/// Create the directory for `path`.
///
/// With `check_parent` the parent of `path` is created (`path` names a file),
/// otherwise `path` itself. Succeeds if the directory already exists.
pub async fn ensure_directory_exists(storage: &dyn StorageBackend, path: &str, check_parent: bool) -> Result<()> {
    let dir = if check_parent { parent(path) } else { path };
    if dir.is_empty() {
        return Ok(());
    }
    storage.ensure_dir(dir).await
}

/// True if `root` holds a tracker file
pub async fn checkpoint_exists(storage: &dyn StorageBackend, root: &str) -> Result<bool> {
    storage.exists(&tracker_path(root)).await
}

/// Read and parse the tracker, or `None` if there is none
pub async fn read_tracker(storage: &dyn StorageBackend, root: &str) -> Result<Option<TrackerEntry>> {
    let path = tracker_path(root);
    let data = match storage.read(&path).await {
        Ok(data) => data,
        Err(Error::StoragePathNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    let content = String::from_utf8_lossy(&data);
    TrackerEntry::parse(&content, &path).map(Some)
}

/// Read the tracker on every rank and agree on the newest iteration.
///
/// A rank whose tracker disagrees with the job-wide maximum warns and adopts
/// the maximum. Every rank must call this, since it runs a collective.
pub async fn read_metadata(storage: &dyn StorageBackend, group: &dyn ProcessGroup, root: &str) -> Result<TrackerEntry> {
    let path = tracker_path(root);
    let entry = read_tracker(storage, root)
        .await?
        .ok_or_else(|| Error::StoragePathNotFound { path: path.clone() })?;

    let max_iteration = group.all_reduce_max(entry.iteration()).await?;
    match entry {
        TrackerEntry::Iteration(iteration) if iteration != max_iteration => {
            warn!(
                rank = group.rank(),
                local = iteration,
                max = max_iteration,
                path = %path,
                "Tracker iteration differs across ranks, using the maximum"
            );
            Ok(TrackerEntry::Iteration(max_iteration))
        }
        entry => Ok(entry),
    }
}

/// Atomically write `iteration` as the newest complete checkpoint.
///
/// A tracker already pointing at a newer iteration is kept, so re-running an
/// older save never moves the tracker backwards.
pub async fn write_tracker(storage: &dyn StorageBackend, root: &str, iteration: Iteration) -> Result<()> {
    let path = tracker_path(root);
    match read_tracker(storage, root).await {
        Ok(Some(TrackerEntry::Iteration(current))) if current > iteration => {
            warn!(
                current,
                iteration,
                path = %path,
                "Tracker already names a newer checkpoint, leaving it in place"
            );
            return Ok(());
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, path = %path, "Overwriting unreadable tracker"),
    }

    storage.write(&path, Bytes::from(iteration.to_string())).await?;
    debug!(iteration, path = %path, "Tracker updated");
    Ok(())
}
