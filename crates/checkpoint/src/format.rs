//! Checkpoint format detection and backward compatibility
//!
//! Classifies an on-disk checkpoint, resolves serializer module names written
//! by older builds, and decides what a sharded load may restore when the
//! run's parallel layout differs from the checkpoint's.

use bytes::Bytes;
use parking_lot::RwLock;
use runtime_core::{CheckpointFormat, Error, ParallelTopology, Result, RunConfigSnapshot, TrainingArgs};
use std::collections::{BTreeMap, BTreeSet};
use storage::{join, StorageBackend};
use tracing::{debug, info, warn};

use crate::codec::{MonolithicCodec, SERIALIZER_MODULES, SHARDED_METADATA_FILENAME};
use crate::paths::{MODEL_FILENAME, ZERO2_OPTIMIZER_PREFIX};
use crate::state::StateDict;

/// Module names that moved, mapped to their current location
pub const LEGACY_MODULE_ALIASES: &[(&str, &str)] = &[
    ("fp16.loss_scaler", "checkpoint.legacy.fp16_deprecated.loss_scaler"),
    ("megatron.fp16.loss_scaler", "checkpoint.legacy.fp16_deprecated.loss_scaler"),
    ("megatron.model", "checkpoint.legacy.model"),
];

/// True if `dir` is a sharded checkpoint directory
pub async fn is_sharded_checkpoint(storage: &dyn StorageBackend, dir: &str) -> Result<bool> {
    storage.exists(&join(dir, SHARDED_METADATA_FILENAME)).await
}

/// Classify the checkpoint stored in iteration directory `dir`.
///
/// Sharded if it carries sharded metadata, Zero2 if any model-parallel
/// directory holds per-rank optimizer files, monolithic otherwise.
pub async fn classify(storage: &dyn StorageBackend, dir: &str) -> Result<CheckpointFormat> {
    if is_sharded_checkpoint(storage, dir).await? {
        return Ok(CheckpointFormat::Sharded);
    }

    for entry in storage.list_dir(dir).await? {
        if !entry.starts_with("mp_rank_") {
            continue;
        }
        let files = storage.list_dir(&join(dir, &entry)).await?;
        if files.iter().any(|f| f.starts_with(ZERO2_OPTIMIZER_PREFIX)) {
            return Ok(CheckpointFormat::Zero2);
        }
        if !files.iter().any(|f| f == MODEL_FILENAME) {
            debug!(dir, entry = %entry, "Model-parallel directory without a model file");
        }
    }

    Ok(CheckpointFormat::Monolithic)
}

/// Serializer module names a decoder can resolve.
///
/// Owned by a loader instance; legacy aliases are only visible while an
/// [`AliasGuard`] from [`ModuleTable::register_aliases`] is alive.
#[derive(Debug)]
pub struct ModuleTable {
    known: BTreeSet<String>,
    aliases: RwLock<BTreeMap<String, String>>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        let known = SERIALIZER_MODULES
            .iter()
            .copied()
            .chain(LEGACY_MODULE_ALIASES.iter().map(|(_, target)| *target))
            .map(str::to_string)
            .collect();
        Self {
            known,
            aliases: RwLock::new(BTreeMap::new()),
        }
    }
}

impl ModuleTable {
    /// Current name for `module`, following a registered alias if needed
    pub fn resolve(&self, module: &str) -> Option<String> {
        if self.known.contains(module) {
            return Some(module.to_string());
        }
        self.aliases.read().get(module).cloned()
    }

    /// Register `aliases` until the returned guard drops.
    ///
    /// Names that already resolve are left alone and not removed later.
    pub fn register_aliases(&self, aliases: &[(&str, &str)]) -> AliasGuard<'_> {
        let mut table = self.aliases.write();
        let mut registered = Vec::new();
        for (old, current) in aliases {
            if self.known.contains(*old) || table.contains_key(*old) {
                continue;
            }
            table.insert(old.to_string(), current.to_string());
            registered.push(old.to_string());
        }
        debug!(aliases = ?registered, "Registered legacy module aliases");
        AliasGuard {
            table: self,
            registered,
        }
    }

    /// Number of aliases currently registered
    pub fn alias_count(&self) -> usize {
        self.aliases.read().len()
    }
}

/// Removes the aliases it registered when dropped, including on error paths
#[must_use = "aliases are removed as soon as the guard drops"]
pub struct AliasGuard<'a> {
    table: &'a ModuleTable,
    registered: Vec<String>,
}

impl Drop for AliasGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.aliases.write();
        for name in &self.registered {
            table.remove(name);
        }
    }
}

/// Read and decode monolithic files, retrying once with legacy module
/// aliases if any file names a module this build no longer has.
///
/// All files are decoded under the same alias scope, and the aliases are gone
/// again when this returns.
pub async fn load_monolithic_files(
    storage: &dyn StorageBackend,
    modules: &ModuleTable,
    paths: &[String],
) -> Result<Vec<StateDict>> {
    let mut raw: Vec<(&str, Bytes)> = Vec::with_capacity(paths.len());
    for path in paths {
        raw.push((path.as_str(), storage.read(path).await?));
    }

    let decode_all = || {
        raw.iter()
            .map(|(path, data)| MonolithicCodec::decode(data, path, modules))
            .collect::<Result<Vec<_>>>()
    };

    match decode_all() {
        Err(Error::ModuleNotFound { module, checkpoint }) => {
            info!(module = %module, checkpoint = %checkpoint, "Retrying with legacy module aliases");
            let _guard = modules.register_aliases(LEGACY_MODULE_ALIASES);
            decode_all()
        }
        other => other,
    }
}

/// Outcome of comparing a checkpoint's parallel layout with the run's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelismCheck {
    Match,
    Mismatch {
        checkpoint: (usize, usize),
        run: (usize, usize),
    },
}

/// Compare recorded (tensor, pipeline) sizes with the live topology
pub fn check_parallelism_compatibility(recorded: &RunConfigSnapshot, live: &ParallelTopology) -> ParallelismCheck {
    let checkpoint = recorded.tp_pp();
    let run = (live.tensor, live.pipeline);
    if checkpoint == run {
        ParallelismCheck::Match
    } else {
        ParallelismCheck::Mismatch { checkpoint, run }
    }
}

/// Decide whether a sharded load may restore RNG state.
///
/// RNG restores only when the layouts match and the checkpoint was saved
/// with RNG. A mismatch is fatal when the optimizer state would have to be
/// resharded: not a release load, not finetuning, optimizer loading enabled,
/// and the run uses the distributed optimizer. Every other mismatch only
/// skips RNG.
pub fn sharded_load_gate(
    check: ParallelismCheck,
    recorded: &RunConfigSnapshot,
    args: &TrainingArgs,
    release: bool,
    finetune: bool,
) -> Result<bool> {
    let restore_rng = check == ParallelismCheck::Match && !recorded.no_save_rng;
    if !restore_rng {
        match check {
            ParallelismCheck::Mismatch { checkpoint, run } => warn!(
                checkpoint = ?checkpoint,
                run = ?run,
                "(TP, PP) mismatch after resume: RNG state will be ignored"
            ),
            ParallelismCheck::Match => info!("Checkpoint was saved without RNG state, RNG state will be ignored"),
        }
    }

    if let ParallelismCheck::Mismatch { checkpoint, run } = check {
        if !release && !finetune && !args.checkpoint.no_load_optim && args.optimizer.use_distributed_optimizer {
            return Err(Error::ParallelismMismatch {
                checkpoint_tp: checkpoint.0,
                checkpoint_pp: checkpoint.1,
                run_tp: run.0,
                run_pp: run.1,
            });
        }
    }

    Ok(restore_rng)
}
