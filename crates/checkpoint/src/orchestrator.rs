//! Checkpoint save and load across every rank of a job
//!
//! Every rank calls [`Checkpointer::save_checkpoint`] and
//! [`Checkpointer::load_checkpoint`] with the same arguments. Which ranks
//! touch storage is decided here from their parallel coordinates; collectives
//! keep them in step.

use bytes::Bytes;
use parking_lot::Mutex;
use runtime_core::{
    CheckpointFormat, Error, GatherScope, Iteration, ProcessGroup, ProcessGroupHandle, Result, RunConfigSnapshot,
    SampleCounters, TrainingArgs,
};
use std::sync::Arc;
use std::time::Instant;
use storage::{join, StorageBackend};
use tracing::{debug, error, info, instrument, warn};

use crate::assembler::{AssemblyOptions, StateDictAssembler};
use crate::codec::{MonolithicCodec, ShardedCodec, SHARDED_BACKEND_VERSION};
use crate::format::{
    check_parallelism_compatibility, classify, is_sharded_checkpoint, load_monolithic_files, sharded_load_gate,
    ModuleTable,
};
use crate::module::{unwrap_module, unwrap_module_mut, Module, Optimizer, Scheduler};
use crate::paths::{
    checkpoint_dir, checkpoint_exists, distributed_optimizer_path, ensure_directory_exists, model_checkpoint_path,
    rank_zero_model_checkpoint_path, read_metadata, read_tracker, tracker_path, write_tracker, zero2_optimizer_path,
    zero2_optimizer_paths, TrackerEntry, MODEL_FILENAME,
};
use crate::record::{CheckpointRecord, OPTIMIZER_KEY, PARAMETER_STATE_KEY, SCHEDULER_KEY};
use crate::rng::{self, RngSnapshot, RngStreams};
use crate::state::{StateDict, StateValue};

/// Which checkpoint root a load reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// `checkpoint.load`
    Load,
    /// `checkpoint.save`, e.g. to reload what this run just wrote
    Save,
    /// An explicit root
    Path(String),
}

impl LoadSource {
    fn resolve(&self, args: &TrainingArgs) -> Result<String> {
        let root = match self {
            LoadSource::Load => args.checkpoint.load.clone(),
            LoadSource::Save => args.checkpoint.save.clone(),
            LoadSource::Path(path) => Some(path.clone()),
        };
        root.ok_or_else(|| Error::InvalidConfig {
            message: format!("no checkpoint directory configured for {:?}", self),
        })
    }
}

/// A record read from storage, with where it came from
struct LoadedCheckpoint {
    record: CheckpointRecord,
    name: String,
    entry: TrackerEntry,
}

/// Summary of the rank-0 record of a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub entry: TrackerEntry,
    pub format: CheckpointFormat,
    pub path: String,
    pub iteration: Option<Iteration>,
    pub checkpoint_version: Option<f64>,
    pub num_floating_point_operations_so_far: f64,
    pub run_config: Option<RunConfigSnapshot>,
    pub keys: Vec<String>,
}

/// Saves and restores the recoverable state of one rank
pub struct Checkpointer {
    storage: Arc<dyn StorageBackend>,
    group: ProcessGroupHandle,
    rng: Arc<Mutex<RngStreams>>,
    modules: ModuleTable,
}

impl Checkpointer {
    pub fn new(storage: Arc<dyn StorageBackend>, group: ProcessGroupHandle, rng: Arc<Mutex<RngStreams>>) -> Self {
        Self {
            storage,
            group,
            rng,
            modules: ModuleTable::default(),
        }
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    /// RNG streams captured on save and restored on load
    pub fn rng(&self) -> &Arc<Mutex<RngStreams>> {
        &self.rng
    }

    /// Save the full training state at `iteration`.
    ///
    /// Returns once every rank's part is durable and the tracker names
    /// `iteration`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(iteration = iteration, rank = self.group.rank()))]
    pub async fn save_checkpoint(
        &self,
        args: &TrainingArgs,
        counters: &SampleCounters,
        iteration: Iteration,
        models: &[Box<dyn Module>],
        optimizer: Option<&dyn Optimizer>,
        scheduler: Option<&dyn Scheduler>,
        num_floating_point_operations_so_far: f64,
    ) -> Result<()> {
        let result = self
            .save_inner(
                args,
                counters,
                iteration,
                models,
                optimizer,
                scheduler,
                num_floating_point_operations_so_far,
            )
            .await;
        if let Err(e) = &result {
            self.report_failure("save", e);
        }
        result
    }

    /// Restore the training state from the checkpoint selected by `source`.
    ///
    /// # Returns
    /// `(iteration, num_floating_point_operations_so_far)`; `(0, 0.0)` when
    /// there is no checkpoint to start from
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(rank = self.group.rank()))]
    pub async fn load_checkpoint(
        &self,
        args: &TrainingArgs,
        counters: &mut SampleCounters,
        models: &mut [Box<dyn Module>],
        optimizer: Option<&mut dyn Optimizer>,
        scheduler: Option<&mut dyn Scheduler>,
        source: LoadSource,
        strict: bool,
    ) -> Result<(Iteration, f64)> {
        let result = self
            .load_inner(args, counters, models, optimizer, scheduler, source, strict)
            .await;
        if let Err(e) = &result {
            self.report_failure("load", e);
        }
        result
    }

    /// Describe the checkpoint under `root` from its rank-0 record.
    ///
    /// Reads the tracker unless `iteration` is given. Runs no collectives.
    pub async fn inspect(&self, root: &str, iteration: Option<Iteration>) -> Result<Option<CheckpointSummary>> {
        let storage = self.storage.as_ref();
        let entry = match iteration {
            Some(iteration) => TrackerEntry::Iteration(iteration),
            None => match read_tracker(storage, root).await? {
                Some(entry) => entry,
                None => return Ok(None),
            },
        };

        let dir = checkpoint_dir(root, entry);
        let format = classify(storage, &dir).await?;
        let (path, entries) = if format == CheckpointFormat::Sharded {
            (dir.clone(), ShardedCodec::new(storage).load_common(&dir).await?)
        } else {
            let mut path = rank_zero_model_checkpoint_path(root, entry, &self.group.topology());
            if !storage.exists(&path).await? {
                // Saved under another layout; take the first model-parallel directory
                let first = storage
                    .list_dir(&dir)
                    .await?
                    .into_iter()
                    .find(|name| name.starts_with("mp_rank_"))
                    .ok_or_else(|| Error::StoragePathNotFound { path: path.clone() })?;
                path = join(&join(&dir, &first), MODEL_FILENAME);
            }
            let mut dicts = load_monolithic_files(storage, &self.modules, std::slice::from_ref(&path)).await?;
            (path, dicts.pop().unwrap_or_default())
        };

        let record = CheckpointRecord::from_entries(format, entries);
        Ok(Some(CheckpointSummary {
            entry,
            format,
            path,
            iteration: record.iteration(),
            checkpoint_version: record.checkpoint_version(),
            num_floating_point_operations_so_far: record.num_floating_point_operations_so_far()?,
            run_config: record.run_config()?,
            keys: record.entries().keys().cloned().collect(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_inner(
        &self,
        args: &TrainingArgs,
        counters: &SampleCounters,
        iteration: Iteration,
        models: &[Box<dyn Module>],
        optimizer: Option<&dyn Optimizer>,
        scheduler: Option<&dyn Scheduler>,
        num_floating_point_operations_so_far: f64,
    ) -> Result<()> {
        args.validate()?;
        self.check_topology(args)?;
        let start = Instant::now();
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let topology = group.topology();
        let ranks = group.ranks();

        let save_dir = args.checkpoint.save.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: "no save directory configured".to_string(),
        })?;
        if iteration == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint iteration must be positive".to_string(),
            });
        }

        let sharded = args.checkpoint.use_dist_ckpt;
        let entry = TrackerEntry::Iteration(iteration);
        let models: Vec<&dyn Module> = models.iter().map(|m| unwrap_module(m.as_ref())).collect();

        if group.is_logging_rank() {
            let format = if sharded { args.checkpoint.dist_ckpt_format.as_str() } else { "monolithic" };
            info!(iteration, save_dir, format, "Saving checkpoint");
        }

        let rng_state = rng::capture(&self.rng, group, args.data_parallel_random_init, sharded).await?;

        let checkpoint_name = if sharded {
            checkpoint_dir(save_dir, entry)
        } else {
            model_checkpoint_path(save_dir, entry, &ranks, &topology)
        };

        if args.optimizer.use_distributed_optimizer && !args.checkpoint.no_save_optim && !sharded {
            if let Some(optimizer) = optimizer {
                self.save_parameter_state(save_dir, entry, optimizer).await?;
            }
        }

        if args.optimizer.use_zero2 && !args.checkpoint.no_save_optim {
            if let Some(optimizer) = optimizer {
                let path = zero2_optimizer_path(&checkpoint_name, ranks.data, ranks.context);
                ensure_directory_exists(storage, &path, true).await?;
                let size = storage
                    .write(&path, MonolithicCodec::encode(&optimizer.state_dict()?)?)
                    .await?;
                debug!(path = %path, size, "Zero2 optimizer partition written");
            }
        }

        let writes_record = !group.is_distributed() || ranks.data_modulo_expert(&topology) == 0 || sharded;
        if writes_record {
            let opts = AssemblyOptions::for_save(args);
            if let (Some(sharding), true) = (opts.optimizer_sharding, group.is_logging_rank()) {
                info!(
                    sharding_type = sharding.as_str(),
                    "Storing distributed optimizer sharded state"
                );
            }

            let mut record = StateDictAssembler::new(group).build(
                &args.snapshot(counters),
                &models,
                optimizer,
                scheduler,
                Some(rng_state),
                Some(iteration),
                &opts,
            )?;
            record.set_num_floating_point_operations_so_far(num_floating_point_operations_so_far);

            if sharded {
                let coordinator = !group.is_distributed() || group.rank() == 0;
                if coordinator {
                    ensure_directory_exists(storage, &checkpoint_name, false).await?;
                }
                let backend = (args.checkpoint.dist_ckpt_format.as_str(), SHARDED_BACKEND_VERSION);
                ShardedCodec::new(storage)
                    .save(&checkpoint_name, record.entries(), backend, coordinator)
                    .await?;
            } else {
                ensure_directory_exists(storage, &checkpoint_name, true).await?;
                let size = storage
                    .write(&checkpoint_name, MonolithicCodec::encode(record.entries())?)
                    .await?;
                debug!(path = %checkpoint_name, size, "Model checkpoint written");
            }
        }

        group.barrier().await?;

        if group.is_logging_rank() {
            info!(
                iteration,
                save_dir,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Successfully saved checkpoint"
            );
        }

        if !group.is_distributed() || group.rank() == 0 {
            write_tracker(storage, save_dir, iteration).await?;
        }

        group.barrier().await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_inner(
        &self,
        args: &TrainingArgs,
        counters: &mut SampleCounters,
        models: &mut [Box<dyn Module>],
        optimizer: Option<&mut dyn Optimizer>,
        scheduler: Option<&mut dyn Scheduler>,
        source: LoadSource,
        strict: bool,
    ) -> Result<(Iteration, f64)> {
        args.validate()?;
        self.check_topology(args)?;
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let ranks = group.ranks();
        let exit_on_missing = args.checkpoint.exit_on_missing_checkpoint;

        let mut load_dir = source.resolve(args)?;
        let mut finetune = args.checkpoint.finetune;

        if let Some(pretrained) = args.checkpoint.pretrained_checkpoint.as_deref() {
            if !checkpoint_exists(storage, &load_dir).await? {
                if group.is_logging_rank() {
                    info!(
                        load_dir = %load_dir,
                        pretrained,
                        "Checkpoint not found in load directory, attempting to finetune from pretrained checkpoint"
                    );
                }
                let primary = std::mem::replace(&mut load_dir, pretrained.to_string());
                if !checkpoint_exists(storage, &load_dir).await? {
                    return Err(Error::NoCheckpointFound {
                        load_dir: primary,
                        pretrained_dir: Some(load_dir),
                    });
                }
                finetune = true;
            }
        }

        let mut models: Vec<&mut dyn Module> = models.iter_mut().map(|m| unwrap_module_mut(m.as_mut())).collect();

        let mut template = None;
        let mut is_sharded = false;
        let mut rng_permitted = true;
        if args.checkpoint.auto_detect_ckpt_format || args.checkpoint.use_dist_ckpt {
            if let Some(peek) = self.load_base(&load_dir, true, None, exit_on_missing).await? {
                is_sharded = peek.record.format == CheckpointFormat::Sharded;
                if is_sharded {
                    let recorded = peek.record.run_config()?.ok_or_else(|| Error::CheckpointCorrupted {
                        checkpoint: peek.name.clone(),
                        reason: "sharded checkpoint carries no run configuration".to_string(),
                    })?;
                    let check = check_parallelism_compatibility(&recorded, &group.topology());
                    rng_permitted = sharded_load_gate(check, &recorded, args, peek.entry.is_release(), finetune)?;

                    let rng_state = if rng_permitted {
                        Some(rng::capture(&self.rng, group, args.data_parallel_random_init, true).await?)
                    } else {
                        None
                    };
                    let opts = AssemblyOptions::for_load_template(args, &recorded);
                    let views: Vec<&dyn Module> = models.iter().map(|m| &**m).collect();
                    template = Some(StateDictAssembler::new(group).build(
                        &args.snapshot(counters),
                        &views,
                        optimizer.as_deref(),
                        scheduler.as_deref(),
                        rng_state,
                        None,
                        &opts,
                    )?);
                }
            }
        }

        let loaded = if args.optimizer.use_zero2 {
            self.load_zero2(&load_dir, exit_on_missing).await?
        } else {
            self.load_base(&load_dir, false, template.as_ref(), exit_on_missing).await?
        };
        let Some(LoadedCheckpoint { record, name, entry }) = loaded else {
            return Ok((0, 0.0));
        };

        let release = entry.is_release();
        let iteration = if finetune || release {
            0
        } else {
            record
                .iteration()
                .ok_or_else(|| Error::MissingIteration { checkpoint: name.clone() })?
        };
        let num_floating_point_operations_so_far = record.num_floating_point_operations_so_far()?;

        if !counters.is_zero() {
            return Err(Error::CountersAlreadyConsumed {
                train: counters.consumed_train_samples,
                valid: counters.consumed_valid_samples,
            });
        }
        match record.run_config()? {
            Some(recorded) if !finetune => {
                counters.consumed_train_samples = recorded.consumed_train_samples;
                counters.consumed_valid_samples = recorded.consumed_valid_samples;
            }
            _ => {
                if group.is_logging_rank() {
                    info!(checkpoint = %name, "Could not find arguments in the checkpoint");
                }
            }
        }

        StateDictAssembler::new(group).restore_models(&record, &mut models, strict, &name)?;

        if !release && !finetune && !args.checkpoint.no_load_optim {
            let missing = |key: &str| Error::MissingOptimizerState {
                checkpoint: name.clone(),
                key: key.to_string(),
            };
            if let Some(optimizer) = optimizer {
                if args.optimizer.use_zero2 {
                    optimizer.load_zero2_state_dicts(&record.zero2_optimizer_states(&name)?)?;
                } else {
                    let state = record.optimizer_state().ok_or_else(|| missing(OPTIMIZER_KEY))?;
                    optimizer.load_state_dict(state)?;
                }
                if args.optimizer.use_distributed_optimizer && !is_sharded {
                    self.load_parameter_state(&load_dir, entry, optimizer).await?;
                }
            }
            if let Some(scheduler) = scheduler {
                let state = record.scheduler_state().ok_or_else(|| missing(SCHEDULER_KEY))?;
                scheduler.load_state_dict(state)?;
            }
        } else if args.optimizer.fp16 || args.optimizer.bf16 {
            if let Some(optimizer) = optimizer {
                optimizer.reload_model_params();
            }
        }

        if !release && !finetune && !args.checkpoint.no_load_rng && rng_permitted {
            let snapshot = match record.rng_state() {
                Some(states) => {
                    let index = if args.data_parallel_random_init { ranks.data } else { 0 };
                    RngSnapshot::select(states, index, &name)?
                }
                None => RngSnapshot::from_dict(record.entries(), &name)?,
            };
            rng::restore(&self.rng, &snapshot);
        }

        group.barrier().await?;

        if group.is_logging_rank() {
            info!(
                load_dir = %load_dir,
                t = ranks.tensor,
                p = ranks.pipeline,
                iteration,
                "Successfully loaded checkpoint"
            );
        }

        Ok((iteration, num_floating_point_operations_so_far))
    }

    /// Read the record this rank needs from `load_dir`.
    ///
    /// With `rank0` only the tensor/pipeline rank-0 record is read, and only
    /// its common part if sharded. `None` means there is nothing to load.
    async fn load_base(
        &self,
        load_dir: &str,
        rank0: bool,
        template: Option<&CheckpointRecord>,
        exit_on_missing: bool,
    ) -> Result<Option<LoadedCheckpoint>> {
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let topology = group.topology();

        if !checkpoint_exists(storage, load_dir).await? {
            if exit_on_missing {
                return Err(Error::NoCheckpointFound {
                    load_dir: load_dir.to_string(),
                    pretrained_dir: None,
                });
            }
            if !rank0 && group.is_logging_rank() {
                warn!(
                    tracker = %tracker_path(load_dir),
                    "Could not find the metadata file, will not load any checkpoints and will start from random"
                );
            }
            return Ok(None);
        }

        let entry = read_metadata(storage, group, load_dir).await?;
        let dir = checkpoint_dir(load_dir, entry);
        let sharded = is_sharded_checkpoint(storage, &dir).await?;

        if rank0 {
            if sharded {
                let common = ShardedCodec::new(storage).load_common(&dir).await?;
                return Ok(Some(LoadedCheckpoint {
                    record: CheckpointRecord::from_entries(CheckpointFormat::Sharded, common),
                    name: dir,
                    entry,
                }));
            }
            let name = rank_zero_model_checkpoint_path(load_dir, entry, &topology);
            if !storage.exists(&name).await? {
                debug!(path = %name, "No rank-0 model file to peek at");
                return Ok(None);
            }
            let record = self.read_monolithic(&name).await?;
            return Ok(Some(LoadedCheckpoint { record, name, entry }));
        }

        let name = if sharded {
            dir.clone()
        } else {
            model_checkpoint_path(load_dir, entry, &group.ranks(), &topology)
        };
        if group.is_logging_rank() {
            info!(
                load_dir,
                checkpoint = %entry,
                sharded,
                "Loading checkpoint"
            );
        }

        if sharded {
            let template = template.ok_or_else(|| Error::UnsupportedFormatCombination {
                message: "detected load from a sharded checkpoint, but neither use_dist_ckpt nor auto_detect_ckpt_format is set"
                    .to_string(),
            })?;
            let entries = ShardedCodec::new(storage).load(&dir, template.entries()).await?;
            return Ok(Some(LoadedCheckpoint {
                record: CheckpointRecord::from_entries(CheckpointFormat::Sharded, entries),
                name,
                entry,
            }));
        }

        let record = self.read_monolithic(&name).await?;
        Ok(Some(LoadedCheckpoint { record, name, entry }))
    }

    /// Read the shared model file plus every Zero2 optimizer partition
    async fn load_zero2(&self, load_dir: &str, exit_on_missing: bool) -> Result<Option<LoadedCheckpoint>> {
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let topology = group.topology();

        if !checkpoint_exists(storage, load_dir).await? {
            if exit_on_missing {
                return Err(Error::NoCheckpointFound {
                    load_dir: load_dir.to_string(),
                    pretrained_dir: None,
                });
            }
            if group.is_logging_rank() {
                warn!(
                    tracker = %tracker_path(load_dir),
                    "Could not find the metadata file, will not load any checkpoints and will start from random"
                );
            }
            return Ok(None);
        }

        let entry = read_metadata(storage, group, load_dir).await?;
        if is_sharded_checkpoint(storage, &checkpoint_dir(load_dir, entry)).await? {
            return Err(Error::UnsupportedFormatCombination {
                message: "Zero2 optimizer does not support the sharded checkpoint format".to_string(),
            });
        }

        let name = model_checkpoint_path(load_dir, entry, &group.ranks(), &topology);
        let mut paths = vec![name.clone()];
        paths.extend(zero2_optimizer_paths(&name, &topology));
        if group.is_logging_rank() {
            info!(
                load_dir,
                checkpoint = %entry,
                partitions = paths.len() - 1,
                "Loading Zero2 checkpoint"
            );
        }

        let mut dicts = load_monolithic_files(storage, &self.modules, &paths).await?;
        let partitions = dicts.split_off(1);
        let mut entries = dicts.pop().unwrap_or_default();
        entries.insert(
            OPTIMIZER_KEY.to_string(),
            StateValue::List(partitions.into_iter().map(StateValue::Map).collect()),
        );

        Ok(Some(LoadedCheckpoint {
            record: CheckpointRecord::from_entries(CheckpointFormat::Zero2, entries),
            name,
            entry,
        }))
    }

    async fn read_monolithic(&self, path: &str) -> Result<CheckpointRecord> {
        let path = path.to_string();
        let mut dicts = load_monolithic_files(self.storage.as_ref(), &self.modules, std::slice::from_ref(&path)).await?;
        let entries = dicts.pop().ok_or_else(|| Error::Internal {
            message: format!("no record decoded from {}", path),
        })?;
        Ok(CheckpointRecord::from_entries(CheckpointFormat::Monolithic, entries))
    }

    /// Gather distributed-optimizer parameter state over every data and
    /// context replica; the first replica writes it
    async fn save_parameter_state(&self, root: &str, entry: TrackerEntry, optimizer: &dyn Optimizer) -> Result<()> {
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let topology = group.topology();
        let ranks = group.ranks();

        let local = bincode::serialize(&optimizer.parameter_state()?)?;
        let gathered = group
            .all_gather(GatherScope::DataParallelWithContext, Bytes::from(local))
            .await?;
        if ranks.data_with_context(&topology) != 0 {
            return Ok(());
        }

        let states = gathered
            .iter()
            .map(|bytes| bincode::deserialize::<StateDict>(bytes).map(StateValue::Map).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        let mut dict = StateDict::new();
        dict.insert(PARAMETER_STATE_KEY.to_string(), StateValue::List(states));

        let path = distributed_optimizer_path(root, entry, &ranks, &topology);
        ensure_directory_exists(storage, &path, true).await?;
        let size = storage.write(&path, MonolithicCodec::encode(&dict)?).await?;
        debug!(path = %path, size, "Distributed optimizer parameter state written");
        Ok(())
    }

    /// Restore this rank's distributed-optimizer parameter state; a missing
    /// file is skipped with a warning
    async fn load_parameter_state(&self, root: &str, entry: TrackerEntry, optimizer: &mut dyn Optimizer) -> Result<()> {
        let storage = self.storage.as_ref();
        let group = self.group.as_ref();
        let topology = group.topology();
        let ranks = group.ranks();

        let path = distributed_optimizer_path(root, entry, &ranks, &topology);
        if !storage.exists(&path).await? {
            warn!(path = %path, "Distributed optimizer parameter state not found, skipping");
            return Ok(());
        }

        let record = self.read_monolithic(&path).await?;
        let index = ranks.data_with_context(&topology);
        let state = record
            .get(PARAMETER_STATE_KEY)
            .and_then(StateValue::as_list)
            .and_then(|states| states.get(index))
            .and_then(StateValue::as_map)
            .ok_or_else(|| Error::MissingOptimizerState {
                checkpoint: path.clone(),
                key: format!("{}[{}]", PARAMETER_STATE_KEY, index),
            })?;
        optimizer.load_parameter_state(state)
    }

    /// Configured parallel sizes are persisted in records and must describe
    /// the live group
    fn check_topology(&self, args: &TrainingArgs) -> Result<()> {
        let configured = args.topology();
        let live = self.group.topology();
        if configured != live {
            return Err(Error::InvalidConfig {
                message: format!(
                    "configured parallelism {:?} does not match the process group {:?}",
                    configured, live
                ),
            });
        }
        Ok(())
    }

    fn report_failure(&self, operation: &str, e: &Error) {
        if !self.group.is_logging_rank() {
            return;
        }
        match e.operator_hint() {
            Some(hint) => error!(operation, error = %e, hint, "Checkpoint {} failed", operation),
            None => error!(operation, error = %e, "Checkpoint {} failed", operation),
        }
    }
}
