//! Random generator state capture and restore
//!
//! A process owns four independent generator streams plus a tracker of named
//! streams used inside model-parallel regions. Restoring a snapshot puts every
//! stream back at the exact word it was captured at, so the next draws match
//! the draws the saving run would have made.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::{Error, GatherScope, ParallelRanks, ProcessGroup, Result};
use std::collections::BTreeMap;
use tracing::debug;

use crate::state::{ShardDescriptor, StateDict, StateValue};

pub const RNG_STATE_KEY: &str = "rng_state";
pub const HOST_RNG_KEY: &str = "random_rng_state";
pub const ARRAY_RNG_KEY: &str = "np_rng_state";
pub const FRAMEWORK_RNG_KEY: &str = "torch_rng_state";
pub const DEVICE_RNG_KEY: &str = "cuda_rng_state";
pub const TRACKER_RNG_KEY: &str = "rng_tracker_states";

/// Tracker stream used for tensor-parallel regions
pub const MODEL_PARALLEL_RNG: &str = "model-parallel-rng";

const MODEL_PARALLEL_SEED_OFFSET: u64 = 2718;
const ENCODED_LEN: usize = 32 + 8 + 16;

/// Exact position of one ChaCha stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

impl GeneratorState {
    pub fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    pub fn restore(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        rng
    }

    fn encode(&self) -> StateValue {
        let mut buf = Vec::with_capacity(ENCODED_LEN);
        buf.extend_from_slice(&self.seed);
        buf.extend_from_slice(&self.stream.to_le_bytes());
        buf.extend_from_slice(&self.word_pos.to_le_bytes());
        StateValue::Bytes(buf)
    }

    fn decode(value: &StateValue, key: &str, checkpoint: &str) -> Result<Self> {
        let corrupted = || Error::CheckpointCorrupted {
            checkpoint: checkpoint.to_string(),
            reason: format!("generator state {} is not a {}-byte blob", key, ENCODED_LEN),
        };
        let buf = value.as_bytes().filter(|b| b.len() == ENCODED_LEN).ok_or_else(corrupted)?;

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&buf[..32]);
        let mut stream = [0u8; 8];
        stream.copy_from_slice(&buf[32..40]);
        let mut word_pos = [0u8; 16];
        word_pos.copy_from_slice(&buf[40..]);

        Ok(Self {
            seed,
            stream: u64::from_le_bytes(stream),
            word_pos: u128::from_le_bytes(word_pos),
        })
    }
}

/// Named streams forked inside parallel regions
#[derive(Debug, Clone, Default)]
pub struct RngTracker {
    streams: BTreeMap<String, ChaCha8Rng>,
}

impl RngTracker {
    /// Register a new named stream
    pub fn add(&mut self, name: &str, seed: u64) -> Result<()> {
        if self.streams.contains_key(name) {
            return Err(Error::Internal {
                message: format!("rng stream {} already registered", name),
            });
        }
        self.streams.insert(name.to_string(), ChaCha8Rng::seed_from_u64(seed));
        Ok(())
    }

    /// Stream registered under `name`
    pub fn fork(&mut self, name: &str) -> Option<&mut ChaCha8Rng> {
        self.streams.get_mut(name)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn states(&self) -> BTreeMap<String, GeneratorState> {
        self.streams
            .iter()
            .map(|(name, rng)| (name.clone(), GeneratorState::capture(rng)))
            .collect()
    }

    /// Replace every stream with `states`
    pub fn set_states(&mut self, states: &BTreeMap<String, GeneratorState>) {
        self.streams = states
            .iter()
            .map(|(name, state)| (name.clone(), state.restore()))
            .collect();
    }
}

/// Every generator stream of one process
#[derive(Debug, Clone)]
pub struct RngStreams {
    /// Language-level generator
    pub host: ChaCha8Rng,
    /// Array-library generator
    pub array: ChaCha8Rng,
    /// Framework (CPU tensor) generator
    pub framework: ChaCha8Rng,
    /// Accelerator generator
    pub device: ChaCha8Rng,
    pub tracker: RngTracker,
}

impl RngStreams {
    /// Streams derived from one seed, with an empty tracker
    pub fn from_seed(seed: u64) -> Self {
        let stream = |id: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(id);
            rng
        };
        Self {
            host: stream(0),
            array: stream(1),
            framework: stream(2),
            device: stream(3),
            tracker: RngTracker::default(),
        }
    }

    /// Seed the streams of the process at `ranks`.
    ///
    /// Pipeline stages always get distinct seeds; data-parallel replicas only
    /// with `data_parallel_random_init`. The model-parallel tracker stream
    /// differs per tensor rank.
    pub fn for_rank(seed: u64, ranks: &ParallelRanks, data_parallel_random_init: bool) -> Result<Self> {
        let mut seed = seed + 100 * ranks.pipeline as u64;
        if data_parallel_random_init {
            seed += 10 * ranks.data as u64;
        }
        let mut streams = Self::from_seed(seed);
        streams
            .tracker
            .add(MODEL_PARALLEL_RNG, seed + MODEL_PARALLEL_SEED_OFFSET + ranks.tensor as u64)?;
        Ok(streams)
    }

    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot {
            host: GeneratorState::capture(&self.host),
            array: GeneratorState::capture(&self.array),
            framework: GeneratorState::capture(&self.framework),
            device: GeneratorState::capture(&self.device),
            tracker: self.tracker.states(),
        }
    }

    /// Restore in fixed order: host, array, framework, device, tracker
    pub fn restore(&mut self, snapshot: &RngSnapshot) {
        self.host = snapshot.host.restore();
        self.array = snapshot.array.restore();
        self.framework = snapshot.framework.restore();
        self.device = snapshot.device.restore();
        self.tracker.set_states(&snapshot.tracker);
    }
}

/// Captured position of every stream of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngSnapshot {
    pub host: GeneratorState,
    pub array: GeneratorState,
    pub framework: GeneratorState,
    pub device: GeneratorState,
    pub tracker: BTreeMap<String, GeneratorState>,
}

impl RngSnapshot {
    pub fn to_value(&self) -> StateValue {
        let mut dict = StateDict::new();
        dict.insert(HOST_RNG_KEY.to_string(), self.host.encode());
        dict.insert(ARRAY_RNG_KEY.to_string(), self.array.encode());
        dict.insert(FRAMEWORK_RNG_KEY.to_string(), self.framework.encode());
        dict.insert(DEVICE_RNG_KEY.to_string(), self.device.encode());
        let tracker = self
            .tracker
            .iter()
            .map(|(name, state)| (name.clone(), state.encode()))
            .collect();
        dict.insert(TRACKER_RNG_KEY.to_string(), StateValue::Map(tracker));
        StateValue::Map(dict)
    }

    /// Parse the snapshot keys out of `dict`.
    ///
    /// Used both for entries of the `rng_state` list and for legacy records
    /// that keep the same keys at their top level.
    pub fn from_dict(dict: &StateDict, checkpoint: &str) -> Result<Self> {
        let get = |key: &str| {
            dict.get(key).ok_or_else(|| Error::MissingRngState {
                checkpoint: checkpoint.to_string(),
                key: key.to_string(),
            })
        };
        let generator = |key: &str| get(key).and_then(|v| GeneratorState::decode(v, key, checkpoint));

        let host = generator(HOST_RNG_KEY)?;
        let array = generator(ARRAY_RNG_KEY)?;
        let framework = generator(FRAMEWORK_RNG_KEY)?;
        let device = generator(DEVICE_RNG_KEY)?;

        let tracker_value = get(TRACKER_RNG_KEY)?;
        let tracker_map = tracker_value.as_map().ok_or_else(|| Error::CheckpointCorrupted {
            checkpoint: checkpoint.to_string(),
            reason: format!("{} is not a map", TRACKER_RNG_KEY),
        })?;
        if tracker_map.is_empty() {
            return Err(Error::CorruptRngState {
                checkpoint: checkpoint.to_string(),
            });
        }
        let tracker = tracker_map
            .iter()
            .map(|(name, v)| GeneratorState::decode(v, name, checkpoint).map(|s| (name.clone(), s)))
            .collect::<Result<_>>()?;

        Ok(Self {
            host,
            array,
            framework,
            device,
            tracker,
        })
    }

    /// Entry `index` of a captured `rng_state` list
    pub fn select(value: &StateValue, index: usize, checkpoint: &str) -> Result<Self> {
        let missing = || Error::MissingRngState {
            checkpoint: checkpoint.to_string(),
            key: format!("{}[{}]", RNG_STATE_KEY, index),
        };
        let entry = value.as_list().and_then(|list| list.get(index)).ok_or_else(missing)?;
        let dict = entry.as_map().ok_or_else(missing)?;
        Self::from_dict(dict, checkpoint)
    }
}

/// Capture this process's RNG state for a checkpoint record.
///
/// The result is always a list. With `data_parallel_random_init` on a
/// multi-replica run it holds every data-parallel rank's snapshot, indexed by
/// data-parallel rank; otherwise only this rank's. For the sharded format the
/// list becomes one cell of a (pipeline, tensor) grid, written by the first
/// data/context replica only.
pub async fn capture(
    streams: &Mutex<RngStreams>,
    group: &dyn ProcessGroup,
    data_parallel_random_init: bool,
    sharded: bool,
) -> Result<StateValue> {
    let snapshot = streams.lock().snapshot().to_value();
    let topology = group.topology();

    let states = if group.is_distributed() && topology.data > 1 && data_parallel_random_init {
        let payload = Bytes::from(bincode::serialize(&snapshot)?);
        let gathered = group.all_gather(GatherScope::DataParallel, payload).await?;
        gathered
            .iter()
            .map(|bytes| bincode::deserialize(bytes).map_err(Error::from))
            .collect::<Result<Vec<StateValue>>>()?
    } else {
        vec![snapshot]
    };
    debug!(rank = group.rank(), snapshots = states.len(), sharded, "Captured rng state");

    let states = StateValue::List(states);
    if !sharded {
        return Ok(states);
    }

    let ranks = group.ranks();
    Ok(ShardDescriptor::object(
        RNG_STATE_KEY,
        vec![topology.pipeline, topology.tensor],
        vec![ranks.pipeline, ranks.tensor],
        ranks.data_with_context(&topology),
        states,
    )
    .into())
}

/// Put every stream back to `snapshot`
pub fn restore(streams: &Mutex<RngStreams>, snapshot: &RngSnapshot) {
    streams.lock().restore(snapshot);
}
