//! On-disk encodings of checkpoint records
//!
//! Monolithic records are one file: a fixed binary header, a JSON metadata
//! block naming the serializer modules the payload needs, then a bincode body.
//!
//! Sharded records are a directory: `metadata.json`, `common.bin` holding
//! every non-sharded entry, and one file per owned shard.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use storage::{join, StorageBackend};
use tracing::{debug, info, instrument, warn};

use crate::format::ModuleTable;
use crate::state::{insert_at, split_shards, StateDict, StateValue};

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Monolithic file format version
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Serializer modules referenced by records this build writes
pub const SERIALIZER_MODULES: &[&str] = &["checkpoint.state", "checkpoint.rng", "runtime_core.config"];

pub const SHARDED_METADATA_FILENAME: &str = "metadata.json";
pub const COMMON_STATE_FILENAME: &str = "common.bin";

/// Newest sharded layout this build reads
pub const SHARDED_BACKEND_VERSION: u32 = 1;

const FLAG_HAS_ITERATION: u8 = 0b0000_0001;

// magic + version + iteration + flags + payload size + metadata length
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 1 + 8 + 4;

/// JSON block stored in every monolithic header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Serializer modules the payload references
    pub modules: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Decoded monolithic file header
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub version: u32,
    pub iteration: Option<u64>,
    pub payload_size: u64,
    pub metadata: RecordMetadata,
}

/// Single-file record encoding
pub struct MonolithicCodec;

impl MonolithicCodec {
    pub fn encode(dict: &StateDict) -> Result<Bytes> {
        Self::encode_with_modules(dict, SERIALIZER_MODULES)
    }

    /// Encode naming an explicit serializer module list, e.g. to reproduce
    /// files written by older builds
    pub fn encode_with_modules(dict: &StateDict, modules: &[&str]) -> Result<Bytes> {
        let payload = bincode::serialize(dict)?;
        let metadata = RecordMetadata {
            modules: modules.iter().map(|m| m.to_string()).collect(),
            created_at: Utc::now(),
        };
        let metadata_json = serde_json::to_vec(&metadata)?;
        let iteration = dict
            .get("iteration")
            .and_then(StateValue::as_int)
            .and_then(|i| u64::try_from(i).ok());

        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_json.len() + payload.len());
        buf.put_slice(&CHECKPOINT_MAGIC);
        buf.put_u32_le(CHECKPOINT_FORMAT_VERSION);
        buf.put_u64_le(iteration.unwrap_or(0));
        buf.put_u8(if iteration.is_some() { FLAG_HAS_ITERATION } else { 0 });
        buf.put_u64_le(payload.len() as u64);
        buf.put_u32_le(metadata_json.len() as u32);
        buf.put_slice(&metadata_json);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parse the header, returning it with the undecoded payload
    pub fn read_header(data: &Bytes, checkpoint: &str) -> Result<(RecordHeader, Bytes)> {
        let corrupted = |reason: &str| Error::CheckpointCorrupted {
            checkpoint: checkpoint.to_string(),
            reason: reason.to_string(),
        };

        let mut buf = data.clone();
        if buf.remaining() < FIXED_HEADER_LEN {
            return Err(corrupted("truncated header"));
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != CHECKPOINT_MAGIC {
            return Err(corrupted("invalid checkpoint magic"));
        }

        let version = buf.get_u32_le();
        if version != CHECKPOINT_FORMAT_VERSION {
            warn!(
                expected = CHECKPOINT_FORMAT_VERSION,
                found = version,
                checkpoint,
                "Checkpoint format version mismatch"
            );
        }

        let iteration = buf.get_u64_le();
        let flags = buf.get_u8();
        let payload_size = buf.get_u64_le();
        let metadata_len = buf.get_u32_le() as usize;

        if buf.remaining() < metadata_len {
            return Err(corrupted("truncated metadata"));
        }
        let metadata: RecordMetadata = serde_json::from_slice(&buf.split_to(metadata_len))?;

        if (buf.remaining() as u64) < payload_size {
            return Err(corrupted("truncated payload"));
        }
        let payload = buf.split_to(payload_size as usize);

        let header = RecordHeader {
            version,
            iteration: (flags & FLAG_HAS_ITERATION != 0).then_some(iteration),
            payload_size,
            metadata,
        };
        Ok((header, payload))
    }

    /// Decode a record, resolving its serializer modules through `modules`.
    ///
    /// # Errors
    /// [`Error::ModuleNotFound`] if the record names a module `modules`
    /// cannot resolve
    pub fn decode(data: &Bytes, checkpoint: &str, modules: &ModuleTable) -> Result<StateDict> {
        let (header, payload) = Self::read_header(data, checkpoint)?;
        for module in &header.metadata.modules {
            if modules.resolve(module).is_none() {
                return Err(Error::ModuleNotFound {
                    module: module.clone(),
                    checkpoint: checkpoint.to_string(),
                });
            }
        }
        Ok(bincode::deserialize(&payload)?)
    }
}

/// Content of `metadata.json` in a sharded checkpoint directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedMetadata {
    pub sharded_backend: String,
    pub sharded_backend_version: u32,
}

/// Directory-of-shards record encoding
pub struct ShardedCodec<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> ShardedCodec<'a> {
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// Write this rank's part of a sharded record.
    ///
    /// The coordinator writes `metadata.json` and `common.bin`; every rank
    /// writes the shards it is the main replica of.
    ///
    /// # Returns
    /// Number of shard files this rank wrote
    #[instrument(skip(self, dict))]
    pub async fn save(&self, dir: &str, dict: &StateDict, backend: (&str, u32), coordinator: bool) -> Result<usize> {
        let (common, shards) = split_shards(dict);

        if coordinator {
            let metadata = ShardedMetadata {
                sharded_backend: backend.0.to_string(),
                sharded_backend_version: backend.1,
            };
            self.storage
                .write(
                    &join(dir, SHARDED_METADATA_FILENAME),
                    Bytes::from(serde_json::to_vec_pretty(&metadata)?),
                )
                .await?;
            self.storage
                .write(&join(dir, COMMON_STATE_FILENAME), Bytes::from(bincode::serialize(&common)?))
                .await?;
        }

        let mut written = 0;
        for (path, shard) in shards.iter().filter(|(_, s)| s.is_main_replica()) {
            let data = shard.data.as_deref().ok_or_else(|| Error::Internal {
                message: format!("shard {} at {:?} has no content to save", shard.key, path),
            })?;
            self.storage
                .write(&join(dir, &shard.storage_name()), Bytes::from(bincode::serialize(data)?))
                .await?;
            written += 1;
        }

        debug!(dir, shards = shards.len(), written, coordinator, "Sharded record saved");
        Ok(written)
    }

    /// `metadata.json` of `dir`, or `None` if `dir` is not sharded
    pub async fn read_metadata(&self, dir: &str) -> Result<Option<ShardedMetadata>> {
        match self.storage.read(&join(dir, SHARDED_METADATA_FILENAME)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(Error::StoragePathNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every non-sharded entry of the record
    pub async fn load_common(&self, dir: &str) -> Result<StateDict> {
        let data = self.storage.read(&join(dir, COMMON_STATE_FILENAME)).await?;
        Ok(bincode::deserialize(&data)?)
    }

    /// Load the common entries plus every shard described by `template`
    #[instrument(skip(self, template))]
    pub async fn load(&self, dir: &str, template: &StateDict) -> Result<StateDict> {
        let metadata = self.read_metadata(dir).await?.ok_or_else(|| Error::CheckpointCorrupted {
            checkpoint: dir.to_string(),
            reason: format!("missing {}", SHARDED_METADATA_FILENAME),
        })?;
        if metadata.sharded_backend_version > SHARDED_BACKEND_VERSION {
            return Err(Error::UnsupportedFormatCombination {
                message: format!(
                    "sharded backend {} version {} is newer than supported version {}",
                    metadata.sharded_backend, metadata.sharded_backend_version, SHARDED_BACKEND_VERSION
                ),
            });
        }

        let mut record = self.load_common(dir).await?;
        let (_, shards) = split_shards(template);

        for (path, shard) in &shards {
            let file = join(dir, &shard.storage_name());
            let data = match self.storage.read(&file).await {
                Ok(data) => data,
                Err(Error::StoragePathNotFound { .. }) => {
                    return Err(Error::ShardNotFound {
                        checkpoint: dir.to_string(),
                        key: shard.key.clone(),
                        path: file,
                    })
                }
                Err(e) => return Err(e),
            };
            let value: StateValue = bincode::deserialize(&data)?;
            if !insert_at(&mut record, path, value) {
                return Err(Error::CheckpointCorrupted {
                    checkpoint: dir.to_string(),
                    reason: format!("shard {} collides with a common entry at {:?}", shard.key, path),
                });
            }
        }

        info!(
            dir,
            backend = %metadata.sharded_backend,
            shards = shards.len(),
            "Sharded record loaded"
        );
        Ok(record)
    }
}
