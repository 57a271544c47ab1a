//! Core type definitions for checkpointing a partitioned training run

use serde::{Deserialize, Serialize};
use std::fmt;

/// Training iteration counter
pub type Iteration = u64;

/// Global rank of a process in the job
pub type GlobalRank = usize;

/// Sizes of every parallelism axis of a run.
///
/// Global ranks are laid out tensor-fastest: `tp`, then `cp`, then `dp`, then
/// `pp`. Expert parallelism splits the data-parallel axis and is not a factor
/// of the world size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParallelTopology {
    pub tensor: usize,
    pub pipeline: usize,
    pub context: usize,
    pub data: usize,
    pub expert: usize,
}

impl Default for ParallelTopology {
    fn default() -> Self {
        Self::single()
    }
}

impl ParallelTopology {
    /// One process, no parallelism
    pub fn single() -> Self {
        Self {
            tensor: 1,
            pipeline: 1,
            context: 1,
            data: 1,
            expert: 1,
        }
    }

    /// Total number of processes
    pub fn world_size(&self) -> usize {
        self.tensor * self.pipeline * self.context * self.data
    }

    /// Decompose a global rank into per-axis ranks
    pub fn ranks_of(&self, rank: GlobalRank) -> ParallelRanks {
        let tensor = rank % self.tensor;
        let rest = rank / self.tensor;
        let context = rest % self.context;
        let rest = rest / self.context;
        let data = rest % self.data;
        let pipeline = rest / self.data;

        ParallelRanks {
            global: rank,
            tensor,
            pipeline,
            context,
            data,
            expert: data % self.expert,
        }
    }

    /// Global rank for the given per-axis ranks
    pub fn global_rank(&self, tensor: usize, pipeline: usize, context: usize, data: usize) -> GlobalRank {
        tensor + self.tensor * (context + self.context * (data + self.data * pipeline))
    }
}

/// One process's identity along every parallelism axis
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ParallelRanks {
    pub global: GlobalRank,
    pub tensor: usize,
    pub pipeline: usize,
    pub context: usize,
    pub data: usize,
    pub expert: usize,
}

impl ParallelRanks {
    /// Data-parallel rank counting context-parallel replicas as well
    pub fn data_with_context(&self, topology: &ParallelTopology) -> usize {
        self.data * topology.context + self.context
    }

    /// Rank within the data-parallel group that holds the same experts.
    ///
    /// Zero identifies the process that writes monolithic model files for its
    /// (tensor, pipeline, expert) coordinate.
    pub fn data_modulo_expert(&self, topology: &ParallelTopology) -> usize {
        (self.data / topology.expert) * topology.context + self.context
    }
}

/// On-disk layout of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CheckpointFormat {
    /// One dense file per model-parallel rank
    Monolithic,

    /// Directory of shards plus reconstruction metadata
    Sharded,

    /// Monolithic model plus one optimizer file per data/context-parallel rank
    Zero2,
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointFormat::Monolithic => write!(f, "monolithic"),
            CheckpointFormat::Sharded => write!(f, "sharded"),
            CheckpointFormat::Zero2 => write!(f, "zero2"),
        }
    }
}

/// How distributed-optimizer state is split inside a sharded checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptimizerShardingType {
    /// Every data-parallel rank writes its own bucket range
    FullyShardedBucketSpace,

    /// Data-parallel rank zero gathers and writes, and scatters on load
    DpZeroGatherScatter,
}

impl OptimizerShardingType {
    /// Sharding type selected by the fully-parallel-save flag
    pub fn from_fully_parallel_save(fully_parallel: bool) -> Self {
        if fully_parallel {
            OptimizerShardingType::FullyShardedBucketSpace
        } else {
            OptimizerShardingType::DpZeroGatherScatter
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerShardingType::FullyShardedBucketSpace => "fully_sharded_bucket_space",
            OptimizerShardingType::DpZeroGatherScatter => "dp_zero_gather_scatter",
        }
    }
}

/// Live consumed-sample counters of a run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleCounters {
    pub consumed_train_samples: u64,
    pub consumed_valid_samples: u64,
}

impl SampleCounters {
    pub fn is_zero(&self) -> bool {
        self.consumed_train_samples == 0 && self.consumed_valid_samples == 0
    }
}
