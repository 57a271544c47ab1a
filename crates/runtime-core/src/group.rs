//! Process-group collaborator
//!
//! Checkpointing only needs rank queries, the "active virtual pipeline stage"
//! switch and three collectives. `LocalProcessGroup` implements them for a
//! world of tasks sharing one address space, which is what single-process runs
//! and the multi-rank tests use.

use crate::types::{GlobalRank, ParallelRanks, ParallelTopology};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::{debug, trace};

/// Rank queries and collectives used by checkpoint save/load
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// False when running as a lone process with no collectives set up
    fn is_distributed(&self) -> bool;

    /// Sizes of every parallelism axis
    fn topology(&self) -> ParallelTopology;

    /// This process's rank on every axis
    fn ranks(&self) -> ParallelRanks;

    /// Global rank of this process
    fn rank(&self) -> GlobalRank {
        self.ranks().global
    }

    /// Rank that prints user-facing progress messages
    fn is_logging_rank(&self) -> bool {
        !self.is_distributed() || self.rank() == 0
    }

    /// Rank that prints per-iteration training summaries
    fn is_last_rank(&self) -> bool {
        !self.is_distributed() || self.rank() + 1 == self.topology().world_size()
    }

    /// Select which virtual pipeline stage subsequent model calls refer to
    fn set_virtual_pipeline_rank(&self, stage: usize);

    /// Block until every process in the job arrives
    async fn barrier(&self) -> Result<()>;

    /// Maximum of `value` across every process in the job
    async fn all_reduce_max(&self, value: u64) -> Result<u64>;

    /// Gather `payload` from every member of this process's `scope` group,
    /// indexed by the member's rank within that group
    async fn all_gather(&self, scope: GatherScope, payload: Bytes) -> Result<Vec<Bytes>>;
}

/// Replica groups a gather can span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatherScope {
    /// Ranks sharing (tensor, pipeline, context), indexed by data rank
    DataParallel,

    /// Ranks sharing (tensor, pipeline), indexed by
    /// [`ParallelRanks::data_with_context`]
    DataParallelWithContext,
}

impl GatherScope {
    fn size(&self, topology: &ParallelTopology) -> usize {
        match self {
            GatherScope::DataParallel => topology.data,
            GatherScope::DataParallelWithContext => topology.data * topology.context,
        }
    }

    fn index(&self, ranks: &ParallelRanks, topology: &ParallelTopology) -> usize {
        match self {
            GatherScope::DataParallel => ranks.data,
            GatherScope::DataParallelWithContext => ranks.data_with_context(topology),
        }
    }

    /// Global rank of the group's first member, which names the group
    fn leader(&self, ranks: &ParallelRanks, topology: &ParallelTopology) -> GlobalRank {
        match self {
            GatherScope::DataParallel => topology.global_rank(ranks.tensor, ranks.pipeline, ranks.context, 0),
            GatherScope::DataParallelWithContext => topology.global_rank(ranks.tensor, ranks.pipeline, 0, 0),
        }
    }
}

/// State shared by every member of a local world
struct SharedWorld {
    topology: ParallelTopology,
    barrier: Barrier,
    gathers: Mutex<HashMap<(u64, GatherScope, GlobalRank), Vec<Option<Bytes>>>>,
    maxima: Mutex<HashMap<u64, u64>>,
}

/// In-process implementation of [`ProcessGroup`]
pub struct LocalProcessGroup {
    shared: Arc<SharedWorld>,
    ranks: ParallelRanks,
    distributed: bool,

    /// Collective sequence number; every member issues collectives in the
    /// same order, so equal numbers identify the same collective
    sequence: AtomicU64,

    virtual_stage: Mutex<Option<usize>>,
    stage_history: Mutex<Vec<usize>>,
}

impl LocalProcessGroup {
    /// A lone, non-distributed process
    pub fn single() -> Self {
        let topology = ParallelTopology::single();
        Self::member(Self::shared(topology), topology.ranks_of(0), false)
    }

    /// One handle per rank of a world with the given topology
    pub fn world(topology: ParallelTopology) -> Vec<Self> {
        let shared = Self::shared(topology);
        (0..topology.world_size())
            .map(|rank| Self::member(shared.clone(), topology.ranks_of(rank), true))
            .collect()
    }

    fn shared(topology: ParallelTopology) -> Arc<SharedWorld> {
        Arc::new(SharedWorld {
            topology,
            barrier: Barrier::new(topology.world_size()),
            gathers: Mutex::new(HashMap::new()),
            maxima: Mutex::new(HashMap::new()),
        })
    }

    fn member(shared: Arc<SharedWorld>, ranks: ParallelRanks, distributed: bool) -> Self {
        Self {
            shared,
            ranks,
            distributed,
            sequence: AtomicU64::new(0),
            virtual_stage: Mutex::new(None),
            stage_history: Mutex::new(Vec::new()),
        }
    }

    /// Currently selected virtual pipeline stage
    pub fn virtual_pipeline_rank(&self) -> Option<usize> {
        *self.virtual_stage.lock()
    }

    /// Every stage selection made so far, in call order
    pub fn stage_history(&self) -> Vec<usize> {
        self.stage_history.lock().clone()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.shared.barrier.wait().await;
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn is_distributed(&self) -> bool {
        self.distributed
    }

    fn topology(&self) -> ParallelTopology {
        self.shared.topology
    }

    fn ranks(&self) -> ParallelRanks {
        self.ranks
    }

    fn set_virtual_pipeline_rank(&self, stage: usize) {
        *self.virtual_stage.lock() = Some(stage);
        self.stage_history.lock().push(stage);
    }

    async fn barrier(&self) -> Result<()> {
        if !self.distributed {
            return Ok(());
        }
        trace!(rank = self.ranks.global, "Entering barrier");
        self.wait().await;
        Ok(())
    }

    async fn all_reduce_max(&self, value: u64) -> Result<u64> {
        if !self.distributed {
            return Ok(value);
        }

        let seq = self.next_sequence();
        self.shared
            .maxima
            .lock()
            .entry(seq)
            .and_modify(|max| *max = (*max).max(value))
            .or_insert(value);

        self.wait().await;
        let max = self.shared.maxima.lock().get(&seq).copied();
        self.wait().await;

        if self.ranks.global == 0 {
            self.shared.maxima.lock().remove(&seq);
        }

        max.ok_or_else(|| Error::Collective {
            operation: "all_reduce_max".to_string(),
            message: format!("no contribution recorded for collective {}", seq),
        })
    }

    async fn all_gather(&self, scope: GatherScope, payload: Bytes) -> Result<Vec<Bytes>> {
        if !self.distributed {
            return Ok(vec![payload]);
        }

        let topology = self.shared.topology;
        let seq = self.next_sequence();
        let group = scope.leader(&self.ranks, &topology);
        let index = scope.index(&self.ranks, &topology);
        let key = (seq, scope, group);

        self.shared
            .gathers
            .lock()
            .entry(key)
            .or_insert_with(|| vec![None; scope.size(&topology)])[index] = Some(payload);

        self.wait().await;
        let gathered: Option<Vec<Bytes>> = self
            .shared
            .gathers
            .lock()
            .get(&key)
            .and_then(|slots| slots.iter().cloned().collect());
        self.wait().await;

        if index == 0 {
            self.shared.gathers.lock().remove(&key);
        }

        debug!(
            rank = self.ranks.global,
            group = group,
            ?scope,
            "All-gather complete"
        );

        gathered.ok_or_else(|| Error::Collective {
            operation: "all_gather".to_string(),
            message: format!("{:?} group {} did not fill every slot", scope, group),
        })
    }
}

/// Shared handle to a process group
pub type ProcessGroupHandle = Arc<dyn ProcessGroup>;
