use super::stats::PipelineStats;
use crate::cache::CacheStats;
use crate::queue::QueueSnapshot;
use crate::worker::PoolSnapshot;

/// Runtime facts about a controller for metrics collectors and admission decisions.
///
/// Facts only, no policy: queue depth, running handlers, free permits, tracked rate-limit keys,
/// cache occupancy and the terminal-state counters.
#[derive(Debug, Clone)]
pub struct PipelineSignals {
    pub accepting: bool,
    pub queue: QueueSnapshot,
    pub pool: PoolSnapshot,
    pub rate_limit_keys: usize,
    /// Raw entry count, stale entries not yet purged included.
    pub cache_entries: usize,
    pub cache: CacheStats,
    pub stats: PipelineStats,
}
