//! Cache server configuration.
//!
//! Field names mirror the Vesta `CacheConfigServer.H` knobs
//! (`[CacheServer]/FreePauseDur`, etc.) this server's ancestor exposed,
//! loaded the way `rusty-db`'s `Config`/`DatabaseConfig` are: a
//! `serde`-deserializable struct with a `Default`, then a few fields
//! (data directories) computed relative to the install directory at
//! startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the stable cache: `gran-NN/` directories and the two
    /// scalar files (`deleting`, `hit_filter`) live under here.
    pub stable_cache_root: PathBuf,
    /// Root of the four log directories.
    pub log_root: PathBuf,
    /// PK prefix length, in bytes, that determines MultiPKFile grouping.
    pub prefix_granularity: u8,
    /// Arc width, in bits, for the `gran-NN/<hex arcs>` path scheme.
    /// Never spans more than a byte so an arc never spans a word.
    pub arc_bits: u8,

    /// `[CacheServer]/MaxRunning` -- max concurrent MPK rewrites.
    pub max_running_rewrites: usize,
    /// `[CacheServer]/FlushWorkerCnt` -- size of the flush worker pool.
    pub flush_worker_count: usize,
    /// `[CacheServer]/MPKFileFlushNum` -- new-entry threshold that
    /// triggers an async flush of a VMultiPKFile.
    pub mpkfile_flush_threshold: usize,
    /// `[CacheServer]/MaxCacheLogCnt` -- cache-log entry count that
    /// triggers a background clean.
    pub max_cache_log_count: usize,

    /// `[CacheServer]/FreePauseDur` -- free/evict loop tick period.
    pub free_pause: Duration,
    /// `[CacheServer]/WeedPauseDur` -- pause between deletion-worker
    /// steps (used in tests to make interleavings reproducible).
    pub weed_pause: Duration,
    /// `[CacheServer]/FlushNewPeriodCnt` -- ticks of staleness before a
    /// VM with new entries is force-flushed.
    pub flush_new_period: u64,
    /// `[CacheServer]/PurgeWarmPeriodCnt` -- ticks of staleness before
    /// an unmodified VPK's warm entries are dropped.
    pub purge_warm_period: u64,
    /// `[CacheServer]/EvictPeriodCnt` -- ticks of staleness before an
    /// idle VPK is evicted from memory entirely.
    pub evict_period: u64,

    /// `[CacheServer]/FreeAggressively`.
    pub free_aggressively: bool,
    /// `[CacheServer]/ReadImmutable`.
    pub read_immutable: bool,
    /// `[CacheServer]/KeepNewOnFlush` -- keep freshly-flushed entries in
    /// the warm map rather than discarding them.
    pub keep_new_on_flush: bool,
    /// `[CacheServer]/KeepOldOnFlush` -- keep previously-warm entries in
    /// the warm map across a flush rather than discarding them.
    pub keep_old_on_flush: bool,

    /// Lease TTL; renewed by `renew_leases`/successful lookups.
    pub lease_ttl: Duration,

    /// `-noHits`: demote every lookup hit to a miss (diagnostic mode).
    pub no_hits: bool,

    pub host: String,
    pub port: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stable_cache_root: PathBuf::from("./data/cache"),
            log_root: PathBuf::from("./data/logs"),
            prefix_granularity: 2,
            arc_bits: 8,
            max_running_rewrites: num_cpus::get().max(1),
            flush_worker_count: 4,
            mpkfile_flush_threshold: 50,
            max_cache_log_count: 10_000,
            free_pause: Duration::from_secs(30),
            weed_pause: Duration::from_millis(0),
            flush_new_period: 20,
            purge_warm_period: 10,
            evict_period: 40,
            free_aggressively: false,
            read_immutable: false,
            keep_new_on_flush: true,
            keep_old_on_flush: true,
            lease_ttl: Duration::from_secs(600),
            no_hits: false,
            host: "127.0.0.1".to_string(),
            port: 9080,
        }
    }
}

impl CacheConfig {
    /// Parse a config previously rendered to JSON by the (external,
    /// per spec.md §1) CLI/config loader. The loader itself -- TOML
    /// parsing, env var overlay, `-debug`/`-noHits` flag wiring -- is
    /// out of this crate's scope; this is the seam it seralizes into.
    pub fn from_json_str(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = CacheConfig::default();
        assert!(c.flush_worker_count > 0);
        assert!(c.arc_bits <= 8);
        assert!(c.evict_period >= c.purge_warm_period);
    }
}
