//! Read-only cache-state inspection (§4.11 `get_cache_state`; §12's
//! `VCacheStats`-equivalent, grounded on Vesta's `progs/VCacheStats`
//! walking `StatMPKFile`/`StatPKFile`/`StatCount`).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::fp::Fingerprint;

#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Stats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Snapshot returned by `get_cache_state`: per-process telemetry plus
/// the PKFile/entry counts a `VCacheStats` run would report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheState {
    pub host: String,
    pub port: u16,
    pub instance_fp: Fingerprint,
    pub version: String,
    pub vm_count: usize,
    pub vpk_count: usize,
    pub total_entries: usize,
    pub used_ci_count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_filter_cardinality: usize,
    pub deleting: bool,
}
