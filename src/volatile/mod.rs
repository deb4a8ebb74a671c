//! Components F & G: the in-memory working set for cache lookups.
//! `vpk` is one PK's volatile state (spec.md §4.2); `vmulti` is the
//! set of VPKs sharing a prefix plus the flush coordinator that
//! serializes rewrites of the MultiPKFile they live under (§4.5).

pub mod vmulti;
pub mod vpk;

pub use vmulti::VMultiPKFile;
pub use vpk::{LookupClass, LookupOutcome, PendingEntry, VolatilePKFile, VpkChkpt};
