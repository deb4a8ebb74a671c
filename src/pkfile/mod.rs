//! Component D: stable PKFile codec -- the on-disk layout of a group of
//! entries sharing a PK, and the `update` logic a rewrite applies to
//! it (spec.md §4.3).

pub mod names;
pub mod stable;

pub use names::CompactNames;
pub use stable::{CfpGroup, CfpHeaderType, StablePKFile, UpdateOutcome};
