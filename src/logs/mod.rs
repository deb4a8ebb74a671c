//! The four write-ahead logs (component H, spec.md §4.9 commit order):
//! used-CI log, graph log, cache log, and empty-PK log, plus the
//! segment machinery they share and the two atomic scalar files that
//! round out the durable cache-wide state.

pub mod cache_log;
pub mod empty_pk_log;
pub mod graph_log;
pub mod scalars;
pub mod segment;
pub mod used_ci_log;

pub use cache_log::{CacheLog, CacheLogRecord};
pub use empty_pk_log::EmptyPkLog;
pub use graph_log::{GraphLog, GraphLogRecord};
pub use segment::SegmentLog;
pub use used_ci_log::{next_avail, UsedCiLog, UsedCiOp};
