//! fncached -- the durable function-memoization cache server for a
//! purely functional build system.
//!
//! See `SPEC_FULL.md` at the repository root for the module map. The
//! four tightly-coupled subsystems named there (lookup engine,
//! MultiPKFile rewrite engine, write-ahead logging/recovery, and the
//! weeder protocol) live under `pkfile`/`multipkfile`/`volatile`,
//! `logs`, and `coordinator::weeder` respectively.

pub mod bitset;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod fp;
pub mod intintmap;
pub mod logs;
pub mod multipkfile;
pub mod pkfile;
pub mod recovery;
pub mod volatile;

pub use config::CacheConfig;
pub use coordinator::Coordinator;
pub use error::{CacheError, Result};
pub use fp::Fingerprint;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
