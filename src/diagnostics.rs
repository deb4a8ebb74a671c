//! Structured invariant-violation diagnostics.
//!
//! Per spec.md §7, an internal invariant violation (used-CI not set on
//! hit, evicted VPK observed during rewrite, `imap` key outside name
//! set, ...) is fatal: the core does not attempt to continue. DESIGN
//! NOTES §9 says to model this as a panic, not a recoverable `Result`.
//! This module centralizes that so every call site produces the same
//! shape of diagnostic (timestamped, naming the PK/CI involved), the
//! way `rusty-db` threads `tracing::error!` through its fault paths
//! before surfacing an error.

use crate::fp::Fingerprint;

/// Abort the process with a diagnostic naming the PK and CI involved,
/// per §7's "naming the PK and CI" requirement.
#[track_caller]
pub fn invariant_violation(what: &str, pk: Option<Fingerprint>, ci: Option<u32>) -> ! {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    tracing::error!(
        target: "fncached::invariant",
        timestamp = now,
        pk = ?pk,
        ci = ?ci,
        "invariant violation: {what}"
    );
    panic!(
        "fncached: invariant violation at t={now}: {what} (pk={pk:?}, ci={ci:?})"
    );
}

/// Abort on an unrecoverable commit-path I/O failure (log write,
/// stable write, or rename failure), per §7 "Log write failure /
/// stable write failure / rename failure ... fatal: log and abort."
#[track_caller]
pub fn fatal_io(what: &str, err: &dyn std::error::Error) -> ! {
    tracing::error!(target: "fncached::fatal_io", error = %err, "{what}");
    panic!("fncached: fatal I/O failure: {what}: {err}");
}
