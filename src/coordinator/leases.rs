//! Lease table (spec.md §3/§5): every currently-allocated CI is leased
//! until it expires or is explicitly renewed. The weeder freezes
//! expiration globally while it holds a mark in flight so a CI it is
//! about to report as reachable cannot time out from under it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bitset::NameSet;

pub struct LeaseTable {
    ttl: Duration,
    frozen: AtomicBool,
    leases: Mutex<HashMap<u32, Instant>>,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            frozen: AtomicBool::new(false),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn expires_at(&self) -> Instant {
        Instant::now() + self.ttl
    }

    /// Grant (or regrant) a lease on `ci`, per `add_entry`'s "create a
    /// lease on the new CI".
    pub fn acquire(&self, ci: u32) {
        self.leases.lock().insert(ci, self.expires_at());
    }

    pub fn is_leased(&self, ci: u32) -> bool {
        match self.leases.lock().get(&ci) {
            Some(exp) => self.frozen.load(Ordering::Acquire) || Instant::now() < *exp,
            None => false,
        }
    }

    /// `renew_leases`: refresh every known CI's timer and report
    /// whether every requested CI was known and still leased.
    pub fn renew(&self, cis: &[u32]) -> bool {
        let mut all_known_and_leased = true;
        let mut table = self.leases.lock();
        let frozen = self.frozen.load(Ordering::Acquire);
        for &ci in cis {
            match table.get_mut(&ci) {
                Some(exp) => {
                    let still_leased = frozen || Instant::now() < *exp;
                    if !still_leased {
                        all_known_and_leased = false;
                    }
                    *exp = Instant::now() + self.ttl;
                }
                None => all_known_and_leased = false,
            }
        }
        all_known_and_leased
    }

    /// `start_mark`'s "freeze lease expiration".
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// `resume_lease_exp` / `weeder_recovering`'s "re-enable lease
    /// expiration".
    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// `get_leases`: a snapshot of every currently-leased CI.
    pub fn snapshot(&self) -> NameSet {
        let table = self.leases.lock();
        let frozen = self.frozen.load(Ordering::Acquire);
        let now = Instant::now();
        NameSet::from_indices(
            table
                .iter()
                .filter(|(_, exp)| frozen || now < **exp)
                .map(|(ci, _)| *ci),
        )
    }

    /// Drop every lease that has expired. A no-op while expiration is
    /// frozen, since nothing should be collectible during a mark.
    pub fn sweep_expired(&self) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        self.leases.lock().retain(|_, exp| now < *exp);
    }

    pub fn remove(&self, ci: u32) {
        self.leases.lock().remove(&ci);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_is_leased() {
        let t = LeaseTable::new(Duration::from_secs(60));
        assert!(!t.is_leased(1));
        t.acquire(1);
        assert!(t.is_leased(1));
    }

    #[test]
    fn expiration_and_freeze() {
        let t = LeaseTable::new(Duration::from_millis(10));
        t.acquire(1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!t.is_leased(1));

        t.acquire(2);
        t.freeze();
        std::thread::sleep(Duration::from_millis(30));
        assert!(t.is_leased(2));
        t.unfreeze();
        assert!(!t.is_leased(2));
    }

    #[test]
    fn renew_leases_reports_unknown_and_refreshes_known() {
        let t = LeaseTable::new(Duration::from_secs(60));
        t.acquire(1);
        assert!(!t.renew(&[1, 2]));
        assert!(t.renew(&[1]));
    }

    #[test]
    fn sweep_expired_is_noop_while_frozen() {
        let t = LeaseTable::new(Duration::from_millis(5));
        t.acquire(1);
        t.freeze();
        std::thread::sleep(Duration::from_millis(20));
        t.sweep_expired();
        assert!(t.is_leased(1));
    }
}
