//! In-memory job locks: at most one holder per job id at any time.
//!
//! An optional timeout acts as a watchdog for crashed holders: a lock past its
//! timeout is treated as free on the next probe. The timeout never shortens
//! live work; the running future is unaffected.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    acquired_at: Instant,
    /// Zero means no watchdog.
    timeout: Duration,
}

impl LockEntry {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            acquired_at: Instant::now(),
            timeout: timeout.unwrap_or(Duration::ZERO),
        }
    }

    fn expired(&self) -> bool {
        !self.timeout.is_zero() && self.acquired_at.elapsed() >= self.timeout
    }
}

/// Mutual exclusion keyed by job id.
///
/// `acquire`/`release` are non-blocking; [`JobLock::with_lock`] runs a future
/// under the lock and guarantees release on all exit paths.
#[derive(Default)]
pub struct JobLock {
    entries: DashMap<String, LockEntry>,
}

impl JobLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `job_id` if it is free (or the previous holder's
    /// watchdog expired). Returns whether the lock was taken.
    pub fn acquire(&self, job_id: &str, timeout: Option<Duration>) -> bool {
        match self.entries.entry(job_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(LockEntry::new(timeout));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry::new(timeout));
                true
            }
        }
    }

    /// Releases the lock. Returns whether an entry existed.
    pub fn release(&self, job_id: &str) -> bool {
        self.entries.remove(job_id).is_some()
    }

    /// Whether `job_id` is currently held. Expired entries are purged here and
    /// reported as free.
    pub fn is_locked(&self, job_id: &str) -> bool {
        if let Some(entry) = self.entries.get(job_id) {
            if !entry.expired() {
                return true;
            }
        } else {
            return false;
        }
        self.entries.remove_if(job_id, |_, e| e.expired());
        self.entries.contains_key(job_id)
    }

    /// Releases every held lock. Used by scheduler shutdown.
    pub fn release_all(&self) {
        self.entries.clear();
    }

    /// Runs `f` under the lock. Returns `None` without running `f` when the
    /// lock is already held. The lock is released when the guard drops, so
    /// early returns and errors inside `f` cannot leak it.
    pub async fn with_lock<T, F, Fut>(
        &self,
        job_id: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(job_id, timeout) {
            return None;
        }
        let _guard = ReleaseGuard {
            lock: self,
            job_id: job_id.to_string(),
        };
        Some(f().await)
    }
}

/// Guard that releases a held lock on drop.
pub(crate) struct ReleaseGuard<'a> {
    pub(crate) lock: &'a JobLock,
    pub(crate) job_id: String,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_until_release() {
        let lock = JobLock::new();
        assert!(lock.acquire("j", None));
        assert!(!lock.acquire("j", None));
        assert!(lock.is_locked("j"));
        assert!(lock.release("j"));
        assert!(!lock.is_locked("j"));
        assert!(lock.acquire("j", None));
    }

    #[test]
    fn release_reports_missing_entry() {
        let lock = JobLock::new();
        assert!(!lock.release("nope"));
    }

    #[test]
    fn distinct_ids_do_not_interfere() {
        let lock = JobLock::new();
        assert!(lock.acquire("a", None));
        assert!(lock.acquire("b", None));
        assert!(lock.is_locked("a"));
        assert!(lock.is_locked("b"));
    }

    #[test]
    fn expired_entry_is_purged_and_relockable() {
        let lock = JobLock::new();
        assert!(lock.acquire("j", Some(Duration::from_millis(1))));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!lock.is_locked("j"));
        assert!(lock.acquire("j", None));
    }

    #[test]
    fn concurrent_acquire_admits_exactly_one() {
        let lock = std::sync::Arc::new(JobLock::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || lock.acquire("j", None)));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn with_lock_releases_on_all_paths() {
        let lock = JobLock::new();
        let ran = lock.with_lock("j", None, || async { 42 }).await;
        assert_eq!(ran, Some(42));
        assert!(!lock.is_locked("j"));

        // Held lock: closure must not run.
        assert!(lock.acquire("j", None));
        let skipped = lock.with_lock("j", None, || async { 1 }).await;
        assert_eq!(skipped, None);
        assert!(lock.is_locked("j"));
    }
}
