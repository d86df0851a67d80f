//! Background storage GC, gated on a distributed lock.
//!
//! Exactly one process in a deployment should sweep storage. The
//! [`Master`] runs mark-and-sweep on a fixed cadence, taking its lock
//! around each pass and releasing it in between; everything bound to a
//! finished commit is marked, everything else expires by TTL.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::fileset::GcStats;

use super::{commitstore, Repository};

/// Mutual exclusion seam for sweep leadership. The guard holds the lock
/// until dropped.
pub trait DistributedLock: Send + Sync + 'static {
    type Guard: Send + 'static;

    fn acquire(&self) -> impl Future<Output = Self::Guard> + Send;
}

/// Lock for single-process deployments and tests.
#[derive(Clone, Default)]
pub struct InProcessLock(Arc<Mutex<()>>);

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistributedLock for InProcessLock {
    type Guard = OwnedMutexGuard<()>;

    fn acquire(&self) -> impl Future<Output = Self::Guard> + Send {
        let lock = self.0.clone();
        async move { lock.lock_owned().await }
    }
}

/// The sweep loop.
pub struct Master<L> {
    repo: Repository,
    lock: L,
    interval: Duration,
}

impl<L: DistributedLock> Master<L> {
    pub fn new(repo: Repository, lock: L, interval: Duration) -> Self {
        Master {
            repo,
            lock,
            interval,
        }
    }

    /// Sweeps forever on the configured cadence. Each pass waits for
    /// the lock, sweeps, and releases it again. Never returns; run it
    /// on its own task and abort the task to stop.
    pub async fn run(self) -> Infallible {
        info!(interval = ?self.interval, "storage gc master running");
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tick.tick().await;
            let _guard = self.lock.acquire().await;
            self.sweep();
        }
    }

    /// One mark-and-sweep pass over storage. Commit bindings are the GC
    /// roots.
    pub fn sweep(&self) -> GcStats {
        let pinned = commitstore::pinned(self.repo.meta());
        self.repo.storage().gc(&pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sweep_keeps_bindings_and_drops_expired() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = super::super::Branch::new("data", "main");
        repo.create_branch(&main, None, &[], None).await.unwrap();
        let commit = repo
            .put_file(&super::super::Commit::new("data", "main"), "/kept", "k")
            .await
            .unwrap();

        // An orphan temporary fileset, already lapsed.
        let orphan = repo
            .storage()
            .create(Vec::new(), Some(Duration::from_millis(1)));

        let master = Master::new(repo.clone(), InProcessLock::new(), Duration::from_secs(60));
        let pinned = commitstore::pinned(repo.meta());
        let stats = repo
            .storage()
            .gc_at(Instant::now() + Duration::from_secs(1), &pinned);
        assert!(stats.filesets_deleted >= 1);
        assert!(!repo.storage().contains(&orphan));
        assert_eq!(&repo.get_file(&commit, "/kept").unwrap()[..], b"k");

        // A direct sweep right after reclaims nothing further.
        assert_eq!(master.sweep(), GcStats::default());
    }

    #[tokio::test]
    async fn leadership_is_exclusive() {
        let repo = Repository::new();
        let lock = InProcessLock::new();
        let held = lock.acquire().await;

        let orphan = repo
            .storage()
            .create(Vec::new(), Some(Duration::from_millis(1)));
        let master = Master::new(repo.clone(), lock.clone(), Duration::from_millis(10));
        let task = tokio::spawn(master.run());

        // The standby never sweeps while another holder has the lock.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(repo.storage().contains(&orphan));

        drop(held);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!repo.storage().contains(&orphan));

        // The lock is free between passes; a new holder pauses sweeping
        // until it lets go.
        let regained = lock.acquire().await;
        let late = repo
            .storage()
            .create(Vec::new(), Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(repo.storage().contains(&late));

        drop(regained);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!repo.storage().contains(&late));
        task.abort();
    }
}
