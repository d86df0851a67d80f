//! Background TTL lease renewal for temporary filesets.
//!
//! A [`Renewer`] owns a set of fileset ids and a background task that
//! renews each of them at half-TTL cadence for as long as the renewer is
//! alive. Dropping the last handle aborts the task; renewal is the only
//! external mutation permitted on a temporary fileset.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use super::Storage;
use crate::id::FilesetId;

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps a set of temporary filesets alive while writes are in flight.
#[derive(Clone)]
pub struct Renewer {
    ids: Arc<Mutex<HashSet<FilesetId>>>,
    _task: Arc<AbortOnDrop>,
}

impl Renewer {
    /// Spawns the renewal task. Must be called within a tokio runtime.
    pub fn new(storage: Storage, ttl: Duration) -> Self {
        let ids: Arc<Mutex<HashSet<FilesetId>>> = Arc::new(Mutex::new(HashSet::new()));
        let task_ids = ids.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl / 2);
            // The first tick completes immediately; skip it so renewals
            // start one interval in.
            tick.tick().await;
            loop {
                tick.tick().await;
                let snapshot: Vec<FilesetId> = task_ids.lock().iter().copied().collect();
                for id in snapshot {
                    if let Err(e) = storage.touch(&id, ttl) {
                        warn!(%id, error = %e, "failed to renew fileset");
                    }
                }
            }
        });
        Renewer {
            ids,
            _task: Arc::new(AbortOnDrop(handle)),
        }
    }

    /// Adds an id to the kept-alive set.
    pub fn add(&self, id: FilesetId) {
        self.ids.lock().insert(id);
    }

    /// Stops renewing an id (for example once it is pinned).
    pub fn remove(&self, id: &FilesetId) {
        self.ids.lock().remove(id);
    }

    /// Snapshot of the ids currently kept alive.
    pub fn ids(&self) -> Vec<FilesetId> {
        self.ids.lock().iter().copied().collect()
    }
}

/// Runs `f` with a renewer whose lifetime is scoped to the call; the
/// renewal task stops when the returned future completes.
pub async fn with_renewer<T, F, Fut>(storage: &Storage, ttl: Duration, f: F) -> T
where
    F: FnOnce(Renewer) -> Fut,
    Fut: Future<Output = T>,
{
    let renewer = Renewer::new(storage.clone(), ttl);
    f(renewer).await
}
