//! Versioned metadata storage with optimistic transactions.
//!
//! Every piece of mutable metadata (repos, branches, commit records,
//! commit/fileset bindings) lives behind a [`MetaStore`]. Mutations that
//! touch more than one logical key run inside a [`Txn`]: reads record the
//! version of every key they observed, writes are staged locally, and
//! [`MetaStore::in_txn`] commits the staged writes atomically only if none
//! of the observed versions moved in the meantime. A detected conflict
//! reruns the transaction body from the read step with bounded backoff.
//!
//! This is the same compare-and-swap discipline a branch store update
//! uses for a single head pointer, generalized to an arbitrary read set.
//!
//! Committed transactions bump a monotonically increasing sequence number
//! published through a `tokio::sync::watch` channel; blocking operations
//! (inspect with wait, flush, subscribe) re-check their condition on every
//! sequence change instead of polling.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Maximum number of times a transaction body is rerun on conflict.
const MAX_ATTEMPTS: u32 = 10;

/// Base sleep between conflicting attempts; doubles per attempt up to
/// [`MAX_BACKOFF`].
const BASE_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Error produced by [`MetaStore::in_txn`].
#[derive(Debug)]
pub enum TxnError<E> {
    /// The transaction body failed; the failure is surfaced unchanged and
    /// the transaction is not retried.
    Aborted(E),
    /// Optimistic conflicts persisted through every retry attempt.
    Conflict,
}

impl<E: fmt::Display> fmt::Display for TxnError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnError::Aborted(e) => write!(f, "transaction aborted: {e}"),
            TxnError::Conflict => write!(f, "transaction conflicted with concurrent writers"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TxnError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxnError::Aborted(e) => Some(e),
            TxnError::Conflict => None,
        }
    }
}

struct Versioned<V> {
    version: u64,
    value: V,
}

struct Inner<K, V> {
    records: HashMap<K, Versioned<V>>,
    seq: u64,
}

/// Shared, versioned key/value store for metadata records.
pub struct MetaStore<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    seq_tx: Arc<watch::Sender<u64>>,
}

impl<K, V> Clone for MetaStore<K, V> {
    fn clone(&self) -> Self {
        MetaStore {
            inner: self.inner.clone(),
            seq_tx: self.seq_tx.clone(),
        }
    }
}

impl<K, V> Default for MetaStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MetaStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        let (seq_tx, _) = watch::channel(0);
        MetaStore {
            inner: Arc::new(Mutex::new(Inner {
                records: HashMap::new(),
                seq: 0,
            })),
            seq_tx: Arc::new(seq_tx),
        }
    }

    /// Snapshot read of a single key outside any transaction.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner.records.get(key).map(|v| v.value.clone())
    }

    /// Snapshot of every record whose key satisfies `pred`.
    pub fn select<F>(&self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Subscribes to the commit sequence. The receiver wakes whenever any
    /// transaction commits.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    /// Runs `body` inside an optimistic transaction, retrying on conflict.
    pub async fn in_txn<T, E, F>(&self, mut body: F) -> Result<T, TxnError<E>>
    where
        F: FnMut(&mut Txn<'_, K, V>) -> Result<T, E>,
    {
        let mut backoff = BASE_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut txn = Txn {
                store: self,
                reads: HashMap::new(),
                writes: Vec::new(),
            };
            let out = body(&mut txn).map_err(TxnError::Aborted)?;
            if self.try_commit(txn) {
                return Ok(out);
            }
            debug!(attempt, "metadata transaction conflicted, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        Err(TxnError::Conflict)
    }

    fn try_commit(&self, txn: Txn<'_, K, V>) -> bool {
        let mut inner = self.inner.lock();
        for (key, seen) in &txn.reads {
            let current = inner.records.get(key).map(|v| v.version).unwrap_or(0);
            if current != *seen {
                return false;
            }
        }
        if txn.writes.is_empty() {
            return true;
        }
        inner.seq += 1;
        let version = inner.seq;
        for (key, value) in txn.writes {
            match value {
                Some(value) => {
                    inner.records.insert(key, Versioned { version, value });
                }
                None => {
                    inner.records.remove(&key);
                }
            }
        }
        let seq = inner.seq;
        drop(inner);
        // Receivers may be gone; the store itself does not care.
        let _ = self.seq_tx.send(seq);
        true
    }
}

/// One in-flight transaction: a recorded read set plus staged writes.
pub struct Txn<'s, K, V> {
    store: &'s MetaStore<K, V>,
    reads: HashMap<K, u64>,
    writes: Vec<(K, Option<V>)>,
}

impl<K, V> Txn<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Reads a key, observing staged writes first. Absent keys are
    /// recorded in the read set too, so a concurrent insert conflicts.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some((_, staged)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return staged.clone();
        }
        let inner = self.store.inner.lock();
        let (version, value) = match inner.records.get(key) {
            Some(v) => (v.version, Some(v.value.clone())),
            None => (0, None),
        };
        drop(inner);
        self.reads.entry(key.clone()).or_insert(version);
        value
    }

    /// Reads every record whose key satisfies `pred`, recording each hit
    /// in the read set.
    pub fn select<F>(&mut self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K) -> bool,
    {
        let snapshot: Vec<(K, u64, V)> = {
            let inner = self.store.inner.lock();
            inner
                .records
                .iter()
                .filter(|(k, _)| pred(k))
                .map(|(k, v)| (k.clone(), v.version, v.value.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(snapshot.len());
        for (key, version, value) in snapshot {
            self.reads.entry(key.clone()).or_insert(version);
            let value = match self.writes.iter().rev().find(|(k, _)| *k == key) {
                Some((_, staged)) => match staged {
                    Some(v) => v.clone(),
                    None => continue,
                },
                None => value,
            };
            out.push((key, value));
        }
        // Staged inserts for keys the store has not seen yet.
        for (key, staged) in &self.writes {
            if let Some(value) = staged {
                if pred(key) && !out.iter().any(|(k, _)| k == key) {
                    out.push((key.clone(), value.clone()));
                }
            }
        }
        out
    }

    /// Stages a write. Nothing is visible outside the transaction until
    /// commit.
    pub fn put(&mut self, key: K, value: V) {
        self.writes.push((key, Some(value)));
    }

    /// Stages a deletion.
    pub fn delete(&mut self, key: K) {
        self.writes.push((key, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec(u64);

    #[tokio::test]
    async fn writes_are_atomic() {
        let store: MetaStore<&'static str, Rec> = MetaStore::new();
        store
            .in_txn(|txn| {
                txn.put("a", Rec(1));
                txn.put("b", Rec(2));
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .expect("txn");
        assert_eq!(store.get(&"a"), Some(Rec(1)));
        assert_eq!(store.get(&"b"), Some(Rec(2)));
    }

    #[tokio::test]
    async fn conflicting_writer_forces_retry() {
        let store: MetaStore<&'static str, Rec> = MetaStore::new();
        store
            .in_txn(|txn| {
                txn.put("n", Rec(0));
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .expect("seed");

        let mut attempts = 0;
        let other = store.clone();
        store
            .in_txn(|txn| {
                attempts += 1;
                let cur = txn.get(&"n").expect("seeded");
                if attempts == 1 {
                    // Sneak a competing committed write in between this
                    // transaction's read and its commit.
                    let mut inner = other.inner.lock();
                    inner.seq += 1;
                    let version = inner.seq;
                    inner.records.insert(
                        "n",
                        Versioned {
                            version,
                            value: Rec(100),
                        },
                    );
                }
                txn.put("n", Rec(cur.0 + 1));
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .expect("txn");
        assert_eq!(attempts, 2);
        assert_eq!(store.get(&"n"), Some(Rec(101)));
    }

    #[tokio::test]
    async fn absent_reads_conflict_with_inserts() {
        let store: MetaStore<&'static str, Rec> = MetaStore::new();
        let mut attempts = 0;
        let other = store.clone();
        store
            .in_txn(|txn| {
                attempts += 1;
                let existing = txn.get(&"x");
                if attempts == 1 {
                    let mut inner = other.inner.lock();
                    inner.seq += 1;
                    let version = inner.seq;
                    inner.records.insert(
                        "x",
                        Versioned {
                            version,
                            value: Rec(7),
                        },
                    );
                }
                txn.put("x", Rec(existing.map(|r| r.0).unwrap_or(0) + 1));
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .expect("txn");
        assert_eq!(attempts, 2);
        assert_eq!(store.get(&"x"), Some(Rec(8)));
    }

    #[tokio::test]
    async fn watch_observes_commits() {
        let store: MetaStore<&'static str, Rec> = MetaStore::new();
        let mut rx = store.watch();
        let before = *rx.borrow();
        store
            .in_txn(|txn| {
                txn.put("k", Rec(1));
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .expect("txn");
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow() > before);
    }
}
