//! The fileset storage engine.
//!
//! A fileset is an immutable, content-addressed set of path-indexed
//! entries, identified by a 32 character hex token. Writers buffer
//! appends and deletes and seal them into a new fileset on close; reads
//! compose lazy transforms over a k-way merge of existing filesets; and
//! compaction persists the merged view as a single new fileset.
//!
//! Filesets start out temporary: they carry a TTL and are deleted by the
//! GC sweep unless renewed or pinned. Binding a fileset to a finished
//! commit pins it; it then lives until the owning commit is deleted.
//!
//! File content itself lives behind the [`ContentStore`] seam, keyed by
//! blake3 hash. The in-memory implementation is the default; object
//! store backends plug in at the same seam without touching the engine.

pub mod diff;
pub mod index;
pub mod reader;
pub mod renew;
pub mod writer;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use crate::id::FilesetId;

pub use diff::{DiffEntry, Differ};
pub use index::{clean_path, ContentHash, Entry, EntryBody};
pub use reader::{
    DirInserter, EntryStream, IndexFilter, IndexMapper, IndexResolver, MergeReader,
};
pub use renew::{with_renewer, Renewer};
pub use writer::{UnorderedWriter, Writer};

/// Smallest TTL a caller may request.
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// TTL given to temporary filesets that do not ask for one explicitly.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Largest TTL a caller may request.
pub const MAX_TTL: Duration = Duration::from_secs(30 * 60);

/// Storage engine errors.
#[derive(Debug)]
pub enum Error {
    /// The named fileset does not exist (or already expired).
    FilesetNotFound(FilesetId),
    /// An entry references content the content store no longer holds.
    ContentMissing(ContentHash),
    /// A sorted writer received paths out of order.
    OutOfOrder { prev: String, next: String },
    /// A TTL outside `[MIN_TTL, MAX_TTL]`.
    TtlOutOfRange(Duration),
    /// A fileset token that is not a 32 character hex id.
    InvalidFilesetId(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FilesetNotFound(id) => write!(f, "fileset {id} not found"),
            Error::ContentMissing(hash) => write!(f, "content {hash} missing from store"),
            Error::OutOfOrder { prev, next } => {
                write!(f, "append out of order: {next:?} after {prev:?}")
            }
            Error::TtlOutOfRange(ttl) => write!(
                f,
                "ttl ({}ms) must be between {}s and {}s",
                ttl.as_millis(),
                MIN_TTL.as_secs(),
                MAX_TTL.as_secs()
            ),
            Error::InvalidFilesetId(token) => write!(f, "invalid fileset id ({token})"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Content-addressed blob storage seam.
pub trait ContentStore: Send + Sync {
    fn put(&self, hash: ContentHash, data: Bytes);
    fn get(&self, hash: &ContentHash) -> Option<Bytes>;
    fn delete(&self, hash: &ContentHash);
    fn hashes(&self) -> Vec<ContentHash>;
}

/// Default in-memory content store.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentHash, Bytes>>,
}

impl ContentStore for MemoryContentStore {
    fn put(&self, hash: ContentHash, data: Bytes) {
        self.blobs.lock().insert(hash, data);
    }

    fn get(&self, hash: &ContentHash) -> Option<Bytes> {
        self.blobs.lock().get(hash).cloned()
    }

    fn delete(&self, hash: &ContentHash) {
        self.blobs.lock().remove(hash);
    }

    fn hashes(&self) -> Vec<ContentHash> {
        self.blobs.lock().keys().copied().collect()
    }
}

struct FilesetRecord {
    entries: Arc<Vec<Entry>>,
    /// `None` once pinned by a finished commit.
    expires_at: Option<Instant>,
}

/// Result of one GC sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub filesets_deleted: usize,
    pub contents_deleted: usize,
}

/// The fileset storage engine handle. Cheap to clone; all clones share
/// the same underlying state.
#[derive(Clone)]
pub struct Storage {
    filesets: Arc<Mutex<HashMap<FilesetId, FilesetRecord>>>,
    contents: Arc<dyn ContentStore>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self::with_content_store(Arc::new(MemoryContentStore::default()))
    }

    pub fn with_content_store(contents: Arc<dyn ContentStore>) -> Self {
        Storage {
            filesets: Arc::new(Mutex::new(HashMap::new())),
            contents,
        }
    }

    /// Stores `data` by content address, returning its hash and length.
    pub fn put_content(&self, data: Bytes) -> (ContentHash, u64) {
        let hash = ContentHash::of(&data);
        let size = data.len() as u64;
        self.contents.put(hash, data);
        (hash, size)
    }

    pub fn get_content(&self, hash: &ContentHash) -> Result<Bytes> {
        self.contents.get(hash).ok_or(Error::ContentMissing(*hash))
    }

    /// Seals `entries` (sorted by `(path, tag)`) into a new fileset.
    pub(crate) fn create(&self, entries: Vec<Entry>, ttl: Option<Duration>) -> FilesetId {
        debug_assert!(entries.windows(2).all(|w| w[0].key() <= w[1].key()));
        let id = FilesetId::random();
        let record = FilesetRecord {
            entries: Arc::new(entries),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.filesets.lock().insert(id, record);
        id
    }

    /// Opens a sorted writer sealing into a temporary fileset.
    pub fn writer(&self, ttl: Duration) -> Writer {
        Writer::new(self.clone(), ttl)
    }

    /// Opens a buffered unordered writer. `renewer`, when supplied, keeps
    /// the sealed fileset's TTL alive after close.
    pub fn unordered_writer(
        &self,
        ttl: Duration,
        default_tag: String,
        renewer: Option<Renewer>,
    ) -> UnorderedWriter {
        UnorderedWriter::new(self.clone(), ttl, default_tag, renewer)
    }

    pub fn contains(&self, id: &FilesetId) -> bool {
        self.filesets.lock().contains_key(id)
    }

    /// The raw entry vector of one fileset.
    pub fn entries(&self, id: &FilesetId) -> Result<Arc<Vec<Entry>>> {
        let filesets = self.filesets.lock();
        filesets
            .get(id)
            .map(|r| r.entries.clone())
            .ok_or(Error::FilesetNotFound(*id))
    }

    /// Lazy path-ordered merge across `ids`, honoring last-input-wins
    /// precedence for duplicate paths. Nothing is persisted.
    pub fn open(&self, ids: &[FilesetId]) -> Result<MergeReader> {
        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            sources.push(self.entries(id)?);
        }
        Ok(MergeReader::new(sources))
    }

    /// K-way merges `ids` into a single new fileset with the given TTL.
    ///
    /// Duplicate paths resolve by input precedence with tombstones
    /// suppressing earlier entries. A winning tombstone is retained in
    /// the output so the compacted fileset still masks the path when
    /// merged under others; resolved read views never surface it.
    /// Compacting an already-compacted set reproduces its logical
    /// content.
    pub fn compact(&self, ids: &[FilesetId], ttl: Duration) -> Result<FilesetId> {
        let merged = self.open(ids)?;
        let mut entries: Vec<Entry> = Vec::new();
        for entry in merged {
            match entries.last_mut() {
                Some(last) if last.path == entry.path => *last = entry,
                _ => entries.push(entry),
            }
        }
        Ok(self.create(entries, Some(ttl)))
    }

    /// Validates and renews a temporary fileset by its hex token.
    ///
    /// The token must be exactly [`crate::id::ID_HEX_LEN`] hex chars; the
    /// strict check prevents renewing storage the caller does not name
    /// precisely.
    pub fn set_ttl(&self, token: &str, ttl: Duration) -> Result<FilesetId> {
        if ttl < MIN_TTL || ttl > MAX_TTL {
            return Err(Error::TtlOutOfRange(ttl));
        }
        let id = FilesetId::from_hex(token)
            .ok_or_else(|| Error::InvalidFilesetId(token.to_string()))?;
        self.touch(&id, ttl)?;
        Ok(id)
    }

    /// Renews a known-good id without re-validating the TTL bounds. Used
    /// by the background renewal task.
    pub(crate) fn touch(&self, id: &FilesetId, ttl: Duration) -> Result<()> {
        let mut filesets = self.filesets.lock();
        let record = filesets.get_mut(id).ok_or(Error::FilesetNotFound(*id))?;
        if record.expires_at.is_some() {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    /// Makes a fileset permanent. Called when the owning commit finishes.
    pub fn pin(&self, id: &FilesetId) -> Result<()> {
        let mut filesets = self.filesets.lock();
        let record = filesets.get_mut(id).ok_or(Error::FilesetNotFound(*id))?;
        record.expires_at = None;
        Ok(())
    }

    /// Removes a fileset record. Content is reclaimed by the next sweep.
    pub fn delete(&self, id: &FilesetId) {
        self.filesets.lock().remove(id);
    }

    /// Total size of the resolved view of `ids`.
    pub fn resolved_size(&self, ids: &[FilesetId]) -> Result<u64> {
        let resolved = IndexResolver::new(self.open(ids)?);
        Ok(resolved.map(|e| e.size()).sum())
    }

    /// Runs one GC sweep at the current instant. See [`Storage::gc_at`].
    pub fn gc(&self, pinned: &HashSet<FilesetId>) -> GcStats {
        self.gc_at(Instant::now(), pinned)
    }

    /// Deletes filesets whose TTL lapsed before `now` and which are not
    /// pinned by a finished commit, then drops content blobs no
    /// remaining fileset references.
    pub fn gc_at(&self, now: Instant, pinned: &HashSet<FilesetId>) -> GcStats {
        let mut stats = GcStats::default();
        let mut live_hashes: HashSet<ContentHash> = HashSet::new();
        {
            let mut filesets = self.filesets.lock();
            filesets.retain(|id, record| {
                let expired = matches!(record.expires_at, Some(at) if at <= now);
                if expired && !pinned.contains(id) {
                    stats.filesets_deleted += 1;
                    false
                } else {
                    true
                }
            });
            for record in filesets.values() {
                for entry in record.entries.iter() {
                    if let EntryBody::File { hash, .. } = entry.body {
                        live_hashes.insert(hash);
                    }
                }
            }
        }
        for hash in self.contents.hashes() {
            if !live_hashes.contains(&hash) {
                self.contents.delete(&hash);
                stats.contents_deleted += 1;
            }
        }
        if stats.filesets_deleted > 0 || stats.contents_deleted > 0 {
            info!(
                filesets = stats.filesets_deleted,
                contents = stats.contents_deleted,
                "gc sweep reclaimed storage"
            );
        }
        stats
    }
}

/// A tag that distinguishes writes within a fileset and sorts in write
/// order: zero-padded nanoseconds since the epoch.
pub fn default_tag() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:020}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_is_idempotent_in_content() {
        let storage = Storage::new();
        let mut w1 = storage.unordered_writer(DEFAULT_TTL, default_tag(), None);
        w1.append("/a", None, Bytes::from_static(b"one")).unwrap();
        w1.append("/b", None, Bytes::from_static(b"two")).unwrap();
        let f1 = w1.close().unwrap();
        let mut w2 = storage.unordered_writer(DEFAULT_TTL, default_tag(), None);
        w2.append("/a", None, Bytes::from_static(b"three")).unwrap();
        w2.delete("/b", None).unwrap();
        let f2 = w2.close().unwrap();

        let once = storage.compact(&[f1, f2], DEFAULT_TTL).unwrap();
        let twice = storage.compact(&[once], DEFAULT_TTL).unwrap();
        let a: Vec<Entry> = IndexResolver::new(storage.open(&[once]).unwrap()).collect();
        let b: Vec<Entry> = IndexResolver::new(storage.open(&[twice]).unwrap()).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].path, "/a");
    }

    #[test]
    fn gc_reclaims_expired_filesets_and_content() {
        let storage = Storage::new();
        let mut w = storage.unordered_writer(Duration::from_secs(10), default_tag(), None);
        w.append("/doomed", None, Bytes::from_static(b"bytes")).unwrap();
        let id = w.close().unwrap();
        assert!(storage.contains(&id));

        // Not yet expired.
        let stats = storage.gc_at(Instant::now(), &HashSet::new());
        assert_eq!(stats.filesets_deleted, 0);
        assert!(storage.contains(&id));

        let later = Instant::now() + Duration::from_secs(11);
        let stats = storage.gc_at(later, &HashSet::new());
        assert_eq!(stats.filesets_deleted, 1);
        assert_eq!(stats.contents_deleted, 1);
        assert!(!storage.contains(&id));
    }

    #[test]
    fn pinned_filesets_survive_expiry() {
        let storage = Storage::new();
        let mut w = storage.unordered_writer(Duration::from_secs(1), default_tag(), None);
        w.append("/kept", None, Bytes::from_static(b"kept")).unwrap();
        let id = w.close().unwrap();
        storage.pin(&id).unwrap();
        let later = Instant::now() + Duration::from_secs(3600);
        let stats = storage.gc_at(later, &HashSet::new());
        assert_eq!(stats.filesets_deleted, 0);
        assert!(storage.contains(&id));
    }

    #[test]
    fn set_ttl_validates_bounds_and_token() {
        let storage = Storage::new();
        let mut w = storage.unordered_writer(DEFAULT_TTL, default_tag(), None);
        w.append("/f", None, Bytes::from_static(b"x")).unwrap();
        let id = w.close().unwrap();
        let token = id.to_hex();

        assert!(matches!(
            storage.set_ttl(&token, Duration::from_millis(500)),
            Err(Error::TtlOutOfRange(_))
        ));
        assert!(matches!(
            storage.set_ttl(&token, MAX_TTL + Duration::from_secs(1)),
            Err(Error::TtlOutOfRange(_))
        ));
        assert!(matches!(
            storage.set_ttl("not-a-token", Duration::from_secs(10)),
            Err(Error::InvalidFilesetId(_))
        ));
        assert_eq!(storage.set_ttl(&token, Duration::from_secs(10)).unwrap(), id);
    }
}
