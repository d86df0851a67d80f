//! Fileset writers.
//!
//! [`UnorderedWriter`] is the general write path: it buffers appends and
//! deletes in any order and seals them into one immutable fileset on
//! close. [`Writer`] is the lower-level variant for callers that already
//! produce paths in sorted order (copies in particular) and refuses
//! anything else. Both are all-or-nothing: a writer that is dropped
//! without a successful `close` persists no fileset, and any content
//! blobs it staged are reclaimed by the next GC sweep.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use super::index::{clean_path, Entry, EntryBody};
use super::renew::Renewer;
use super::{Error, Result, Storage};
use crate::id::FilesetId;

/// Caller-sorted-order writer.
pub struct Writer {
    storage: Storage,
    ttl: Duration,
    entries: Vec<Entry>,
}

impl Writer {
    pub(crate) fn new(storage: Storage, ttl: Duration) -> Self {
        Writer {
            storage,
            ttl,
            entries: Vec::new(),
        }
    }

    /// Appends file content under `(path, tag)`, which must sort strictly
    /// after the previous append.
    pub fn append(&mut self, path: &str, tag: &str, content: impl Into<Bytes>) -> Result<()> {
        let path = clean_path(path);
        let (hash, size) = self.storage.put_content(content.into());
        self.put(Entry::file(path, tag, hash, size))
    }

    /// Appends a pre-built entry, order-checked. Used when transferring
    /// entries from a read pipeline (copy).
    pub fn put(&mut self, entry: Entry) -> Result<()> {
        if let Some(prev) = self.entries.last() {
            if prev.key() >= entry.key() {
                return Err(Error::OutOfOrder {
                    prev: prev.path.clone(),
                    next: entry.path,
                });
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Seals the buffer into an immutable fileset and returns its id.
    pub fn close(self) -> Result<FilesetId> {
        Ok(self.storage.create(self.entries, Some(self.ttl)))
    }
}

/// Buffered writer accepting appends and deletes in any order.
pub struct UnorderedWriter {
    storage: Storage,
    ttl: Duration,
    default_tag: String,
    buffer: BTreeMap<(String, String), EntryBody>,
    renewer: Option<Renewer>,
}

impl UnorderedWriter {
    pub(crate) fn new(
        storage: Storage,
        ttl: Duration,
        default_tag: String,
        renewer: Option<Renewer>,
    ) -> Self {
        UnorderedWriter {
            storage,
            ttl,
            default_tag,
            buffer: BTreeMap::new(),
            renewer,
        }
    }

    fn tag(&self, tag: Option<&str>) -> String {
        tag.map(str::to_string)
            .unwrap_or_else(|| self.default_tag.clone())
    }

    /// Buffers file content for `path`. A `None` tag uses the writer's
    /// default tag.
    pub fn append(&mut self, path: &str, tag: Option<&str>, content: impl Into<Bytes>) -> Result<()> {
        let (hash, size) = self.storage.put_content(content.into());
        self.buffer.insert(
            (clean_path(path), self.tag(tag)),
            EntryBody::File { hash, size },
        );
        Ok(())
    }

    /// Buffers a deletion marker for `path`.
    pub fn delete(&mut self, path: &str, tag: Option<&str>) -> Result<()> {
        self.buffer
            .insert((clean_path(path), self.tag(tag)), EntryBody::Tombstone);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Sorts and seals the buffer into one immutable fileset; registers
    /// the new id with the renewer when one was supplied.
    pub fn close(self) -> Result<FilesetId> {
        let entries: Vec<Entry> = self
            .buffer
            .into_iter()
            .map(|((path, tag), body)| Entry { path, tag, body })
            .collect();
        let id = self.storage.create(entries, Some(self.ttl));
        if let Some(renewer) = &self.renewer {
            renewer.add(id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::reader::IndexResolver;
    use crate::fileset::{default_tag, DEFAULT_TTL};

    #[test]
    fn sorted_writer_rejects_out_of_order_paths() {
        let storage = Storage::new();
        let mut w = storage.writer(DEFAULT_TTL);
        w.append("/b", "t", Bytes::from_static(b"1")).unwrap();
        let err = w.append("/a", "t", Bytes::from_static(b"2")).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
    }

    #[test]
    fn unordered_writer_sorts_on_close() {
        let storage = Storage::new();
        let mut w = storage.unordered_writer(DEFAULT_TTL, default_tag(), None);
        w.append("/z", None, Bytes::from_static(b"z")).unwrap();
        w.append("/a", None, Bytes::from_static(b"a")).unwrap();
        w.append("/m", None, Bytes::from_static(b"m")).unwrap();
        let id = w.close().unwrap();
        let paths: Vec<String> = storage
            .entries(&id)
            .unwrap()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(paths, vec!["/a", "/m", "/z"]);
    }

    #[test]
    fn tombstones_mask_appends_within_merge_order() {
        let storage = Storage::new();
        let mut w1 = storage.unordered_writer(DEFAULT_TTL, "1".to_string(), None);
        w1.append("/p", None, Bytes::from_static(b"v")).unwrap();
        let f1 = w1.close().unwrap();
        let mut w2 = storage.unordered_writer(DEFAULT_TTL, "2".to_string(), None);
        w2.delete("/p", None).unwrap();
        let f2 = w2.close().unwrap();
        let resolved: Vec<Entry> =
            IndexResolver::new(storage.open(&[f1, f2]).unwrap()).collect();
        assert!(resolved.is_empty());
    }
}
