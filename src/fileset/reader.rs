//! Lazy, ordered entry sequences and the composable transforms layered on
//! top of them.
//!
//! Every reader in this module is an `Iterator<Item = Entry>` that yields
//! entries in ascending `(path, input precedence, tag)` order. Read-time
//! behavior is built by stacking transform stages in a fixed pipeline
//! order (prefix filter, then duplicate resolution, then directory
//! synthesis). Each stage wraps the previous one and preserves laziness
//! and ordering.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;

use super::index::{parent_dirs, Entry};

/// A boxed lazy entry sequence, the common currency of the read path.
pub type EntryStream = Box<dyn Iterator<Item = Entry> + Send>;

/// Iterates one fileset's entries without copying the backing vector.
pub struct SourceIter {
    entries: Arc<Vec<Entry>>,
    pos: usize,
}

impl SourceIter {
    pub fn new(entries: Arc<Vec<Entry>>) -> Self {
        SourceIter { entries, pos: 0 }
    }
}

impl Iterator for SourceIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = self.entries.get(self.pos)?.clone();
        self.pos += 1;
        Some(entry)
    }
}

struct HeapEntry {
    entry: Entry,
    source: usize,
    iter: SourceIter,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the BinaryHeap pops the smallest (path, source, tag)
    // first. Source index breaks path ties: later inputs sort later and
    // therefore win under last-writer-wins resolution.
    fn cmp(&self, other: &Self) -> Ordering {
        let a = (&self.entry.path, self.source, &self.entry.tag);
        let b = (&other.entry.path, other.source, &other.entry.tag);
        b.cmp(&a)
    }
}

/// K-way merge over several filesets' entry sequences.
///
/// Emits every input entry (duplicates included) in ascending
/// `(path, input order, tag)` order; [`IndexResolver`] collapses the
/// duplicates when a canonical view is wanted.
pub struct MergeReader {
    heap: BinaryHeap<HeapEntry>,
}

impl MergeReader {
    pub fn new(sources: Vec<Arc<Vec<Entry>>>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, entries) in sources.into_iter().enumerate() {
            let mut iter = SourceIter::new(entries);
            if let Some(entry) = iter.next() {
                heap.push(HeapEntry {
                    entry,
                    source,
                    iter,
                });
            }
        }
        MergeReader { heap }
    }
}

impl Iterator for MergeReader {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let mut head = self.heap.pop()?;
        let out = head.entry;
        if let Some(next) = head.iter.next() {
            head.entry = next;
            self.heap.push(head);
        }
        Some(out)
    }
}

/// Drops entries whose path fails the predicate.
pub struct IndexFilter<I, P> {
    inner: I,
    pred: P,
}

impl<I, P> IndexFilter<I, P>
where
    I: Iterator<Item = Entry>,
    P: FnMut(&str) -> bool,
{
    pub fn new(inner: I, pred: P) -> Self {
        IndexFilter { inner, pred }
    }
}

impl<I, P> Iterator for IndexFilter<I, P>
where
    I: Iterator<Item = Entry>,
    P: FnMut(&str) -> bool,
{
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let entry = self.inner.next()?;
            if (self.pred)(&entry.path) {
                return Some(entry);
            }
        }
    }
}

/// Rewrites each entry's path. Used to rebase a source prefix onto a
/// destination prefix for copies; the mapping must preserve the relative
/// order of the paths it is applied to.
pub struct IndexMapper<I, F> {
    inner: I,
    map: F,
}

impl<I, F> IndexMapper<I, F>
where
    I: Iterator<Item = Entry>,
    F: FnMut(&str) -> String,
{
    pub fn new(inner: I, map: F) -> Self {
        IndexMapper { inner, map }
    }
}

impl<I, F> Iterator for IndexMapper<I, F>
where
    I: Iterator<Item = Entry>,
    F: FnMut(&str) -> String,
{
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let mut entry = self.inner.next()?;
        entry.path = (self.map)(&entry.path);
        Some(entry)
    }
}

/// Collapses duplicate-path runs into one canonical entry per path.
///
/// The input is ordered by `(path, input precedence, tag)`, so the last
/// entry of a run is the winner; a winning tombstone suppresses the path
/// entirely.
pub struct IndexResolver<I> {
    inner: I,
    pending: Option<Entry>,
}

impl<I> IndexResolver<I>
where
    I: Iterator<Item = Entry>,
{
    pub fn new(inner: I) -> Self {
        IndexResolver {
            inner,
            pending: None,
        }
    }
}

impl<I> Iterator for IndexResolver<I>
where
    I: Iterator<Item = Entry>,
{
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let mut winner = match self.pending.take().or_else(|| self.inner.next()) {
                Some(entry) => entry,
                None => return None,
            };
            loop {
                match self.inner.next() {
                    Some(entry) if entry.path == winner.path => winner = entry,
                    Some(entry) => {
                        self.pending = Some(entry);
                        break;
                    }
                    None => break,
                }
            }
            if winner.is_tombstone() {
                continue;
            }
            return Some(winner);
        }
    }
}

/// Synthesizes directory entries for every path prefix that has children
/// but no explicit directory entry, so listings are structurally complete.
pub struct DirInserter<I> {
    inner: I,
    seen: HashSet<String>,
    queue: VecDeque<Entry>,
}

impl<I> DirInserter<I>
where
    I: Iterator<Item = Entry>,
{
    pub fn new(inner: I) -> Self {
        DirInserter {
            inner,
            seen: HashSet::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<I> Iterator for DirInserter<I>
where
    I: Iterator<Item = Entry>,
{
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if let Some(entry) = self.queue.pop_front() {
            return Some(entry);
        }
        let entry = self.inner.next()?;
        // Ancestors sort strictly before their children, so emitting the
        // missing ones here keeps the stream ordered.
        for dir in parent_dirs(&entry.path) {
            if self.seen.insert(dir.clone()) {
                self.queue.push_back(Entry::dir(dir, ""));
            }
        }
        if entry.is_dir() {
            self.seen.insert(entry.path.clone());
        }
        self.queue.push_back(entry);
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::index::{ContentHash, EntryBody};

    fn file(path: &str, tag: &str, byte: u8) -> Entry {
        Entry::file(path, tag, ContentHash::of(&[byte]), 1)
    }

    fn sources(sets: Vec<Vec<Entry>>) -> Vec<Arc<Vec<Entry>>> {
        sets.into_iter().map(Arc::new).collect()
    }

    #[test]
    fn merge_orders_by_path_then_input_then_tag() {
        let merged: Vec<Entry> = MergeReader::new(sources(vec![
            vec![file("/a", "1", 0), file("/c", "1", 1)],
            vec![file("/a", "0", 2), file("/b", "0", 3)],
        ]))
        .collect();
        let keys: Vec<(String, String)> = merged
            .iter()
            .map(|e| (e.path.clone(), e.tag.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("/a".into(), "1".into()),
                ("/a".into(), "0".into()),
                ("/b".into(), "0".into()),
                ("/c".into(), "1".into()),
            ]
        );
    }

    #[test]
    fn resolver_takes_last_input_then_last_tag() {
        let merged = MergeReader::new(sources(vec![
            vec![file("/p", "5", 0)],
            vec![file("/p", "1", 1), file("/p", "2", 2)],
        ]));
        let resolved: Vec<Entry> = IndexResolver::new(merged).collect();
        assert_eq!(resolved.len(), 1);
        match resolved[0].body {
            EntryBody::File { hash, .. } => assert_eq!(hash, ContentHash::of(&[2])),
            _ => panic!("expected file entry"),
        }
        assert_eq!(resolved[0].tag, "2");
    }

    #[test]
    fn resolver_suppresses_tombstoned_paths() {
        let merged = MergeReader::new(sources(vec![
            vec![file("/p", "1", 0), file("/q", "1", 1)],
            vec![Entry::tombstone("/p", "2")],
        ]));
        let resolved: Vec<Entry> = IndexResolver::new(merged).collect();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, "/q");
    }

    #[test]
    fn later_append_survives_earlier_tombstone() {
        let merged = MergeReader::new(sources(vec![vec![
            Entry::tombstone("/p", "1"),
            file("/p", "2", 9),
        ]]));
        let resolved: Vec<Entry> = IndexResolver::new(merged).collect();
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].is_tombstone());
    }

    #[test]
    fn dir_inserter_synthesizes_missing_parents() {
        let input = vec![file("/a/b/c.txt", "1", 0), file("/a/d.txt", "1", 1)];
        let out: Vec<String> = DirInserter::new(input.into_iter())
            .map(|e| e.path)
            .collect();
        assert_eq!(out, vec!["/", "/a/", "/a/b/", "/a/b/c.txt", "/a/d.txt"]);
    }

    #[test]
    fn dir_inserter_keeps_explicit_dirs() {
        let input = vec![Entry::dir("/a/", "1"), file("/a/x", "1", 0)];
        let out: Vec<String> = DirInserter::new(input.into_iter())
            .map(|e| e.path)
            .collect();
        assert_eq!(out, vec!["/", "/a/", "/a/x"]);
    }
}
