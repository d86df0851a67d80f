//! Index entry primitives.
//!
//! An [`Entry`] describes one path inside a fileset: a content reference
//! for files, a synthetic marker for directories, or a tombstone recording
//! a deletion. Entries are pure data; all behavior lives in the readers
//! and writers that produce and consume them.

use std::fmt;

/// A blake3 content address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What an entry records for its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Regular file content.
    File { hash: ContentHash, size: u64 },
    /// A directory. Directory paths always end in `/`.
    Dir,
    /// A deletion marker superseding earlier entries for the same path.
    Tombstone,
}

/// One path's record inside a fileset.
///
/// Entries for the same path with different tags represent ordered
/// overwrite history; under merge order the entry from the latest input
/// wins, with the tag breaking ties inside a single fileset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub tag: String,
    pub body: EntryBody,
}

impl Entry {
    pub fn file(path: impl Into<String>, tag: impl Into<String>, hash: ContentHash, size: u64) -> Self {
        Entry {
            path: path.into(),
            tag: tag.into(),
            body: EntryBody::File { hash, size },
        }
    }

    pub fn dir(path: impl Into<String>, tag: impl Into<String>) -> Self {
        Entry {
            path: path.into(),
            tag: tag.into(),
            body: EntryBody::Dir,
        }
    }

    pub fn tombstone(path: impl Into<String>, tag: impl Into<String>) -> Self {
        Entry {
            path: path.into(),
            tag: tag.into(),
            body: EntryBody::Tombstone,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.body, EntryBody::Dir)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.body, EntryBody::Tombstone)
    }

    pub fn size(&self) -> u64 {
        match self.body {
            EntryBody::File { size, .. } => size,
            _ => 0,
        }
    }

    /// Sort key within one fileset: path first, then tag.
    pub fn key(&self) -> (&str, &str) {
        (&self.path, &self.tag)
    }
}

/// Canonicalizes a path: leading `/`, no doubled separators, no trailing
/// slash except for the root. Directory-ness is carried by the entry body,
/// not by the cleaned path.
pub fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

/// Returns every ancestor directory path of `path`, shallowest first,
/// including the root. `"/a/b/c"` yields `["/", "/a/", "/a/b/"]`.
pub fn parent_dirs(path: &str) -> Vec<String> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let mut out = vec!["/".to_string()];
    let mut acc = String::from("/");
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Vec::new();
    }
    for segment in &segments[..segments.len() - 1] {
        acc.push_str(segment);
        acc.push('/');
        out.push(acc.clone());
    }
    out
}

/// True when `path` is a direct child of directory `dir`.
pub fn path_is_child(dir: &str, path: &str) -> bool {
    let dir = if dir == "/" || dir.is_empty() {
        ""
    } else {
        dir.strip_suffix('/').unwrap_or(dir)
    };
    let rest = match path.strip_prefix(dir) {
        Some(rest) => rest,
        None => return false,
    };
    let rest = match rest.strip_prefix('/') {
        Some(rest) => rest,
        None => return false,
    };
    if rest.is_empty() {
        return false;
    }
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    !rest.contains('/')
}
