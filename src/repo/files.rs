//! File operations against commits.
//!
//! Writes go through an [`UnorderedWriter`] whose sealed fileset is
//! staged into an open commit; a branch reference whose head is already
//! finished gets a one-off commit wrapped around the write. Reads
//! compose the lazy pipeline over the commit's view: its binding when
//! finished, or the parent binding plus everything staged so far while
//! it is open.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::fileset::{
    clean_path, default_tag, index::parent_dirs, with_renewer, ContentHash, DiffEntry, Differ,
    DirInserter, Entry, EntryBody, IndexFilter, IndexMapper, IndexResolver, UnorderedWriter,
    DEFAULT_TTL,
};
use crate::glob::Glob;
use crate::id::{CommitId, FilesetId};

use super::{commitstore, graph, Branch, Commit, CommitInfo, Error, Key, Record, Repository, Result, Scope};

/// Metadata of one path in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub commit: Commit,
    pub path: String,
    pub is_dir: bool,
    /// For directories, the total size of the files beneath.
    pub size_bytes: u64,
    /// Content address; `None` for directories.
    pub hash: Option<ContentHash>,
}

/// A matched file together with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub info: FileInfo,
    pub data: Bytes,
}

/// True when `path` equals `target` or sits beneath it.
fn under(target: &str, path: &str) -> bool {
    let target = target.strip_suffix('/').unwrap_or(target);
    let path = path.strip_suffix('/').unwrap_or(path);
    if target.is_empty() {
        return true;
    }
    path == target || path.strip_prefix(target).is_some_and(|r| r.starts_with('/'))
}

impl Repository {
    /// Writes into a commit. `build` receives an unordered writer; the
    /// sealed fileset is staged into the referenced open commit, or
    /// wrapped in a one-off commit when a branch reference points at a
    /// finished head. Returns the commit actually written.
    pub async fn modify_file<F>(&self, commit: &Commit, build: F) -> Result<Commit>
    where
        F: FnOnce(&mut UnorderedWriter) -> Result<()>,
    {
        self.authorize(&commit.repo, Scope::Writer)?;
        let storage = self.storage().clone();
        let writer_storage = storage.clone();
        let id = with_renewer(&storage, DEFAULT_TTL, |renewer| async move {
            let mut writer =
                writer_storage.unordered_writer(DEFAULT_TTL, default_tag(), Some(renewer));
            build(&mut writer)?;
            writer.close().map_err(Error::from)
        })
        .await?;
        self.stage_fileset(commit, id).await
    }

    /// Stores `data` under `path`, replacing any previous content.
    pub async fn put_file(&self, commit: &Commit, path: &str, data: impl Into<Bytes>) -> Result<Commit> {
        let data = data.into();
        self.modify_file(commit, |w| {
            w.append(path, None, data)?;
            Ok(())
        })
        .await
    }

    /// Records a deletion of `path`.
    pub async fn delete_file(&self, commit: &Commit, path: &str) -> Result<Commit> {
        self.modify_file(commit, |w| {
            w.delete(path, None)?;
            Ok(())
        })
        .await
    }

    /// Copies `src_path` (a file or a whole directory) from a finished
    /// commit into `dst_path` of `dst`. Without `overwrite` the copied
    /// entries layer over whatever the destination already holds and
    /// win by merge order; `overwrite` mode is not supported.
    pub async fn copy_file(
        &self,
        src: &Commit,
        src_path: &str,
        dst: &Commit,
        dst_path: &str,
        overwrite: bool,
    ) -> Result<Commit> {
        self.authorize(&src.repo, Scope::Reader)?;
        self.authorize(&dst.repo, Scope::Writer)?;
        let src_info = self.resolve_snapshot(src)?;
        if src_info.finished.is_none() {
            return Err(Error::CommitNotFinished(src_info.commit));
        }
        let src_path = clean_path(src_path);
        let dst_path = clean_path(dst_path);

        if overwrite {
            let dst_info = self.resolve_snapshot(dst)?;
            return Err(Error::OverwriteUnsupported {
                commit: dst_info.commit,
                path: dst_path,
            });
        }

        let src_view = self.view_ids(&src_info)?;
        let resolved = IndexResolver::new(self.storage().open(&src_view)?);
        let wanted = src_path.clone();
        let filtered = IndexFilter::new(resolved, move |path| under(&wanted, path));
        let from = src_path.clone();
        let to = dst_path.clone();
        let rebased = IndexMapper::new(filtered, move |path| {
            let rest = path.strip_prefix(from.as_str()).unwrap_or("");
            format!("{to}{rest}")
        });
        let mut writer = self.storage().writer(DEFAULT_TTL);
        let mut copied = false;
        for entry in rebased {
            writer.put(entry)?;
            copied = true;
        }
        if !copied {
            return Err(Error::FileNotFound {
                commit: src_info.commit,
                path: src_path,
            });
        }
        let id = writer.close()?;
        self.stage_fileset(dst, id).await
    }

    /// Seals a standalone temporary fileset outside any commit. The
    /// result can be staged later with [`Repository::add_fileset`] and
    /// kept alive with [`Repository::renew_fileset`].
    pub fn create_fileset<F>(&self, build: F) -> Result<FilesetId>
    where
        F: FnOnce(&mut UnorderedWriter) -> Result<()>,
    {
        let mut writer = self
            .storage()
            .unordered_writer(DEFAULT_TTL, default_tag(), None);
        build(&mut writer)?;
        Ok(writer.close()?)
    }

    /// Renews a temporary fileset's lease by its hex token.
    pub fn renew_fileset(&self, token: &str, ttl: Duration) -> Result<FilesetId> {
        Ok(self.storage().set_ttl(token, ttl)?)
    }

    /// The total fileset bound to a finished commit.
    pub fn get_fileset(&self, commit: &Commit) -> Result<FilesetId> {
        self.authorize(&commit.repo, Scope::Reader)?;
        let info = self.resolve_snapshot(commit)?;
        if info.finished.is_none() {
            return Err(Error::CommitNotFinished(info.commit));
        }
        match self
            .meta()
            .get(&Key::Binding(info.commit.repo.clone(), info.commit.id.clone()))
        {
            Some(Record::Binding(id)) => Ok(id),
            _ => Err(Error::Corrupt(format!("missing binding for {}", info.commit))),
        }
    }

    /// Stages an existing fileset into a commit.
    pub async fn add_fileset(&self, commit: &Commit, id: FilesetId) -> Result<Commit> {
        self.authorize(&commit.repo, Scope::Writer)?;
        if !self.storage().contains(&id) {
            return Err(Error::Storage(crate::fileset::Error::FilesetNotFound(id)));
        }
        self.stage_fileset(commit, id).await
    }

    async fn stage_fileset(&self, commit: &Commit, id: FilesetId) -> Result<Commit> {
        let resolved = self.resolve_snapshot(commit)?;
        if resolved.finished.is_none() {
            let target = resolved.commit.clone();
            self.meta()
                .in_txn(|txn| {
                    let info = graph::get_commit(txn, &target.repo, &target.id)?;
                    if info.finished.is_some() {
                        return Err(Error::CommitFinished(target.clone()));
                    }
                    commitstore::stage(txn, &target, id)
                })
                .await?;
            return Ok(target);
        }
        if CommitId::from_hex(&commit.id).is_some() {
            return Err(Error::CommitFinished(resolved.commit));
        }
        // Branch reference with a finished head: wrap the write in a
        // one-off commit.
        let branch = Branch::new(&commit.repo, &commit.id);
        let new = self.start_commit(&branch, &[]).await?;
        let target = new.clone();
        self.meta()
            .in_txn(|txn| {
                graph::get_commit(txn, &target.repo, &target.id)?;
                commitstore::stage(txn, &target, id)
            })
            .await?;
        self.finish_commit(&new, "", false).await?;
        Ok(new)
    }

    /// The filesets composing a commit's current view.
    fn view_ids(&self, info: &CommitInfo) -> Result<Vec<FilesetId>> {
        if info.finished.is_some() {
            let binding = self
                .meta()
                .get(&Key::Binding(info.commit.repo.clone(), info.commit.id.clone()));
            return match binding {
                Some(Record::Binding(id)) => Ok(vec![id]),
                _ => Err(Error::Corrupt(format!("missing binding for {}", info.commit))),
            };
        }
        let mut ids = Vec::new();
        if let Some(parent) = &info.parent {
            if let Some(Record::Binding(id)) = self
                .meta()
                .get(&Key::Binding(parent.repo.clone(), parent.id.clone()))
            {
                ids.push(id);
            }
        }
        if let Some(Record::Staged(staged)) = self
            .meta()
            .get(&Key::Staged(info.commit.repo.clone(), info.commit.id.clone()))
        {
            ids.extend(staged);
        }
        Ok(ids)
    }

    /// Materializes the structural listing of a commit: resolved entries
    /// with synthesized directories, plus accumulated directory sizes.
    fn listing(&self, commit: &Commit) -> Result<(Commit, Vec<Entry>, HashMap<String, u64>)> {
        self.authorize(&commit.repo, Scope::Reader)?;
        let info = self.resolve_snapshot(commit)?;
        let ids = self.view_ids(&info)?;
        let entries: Vec<Entry> =
            DirInserter::new(IndexResolver::new(self.storage().open(&ids)?)).collect();
        let mut dir_sizes: HashMap<String, u64> = HashMap::new();
        for entry in &entries {
            if let EntryBody::File { size, .. } = entry.body {
                for dir in parent_dirs(&entry.path) {
                    *dir_sizes.entry(dir).or_insert(0) += size;
                }
            }
        }
        Ok((info.commit, entries, dir_sizes))
    }

    fn file_info(
        commit: &Commit,
        entry: &Entry,
        dir_sizes: &HashMap<String, u64>,
    ) -> FileInfo {
        match entry.body {
            EntryBody::File { hash, size } => FileInfo {
                commit: commit.clone(),
                path: entry.path.clone(),
                is_dir: false,
                size_bytes: size,
                hash: Some(hash),
            },
            _ => FileInfo {
                commit: commit.clone(),
                path: entry.path.clone(),
                is_dir: true,
                size_bytes: dir_sizes.get(&entry.path).copied().unwrap_or(0),
                hash: None,
            },
        }
    }

    /// The content of the file at `path`. Directories are not files.
    pub fn get_file(&self, commit: &Commit, path: &str) -> Result<Bytes> {
        self.authorize(&commit.repo, Scope::Reader)?;
        let info = self.resolve_snapshot(commit)?;
        let ids = self.view_ids(&info)?;
        let path = clean_path(path);
        let hash = IndexResolver::new(self.storage().open(&ids)?)
            .find(|e| e.path == path)
            .and_then(|e| match e.body {
                EntryBody::File { hash, .. } => Some(hash),
                _ => None,
            })
            .ok_or_else(|| Error::FileNotFound {
                commit: info.commit.clone(),
                path: path.clone(),
            })?;
        Ok(self.storage().get_content(&hash)?)
    }

    /// Every file matching `pattern`, with content, in path order. A
    /// matched directory stands for its whole subtree.
    pub fn get_files(&self, commit: &Commit, pattern: &str) -> Result<Vec<FileContent>> {
        let glob = Glob::parse(pattern)?;
        let (commit, entries, dir_sizes) = self.listing(commit)?;
        let mut out = Vec::new();
        // Entries arrive in path order, so a matched directory precedes
        // everything beneath it.
        let mut subtree: Option<String> = None;
        for entry in &entries {
            let in_subtree = subtree
                .as_deref()
                .is_some_and(|dir| under(dir, &entry.path));
            if !in_subtree {
                subtree = None;
                if !glob.matches(&entry.path) {
                    continue;
                }
                if entry.is_dir() {
                    subtree = Some(entry.path.clone());
                    continue;
                }
            } else if entry.is_dir() {
                continue;
            }
            let info = Self::file_info(&commit, entry, &dir_sizes);
            let data = match entry.body {
                EntryBody::File { hash, .. } => self.storage().get_content(&hash)?,
                _ => continue,
            };
            out.push(FileContent { info, data });
        }
        Ok(out)
    }

    /// Metadata of the file or directory at `path`.
    pub fn inspect_file(&self, commit: &Commit, path: &str) -> Result<FileInfo> {
        let (commit, entries, dir_sizes) = self.listing(commit)?;
        let wanted = clean_path(path);
        entries
            .iter()
            .find(|e| e.path.strip_suffix('/').unwrap_or(&e.path) == wanted)
            .map(|e| Self::file_info(&commit, e, &dir_sizes))
            .ok_or(Error::FileNotFound {
                commit,
                path: wanted,
            })
    }

    /// The direct children of the directory at `path`, in path order.
    pub fn list_file(&self, commit: &Commit, path: &str) -> Result<Vec<FileInfo>> {
        let (commit, entries, dir_sizes) = self.listing(commit)?;
        let dir = clean_path(path);
        Ok(entries
            .iter()
            .filter(|e| path_is_child_of(&dir, &e.path))
            .map(|e| Self::file_info(&commit, e, &dir_sizes))
            .collect())
    }

    /// Every file and directory under `path`, recursively, in path
    /// order. A path with nothing under it is an error.
    pub fn walk_file(&self, commit: &Commit, path: &str) -> Result<Vec<FileInfo>> {
        let (commit, entries, dir_sizes) = self.listing(commit)?;
        let root = clean_path(path);
        let walked: Vec<FileInfo> = entries
            .iter()
            .filter(|e| under(&root, &e.path))
            .map(|e| Self::file_info(&commit, e, &dir_sizes))
            .collect();
        if walked.is_empty() {
            return Err(Error::FileNotFound { commit, path: root });
        }
        Ok(walked)
    }

    /// Every path matching `pattern`, files and directories both.
    pub fn glob_file(&self, commit: &Commit, pattern: &str) -> Result<Vec<FileInfo>> {
        let glob = Glob::parse(pattern)?;
        let (commit, entries, dir_sizes) = self.listing(commit)?;
        Ok(entries
            .iter()
            .filter(|e| e.path.starts_with(glob.prefix()) && glob.matches(&e.path))
            .map(|e| Self::file_info(&commit, e, &dir_sizes))
            .collect())
    }

    /// Changed paths under `path` between `old` and `new`. `old`
    /// defaults to `new`'s parent; against no parent everything reads as
    /// created.
    pub fn diff_file(
        &self,
        new: &Commit,
        old: Option<&Commit>,
        path: &str,
    ) -> Result<Vec<DiffEntry>> {
        self.authorize(&new.repo, Scope::Reader)?;
        let new_info = self.resolve_snapshot(new)?;
        let old_info = match old {
            Some(old) => {
                self.authorize(&old.repo, Scope::Reader)?;
                Some(self.resolve_snapshot(old)?)
            }
            None => match &new_info.parent {
                Some(parent) => Some(self.resolve_snapshot(parent)?),
                None => None,
            },
        };
        let root = clean_path(path);
        let new_ids = self.view_ids(&new_info)?;
        let old_ids = match &old_info {
            Some(info) => self.view_ids(info)?,
            None => Vec::new(),
        };
        let scope = root.clone();
        let old_side = IndexFilter::new(
            IndexResolver::new(self.storage().open(&old_ids)?),
            move |p| under(&scope, p),
        );
        let scope = root;
        let new_side = IndexFilter::new(
            IndexResolver::new(self.storage().open(&new_ids)?),
            move |p| under(&scope, p),
        );
        Ok(Differ::new(old_side, new_side).collect())
    }
}

/// True when `path` is a direct child of directory `dir`.
fn path_is_child_of(dir: &str, path: &str) -> bool {
    crate::fileset::index::path_is_child(dir, path)
}
