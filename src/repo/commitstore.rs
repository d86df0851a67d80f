//! Commit ⇄ fileset bindings.
//!
//! While a commit is open, the ids of every fileset written into it are
//! staged in creation order. Finishing the commit compacts the staged
//! list together with the parent's binding into a single total fileset
//! and records it as the commit's binding. Bound filesets are pinned in
//! storage and only released when the commit is deleted.

use std::collections::HashSet;

use crate::id::FilesetId;
use crate::meta::MetaStore;

use super::graph::MetaTxn;
use super::{Commit, Error, Key, Record, Result};

/// Appends a fileset to the staged list of an open commit.
pub(crate) fn stage(txn: &mut MetaTxn<'_>, commit: &Commit, id: FilesetId) -> Result<()> {
    let key = Key::Staged(commit.repo.clone(), commit.id.clone());
    let mut ids = match txn.get(&key) {
        Some(Record::Staged(ids)) => ids,
        Some(_) => return Err(Error::Corrupt(format!("staged record for {commit}"))),
        None => Vec::new(),
    };
    ids.push(id);
    txn.put(key, Record::Staged(ids));
    Ok(())
}

/// The staged filesets of a commit, oldest first.
pub(crate) fn staged(txn: &mut MetaTxn<'_>, commit: &Commit) -> Result<Vec<FilesetId>> {
    match txn.get(&Key::Staged(commit.repo.clone(), commit.id.clone())) {
        Some(Record::Staged(ids)) => Ok(ids),
        Some(_) => Err(Error::Corrupt(format!("staged record for {commit}"))),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn clear_staged(txn: &mut MetaTxn<'_>, commit: &Commit) {
    txn.delete(Key::Staged(commit.repo.clone(), commit.id.clone()));
}

/// Records the total fileset of a finished commit.
pub(crate) fn bind(txn: &mut MetaTxn<'_>, commit: &Commit, id: FilesetId) {
    txn.put(
        Key::Binding(commit.repo.clone(), commit.id.clone()),
        Record::Binding(id),
    );
}

pub(crate) fn binding(txn: &mut MetaTxn<'_>, commit: &Commit) -> Result<Option<FilesetId>> {
    match txn.get(&Key::Binding(commit.repo.clone(), commit.id.clone())) {
        Some(Record::Binding(id)) => Ok(Some(id)),
        Some(_) => Err(Error::Corrupt(format!("binding record for {commit}"))),
        None => Ok(None),
    }
}

pub(crate) fn remove_binding(txn: &mut MetaTxn<'_>, commit: &Commit) {
    txn.delete(Key::Binding(commit.repo.clone(), commit.id.clone()));
}

/// Every fileset bound to a finished commit. These are the roots the
/// storage sweep must never reclaim.
pub(crate) fn pinned(meta: &MetaStore<Key, Record>) -> HashSet<FilesetId> {
    meta.select(|k| matches!(k, Key::Binding(_, _)))
        .into_iter()
        .filter_map(|(_, record)| match record {
            Record::Binding(id) => Some(id),
            _ => None,
        })
        .collect()
}
