//! Versioned repositories over the fileset engine.
//!
//! A repo holds named branches; each branch points at the head of a
//! chain of immutable commits. Commits carry provenance edges to the
//! upstream commits they were derived from, and subvenance ranges
//! pointing back down. Moving a branch head propagates through the
//! branch graph by minting origin=Auto alias commits on subvenant
//! branches, and finishing a commit cascades readiness counters to the
//! commits that depend on it.
//!
//! All metadata lives in a [`MetaStore`] and every multi-key mutation
//! runs as one optimistic transaction, so concurrent writers serialize
//! by conflict and retry rather than by locks.

pub(crate) mod commitstore;
pub mod files;
pub mod fsck;
pub(crate) mod graph;
pub mod master;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use futures::stream::Stream;
use itertools::Itertools;
use tokio::sync::watch;
use tracing::info;

use crate::fileset::{self, Storage, DEFAULT_TTL};
use crate::glob::GlobError;
use crate::id::{CommitId, FilesetId};
use crate::meta::{MetaStore, TxnError};

pub use files::{FileContent, FileInfo};
pub use fsck::{FsckIssue, FsckReport};
pub use master::{DistributedLock, InProcessLock, Master};

/// A branch reference: a repo name plus a branch name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch {
    pub repo: String,
    pub name: String,
}

impl Branch {
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Branch {
            repo: repo.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.name)
    }
}

/// A commit reference. `id` is either a canonical 32 character hex
/// token or a branch name standing for that branch's head.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Commit {
    pub repo: String,
    pub id: String,
}

impl Commit {
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Commit {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub name: String,
    pub description: String,
    pub created: SystemTime,
}

/// Lifecycle states of a commit, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitState {
    /// Open, with unfinished provenance.
    Started,
    /// Open, every provenance commit finished.
    Ready,
    Finished,
}

/// How a commit came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrigin {
    /// Started explicitly by a caller.
    User,
    /// Alias minted by head propagation.
    Auto,
    /// Repair commit minted by fsck.
    Fsck,
}

/// One provenance edge: the upstream commit and the branch it headed
/// when the edge was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitProvenance {
    pub commit: Commit,
    pub branch: Branch,
}

/// A contiguous run of downstream commits on one branch, stored as its
/// two endpoints. Expanded by walking child links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRange {
    pub lower: Commit,
    pub upper: Commit,
}

/// Conditions under which a branch head is pulled forward to a commit
/// finishing on another branch of the same repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Source branch watched for finished commits.
    pub branch: String,
    /// Cron schedule, stored for external schedulers. Not evaluated here.
    pub cron_spec: String,
    /// Fire once at least this many bytes accumulated. Zero disables.
    pub size_bytes: u64,
    /// Fire once at least this many commits accumulated. Zero disables.
    pub commits: u64,
    /// Require all configured conditions instead of any.
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    /// Canonical reference (hex id).
    pub commit: Commit,
    /// The branch the commit was created on.
    pub branch: Branch,
    pub origin: CommitOrigin,
    pub parent: Option<Commit>,
    pub children: Vec<Commit>,
    pub started: SystemTime,
    pub finished: Option<SystemTime>,
    pub description: String,
    /// Resolved size of the commit's total fileset; set on finish.
    pub size_bytes: u64,
    pub provenance: Vec<CommitProvenance>,
    pub subvenance: Vec<CommitRange>,
    /// How many provenance commits have finished.
    pub ready_provenance: u64,
    pub subvenant_total: u64,
    pub subvenant_success: u64,
    pub subvenant_failure: u64,
}

impl CommitInfo {
    fn new(commit: Commit, branch: Branch, origin: CommitOrigin, started: SystemTime) -> Self {
        CommitInfo {
            commit,
            branch,
            origin,
            parent: None,
            children: Vec::new(),
            started,
            finished: None,
            description: String::new(),
            size_bytes: 0,
            provenance: Vec::new(),
            subvenance: Vec::new(),
            ready_provenance: 0,
            subvenant_total: 0,
            subvenant_success: 0,
            subvenant_failure: 0,
        }
    }

    pub fn state(&self) -> CommitState {
        if self.finished.is_some() {
            CommitState::Finished
        } else if self.ready_provenance >= self.provenance.len() as u64 {
            CommitState::Ready
        } else {
            CommitState::Started
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    pub branch: Branch,
    pub head: Option<Commit>,
    pub direct_provenance: Vec<Branch>,
    /// Transitive closure of `direct_provenance`.
    pub provenance: Vec<Branch>,
    /// Branches whose provenance closure contains this branch.
    pub subvenance: Vec<Branch>,
    pub trigger: Option<Trigger>,
}

impl BranchInfo {
    fn new(branch: Branch) -> Self {
        BranchInfo {
            branch,
            head: None,
            direct_provenance: Vec::new(),
            provenance: Vec::new(),
            subvenance: Vec::new(),
            trigger: None,
        }
    }
}

/// Access level required by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Reader,
    Writer,
    Owner,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Reader => f.write_str("reader"),
            Scope::Writer => f.write_str("writer"),
            Scope::Owner => f.write_str("owner"),
        }
    }
}

/// Authorization seam. Every operation names the repo it touches and
/// the scope it needs before doing any work.
pub trait AuthGate: Send + Sync {
    fn check(&self, subject: &str, repo: &str, scope: Scope) -> bool;
}

/// Gate that admits everything. The default.
pub struct AllowAll;

impl AuthGate for AllowAll {
    fn check(&self, _subject: &str, _repo: &str, _scope: Scope) -> bool {
        true
    }
}

/// Repo layer errors.
#[derive(Debug)]
pub enum Error {
    RepoNotFound(String),
    RepoExists(String),
    /// A non-forced repo deletion found branches or commits.
    RepoNotEmpty(String),
    BranchNotFound(Branch),
    /// A non-forced branch deletion found subvenant branches.
    BranchHasSubvenance(Branch),
    /// The branch exists but has no head commit.
    NoHead(Branch),
    CommitNotFound(Commit),
    /// The branch head is still open, so a new commit cannot start.
    HeadUnfinished(Branch),
    /// A write targeted an already-finished commit.
    CommitFinished(Commit),
    /// A read targeted a commit that has not finished yet.
    CommitNotFinished(Commit),
    /// Deletion refused: the commit is a branch head, has children, or
    /// has downstream subvenance.
    CommitHasReferences(Commit),
    /// The requested branch provenance would close a cycle.
    ProvenanceCycle(Branch),
    /// A trigger's configuration is unusable.
    InvalidTrigger(String),
    FileNotFound { commit: Commit, path: String },
    /// Copying in overwrite mode is not supported.
    OverwriteUnsupported { commit: Commit, path: String },
    InvalidGlob(GlobError),
    NotAuthorized {
        subject: String,
        repo: String,
        required: Scope,
    },
    /// Optimistic retries exhausted.
    Conflict,
    /// A metadata record failed to decode as its expected variant.
    Corrupt(String),
    Storage(fileset::Error),
    /// The store shut down under a blocking operation.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RepoNotFound(name) => write!(f, "repo {name} not found"),
            Error::RepoExists(name) => write!(f, "repo {name} already exists"),
            Error::RepoNotEmpty(name) => {
                write!(f, "repo {name} still has branches or commits (use force)")
            }
            Error::BranchNotFound(branch) => write!(f, "branch {branch} not found"),
            Error::BranchHasSubvenance(branch) => {
                write!(f, "branch {branch} has subvenant branches (use force)")
            }
            Error::NoHead(branch) => write!(f, "branch {branch} has no head commit"),
            Error::CommitNotFound(commit) => write!(f, "commit {commit} not found"),
            Error::HeadUnfinished(branch) => {
                write!(f, "branch {branch} head is not finished")
            }
            Error::CommitFinished(commit) => {
                write!(f, "commit {commit} is already finished")
            }
            Error::CommitNotFinished(commit) => {
                write!(f, "commit {commit} has not finished")
            }
            Error::CommitHasReferences(commit) => {
                write!(f, "commit {commit} is still referenced")
            }
            Error::ProvenanceCycle(branch) => {
                write!(f, "provenance of {branch} would form a cycle")
            }
            Error::InvalidTrigger(reason) => write!(f, "invalid trigger: {reason}"),
            Error::FileNotFound { commit, path } => {
                write!(f, "file {path} not found in {commit}")
            }
            Error::OverwriteUnsupported { commit, path } => {
                write!(f, "overwriting {path} in {commit} is not supported")
            }
            Error::InvalidGlob(err) => write!(f, "{err}"),
            Error::NotAuthorized {
                subject,
                repo,
                required,
            } => write!(f, "{subject} is not a {required} of {repo}"),
            Error::Conflict => f.write_str("too many conflicting metadata writers"),
            Error::Corrupt(what) => write!(f, "corrupt metadata: {what}"),
            Error::Storage(err) => write!(f, "{err}"),
            Error::Closed => f.write_str("store closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(err) => Some(err),
            Error::InvalidGlob(err) => Some(err),
            _ => None,
        }
    }
}

impl From<fileset::Error> for Error {
    fn from(err: fileset::Error) -> Self {
        Error::Storage(err)
    }
}

impl From<GlobError> for Error {
    fn from(err: GlobError) -> Self {
        Error::InvalidGlob(err)
    }
}

impl From<TxnError<Error>> for Error {
    fn from(err: TxnError<Error>) -> Self {
        match err {
            TxnError::Aborted(e) => e,
            TxnError::Conflict => Error::Conflict,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Metadata key space. Commit-scoped keys use canonical hex ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    Repo(String),
    Branch(String, String),
    Commit(String, String),
    /// Filesets written into an open commit, in order.
    Staged(String, String),
    /// The total fileset of a finished commit.
    Binding(String, String),
}

#[derive(Debug, Clone)]
pub(crate) enum Record {
    Repo(RepoInfo),
    Branch(BranchInfo),
    Commit(CommitInfo),
    Staged(Vec<FilesetId>),
    Binding(FilesetId),
}

/// The repo layer handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Repository {
    meta: MetaStore<Key, Record>,
    storage: Storage,
    auth: Arc<dyn AuthGate>,
    subject: String,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    pub fn new() -> Self {
        Self::with_storage(Storage::new())
    }

    pub fn with_storage(storage: Storage) -> Self {
        Repository {
            meta: MetaStore::new(),
            storage,
            auth: Arc::new(AllowAll),
            subject: "anonymous".to_string(),
        }
    }

    /// Replaces the authorization gate.
    pub fn auth_gate(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = auth;
        self
    }

    /// A handle acting as `subject` against the same store.
    pub fn as_subject(&self, subject: impl Into<String>) -> Self {
        let mut repo = self.clone();
        repo.subject = subject.into();
        repo
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn meta(&self) -> &MetaStore<Key, Record> {
        &self.meta
    }

    fn authorize(&self, repo: &str, scope: Scope) -> Result<()> {
        if self.auth.check(&self.subject, repo, scope) {
            Ok(())
        } else {
            Err(Error::NotAuthorized {
                subject: self.subject.clone(),
                repo: repo.to_string(),
                required: scope,
            })
        }
    }

    // ---- repos ----

    pub async fn create_repo(&self, name: &str, description: &str) -> Result<()> {
        self.authorize(name, Scope::Owner)?;
        let info = RepoInfo {
            name: name.to_string(),
            description: description.to_string(),
            created: SystemTime::now(),
        };
        self.meta
            .in_txn(|txn| {
                if txn.get(&Key::Repo(info.name.clone())).is_some() {
                    return Err(Error::RepoExists(info.name.clone()));
                }
                txn.put(Key::Repo(info.name.clone()), Record::Repo(info.clone()));
                Ok(())
            })
            .await?;
        info!(repo = name, "created repo");
        Ok(())
    }

    pub fn inspect_repo(&self, name: &str) -> Result<RepoInfo> {
        self.authorize(name, Scope::Reader)?;
        self.repo_record(name)
    }

    pub fn list_repos(&self) -> Vec<RepoInfo> {
        self.meta
            .select(|k| matches!(k, Key::Repo(_)))
            .into_iter()
            .filter_map(|(_, record)| match record {
                Record::Repo(info) => Some(info),
                _ => None,
            })
            .filter(|info| self.auth.check(&self.subject, &info.name, Scope::Reader))
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect()
    }

    /// Deletes a repo. Without `force` the repo must hold no branches or
    /// commits; with `force` both are cascaded. Either way the deletion
    /// is refused while branches in other repos depend on this one.
    pub async fn delete_repo(&self, name: &str, force: bool) -> Result<()> {
        self.authorize(name, Scope::Owner)?;
        let name = name.to_string();
        let bindings = self
            .meta
            .in_txn(|txn| {
                graph::get_repo(txn, &name)?;
                for info in graph::all_branches(txn)? {
                    if info.branch.repo != name {
                        if let Some(dep) = info
                            .direct_provenance
                            .iter()
                            .find(|p| p.repo == name)
                        {
                            return Err(Error::BranchHasSubvenance(dep.clone()));
                        }
                    }
                }
                let keys: Vec<Key> = txn
                    .select(|k| match k {
                        Key::Repo(r)
                        | Key::Branch(r, _)
                        | Key::Commit(r, _)
                        | Key::Staged(r, _)
                        | Key::Binding(r, _) => r == &name,
                    })
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect();
                if !force && keys.len() > 1 {
                    return Err(Error::RepoNotEmpty(name.clone()));
                }
                let mut bindings = Vec::new();
                for key in keys {
                    if let Key::Binding(repo, id) = &key {
                        if let Some(Record::Binding(fileset)) =
                            txn.get(&Key::Binding(repo.clone(), id.clone()))
                        {
                            bindings.push(fileset);
                        }
                    }
                    txn.delete(key);
                }
                graph::rebuild_closures(txn)?;
                Ok(bindings)
            })
            .await?;
        for id in bindings {
            self.storage.delete(&id);
        }
        info!(repo = %name, "deleted repo");
        Ok(())
    }

    // ---- branches ----

    /// Creates or re-points a branch.
    ///
    /// `head` is a commit reference within the repo; when absent an
    /// existing branch keeps its head and a fresh branch gets a new
    /// empty finished commit. Provenance edges are replaced wholesale
    /// and the branch (plus its subvenants) is re-aligned with the
    /// current upstream heads.
    pub async fn create_branch(
        &self,
        branch: &Branch,
        head: Option<&str>,
        provenance: &[Branch],
        trigger: Option<Trigger>,
    ) -> Result<()> {
        self.authorize(&branch.repo, Scope::Writer)?;
        if let Some(t) = &trigger {
            if t.branch == branch.name {
                return Err(Error::InvalidTrigger(format!(
                    "branch {branch} cannot trigger on itself"
                )));
            }
            if t.size_bytes == 0 && t.commits == 0 && t.cron_spec.is_empty() {
                return Err(Error::InvalidTrigger("no conditions configured".to_string()));
            }
        }
        let branch = branch.clone();
        let mut direct: Vec<Branch> = Vec::new();
        for upstream in provenance {
            if !direct.contains(upstream) {
                direct.push(upstream.clone());
            }
        }
        let storage = self.storage.clone();
        let now = SystemTime::now();
        let empty_binding = self
            .meta
            .in_txn(|txn| {
                graph::get_repo(txn, &branch.repo)?;
                graph::detect_cycle(txn, &branch, &direct)?;
                for upstream in &direct {
                    graph::get_branch(txn, upstream)?;
                }
                if let Some(t) = &trigger {
                    graph::get_branch(txn, &Branch::new(&branch.repo, &t.branch))?;
                }
                let existing = graph::maybe_branch(txn, &branch)?;
                let resolved_head = match head {
                    Some(reference) => Some(
                        graph::resolve_commit(txn, &Commit::new(&branch.repo, reference))?.commit,
                    ),
                    None => existing.as_ref().and_then(|info| info.head.clone()),
                };
                let mut info = existing.unwrap_or_else(|| BranchInfo::new(branch.clone()));
                info.head = resolved_head;
                info.direct_provenance = direct.clone();
                info.trigger = trigger.clone();
                let mut empty_binding = None;
                if info.head.is_none() {
                    // Fresh branches start from a finished empty commit
                    // so the first user commit has a finished parent.
                    let commit = Commit::new(&branch.repo, CommitId::random().to_hex());
                    let mut seed =
                        CommitInfo::new(commit.clone(), branch.clone(), CommitOrigin::User, now);
                    seed.finished = Some(now);
                    let bound = storage.compact(&[], DEFAULT_TTL)?;
                    commitstore::bind(txn, &commit, bound);
                    graph::put_commit(txn, seed);
                    info.head = Some(commit);
                    empty_binding = Some(bound);
                }
                graph::put_branch(txn, info);
                graph::rebuild_closures(txn)?;
                graph::align_new_branch(txn, &branch, now)?;
                graph::propagate(txn, &branch, now)?;
                Ok(empty_binding)
            })
            .await?;
        if let Some(id) = empty_binding {
            self.storage.pin(&id)?;
        }
        Ok(())
    }

    pub fn inspect_branch(&self, branch: &Branch) -> Result<BranchInfo> {
        self.authorize(&branch.repo, Scope::Reader)?;
        self.repo_record(&branch.repo)?;
        self.branch_record(branch)
    }

    pub fn list_branches(&self, repo: &str) -> Result<Vec<BranchInfo>> {
        self.authorize(repo, Scope::Reader)?;
        self.repo_record(repo)?;
        let mut branches: Vec<BranchInfo> = self
            .meta
            .select(|k| matches!(k, Key::Branch(r, _) if r == repo))
            .into_iter()
            .filter_map(|(_, record)| match record {
                Record::Branch(info) => Some(info),
                _ => None,
            })
            .collect();
        branches.sort_by(|a, b| a.branch.name.cmp(&b.branch.name));
        Ok(branches)
    }

    /// Deletes a branch. Commits stay; only the head pointer and the
    /// branch's graph edges go away. Refused while other branches list
    /// this one in their provenance unless `force`, which severs their
    /// direct edges first.
    pub async fn delete_branch(&self, branch: &Branch, force: bool) -> Result<()> {
        self.authorize(&branch.repo, Scope::Owner)?;
        let branch = branch.clone();
        self.meta
            .in_txn(|txn| {
                let info = graph::get_branch(txn, &branch)?;
                if !info.subvenance.is_empty() {
                    if !force {
                        return Err(Error::BranchHasSubvenance(branch.clone()));
                    }
                    for downstream in &info.subvenance {
                        let mut d = graph::get_branch(txn, downstream)?;
                        d.direct_provenance.retain(|p| p != &branch);
                        graph::put_branch(txn, d);
                    }
                }
                txn.delete(Key::Branch(branch.repo.clone(), branch.name.clone()));
                graph::rebuild_closures(txn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ---- commits ----

    /// Opens a new commit at the head of `branch`, with provenance edges
    /// to the heads of the branch's provenance plus `extra_provenance`.
    /// The branch is created on the fly if it does not exist. Fails if
    /// the current head is still open.
    pub async fn start_commit(
        &self,
        branch: &Branch,
        extra_provenance: &[Branch],
    ) -> Result<Commit> {
        self.authorize(&branch.repo, Scope::Writer)?;
        let branch = branch.clone();
        let extra = extra_provenance.to_vec();
        let now = SystemTime::now();
        let commit = self
            .meta
            .in_txn(|txn| {
                graph::get_repo(txn, &branch.repo)?;
                let mut info = graph::maybe_branch(txn, &branch)?
                    .unwrap_or_else(|| BranchInfo::new(branch.clone()));
                if let Some(head) = &info.head {
                    let head_info = graph::get_commit(txn, &head.repo, &head.id)?;
                    if head_info.finished.is_none() {
                        return Err(Error::HeadUnfinished(branch.clone()));
                    }
                }
                let commit = Commit::new(&branch.repo, CommitId::random().to_hex());
                let mut new =
                    CommitInfo::new(commit.clone(), branch.clone(), CommitOrigin::User, now);
                new.parent = info.head.clone();
                let mut edge_branches = info.direct_provenance.clone();
                for upstream in &extra {
                    if !edge_branches.contains(upstream) {
                        edge_branches.push(upstream.clone());
                    }
                }
                let mut seen: HashSet<String> = HashSet::new();
                for upstream in &edge_branches {
                    let Some(upstream_info) = graph::maybe_branch(txn, upstream)? else {
                        continue;
                    };
                    let Some(head) = upstream_info.head else {
                        continue;
                    };
                    if seen.insert(format!("{}@{}", head.repo, head.id)) {
                        new.provenance.push(CommitProvenance {
                            commit: head,
                            branch: upstream.clone(),
                        });
                    }
                }
                new.ready_provenance = graph::register_edges(txn, &new)?;
                if let Some(parent) = &new.parent {
                    let mut parent_info = graph::get_commit(txn, &parent.repo, &parent.id)?;
                    parent_info.children.push(commit.clone());
                    graph::put_commit(txn, parent_info);
                }
                graph::put_commit(txn, new);
                info.head = Some(commit.clone());
                graph::put_branch(txn, info);
                graph::propagate(txn, &branch, now)?;
                Ok(commit)
            })
            .await?;
        info!(commit = %commit, "started commit");
        Ok(commit)
    }

    /// Finishes an open commit: compacts the parent binding and every
    /// staged fileset into the commit's total fileset, pins it, and
    /// cascades readiness to subvenant commits. `empty` discards staged
    /// data and counts as a failure for upstream bookkeeping.
    pub async fn finish_commit(
        &self,
        commit: &Commit,
        description: &str,
        empty: bool,
    ) -> Result<()> {
        self.authorize(&commit.repo, Scope::Writer)?;
        let commit = commit.clone();
        let description = description.to_string();
        let storage = self.storage.clone();
        let now = SystemTime::now();
        let (canonical, binding) = self
            .meta
            .in_txn(|txn| {
                let mut info = graph::resolve_commit(txn, &commit)?;
                if info.finished.is_some() {
                    return Err(Error::CommitFinished(info.commit.clone()));
                }
                let mut inputs: Vec<FilesetId> = Vec::new();
                if !empty {
                    if let Some(parent) = &info.parent {
                        if let Some(parent_binding) = commitstore::binding(txn, parent)? {
                            inputs.push(parent_binding);
                        }
                    }
                    inputs.extend(commitstore::staged(txn, &info.commit)?);
                }
                let bound = storage.compact(&inputs, DEFAULT_TTL)?;
                info.size_bytes = storage.resolved_size(&[bound])?;
                info.finished = Some(now);
                info.description = description.clone();
                commitstore::bind(txn, &info.commit, bound);
                commitstore::clear_staged(txn, &info.commit);
                graph::cascade_finish(txn, &info, empty)?;
                let moved = graph::evaluate_triggers(txn, &info)?;
                let canonical = info.commit.clone();
                graph::put_commit(txn, info);
                for branch in moved {
                    graph::propagate(txn, &branch, now)?;
                }
                Ok((canonical, bound))
            })
            .await?;
        self.storage.pin(&binding)?;
        info!(commit = %canonical, empty, "finished commit");
        Ok(())
    }

    /// Resolves a commit reference. With `wait`, blocks until the commit
    /// reaches at least the given state.
    pub async fn inspect_commit(
        &self,
        commit: &Commit,
        wait: Option<CommitState>,
    ) -> Result<CommitInfo> {
        self.authorize(&commit.repo, Scope::Reader)?;
        // Subscribe before the first read so no commit between the two
        // is missed.
        let mut rx = self.meta.watch();
        let mut info = self.resolve_snapshot(commit)?;
        let Some(target) = wait else {
            return Ok(info);
        };
        loop {
            if info.state() >= target {
                return Ok(info);
            }
            if rx.changed().await.is_err() {
                return Err(Error::Closed);
            }
            info = self.resolve_snapshot(&info.commit)?;
        }
    }

    /// Lists commits newest first. With `to`, walks the parent chain
    /// down from that commit instead of scanning the whole repo; `from`
    /// bounds the walk exclusively and `number` caps the result.
    pub fn list_commits(
        &self,
        repo: &str,
        to: Option<&Commit>,
        from: Option<&Commit>,
        number: Option<usize>,
    ) -> Result<Vec<CommitInfo>> {
        self.authorize(repo, Scope::Reader)?;
        self.repo_record(repo)?;
        let stop = match from {
            Some(from) => Some(self.resolve_snapshot(from)?.commit.id),
            None => None,
        };
        let limit = number.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        match to {
            Some(to) => {
                let mut cur = Some(self.resolve_snapshot(to)?);
                while let Some(info) = cur {
                    if out.len() >= limit || Some(&info.commit.id) == stop.as_ref() {
                        break;
                    }
                    let parent = info.parent.clone();
                    out.push(info);
                    cur = match parent {
                        Some(p) => Some(self.commit_record(&p.repo, &p.id)?),
                        None => None,
                    };
                }
            }
            None => {
                let all = self
                    .meta
                    .select(|k| matches!(k, Key::Commit(r, _) if r == repo))
                    .into_iter()
                    .filter_map(|(_, record)| match record {
                        Record::Commit(info) => Some(info),
                        _ => None,
                    })
                    .sorted_by(|a, b| (b.started, &b.commit.id).cmp(&(a.started, &a.commit.id)));
                for info in all {
                    if out.len() >= limit || Some(&info.commit.id) == stop.as_ref() {
                        break;
                    }
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    /// Deletes a commit that nothing references: no children, no
    /// subvenance, and no branch head pointing at it.
    pub async fn delete_commit(&self, commit: &Commit) -> Result<()> {
        self.authorize(&commit.repo, Scope::Writer)?;
        let commit = commit.clone();
        let removed = self
            .meta
            .in_txn(|txn| {
                let info = graph::resolve_commit(txn, &commit)?;
                if !info.children.is_empty() || !info.subvenance.is_empty() {
                    return Err(Error::CommitHasReferences(info.commit.clone()));
                }
                for branch in graph::all_branches(txn)? {
                    if branch.head.as_ref() == Some(&info.commit) {
                        return Err(Error::CommitHasReferences(info.commit.clone()));
                    }
                }
                if let Some(parent) = &info.parent {
                    let mut parent_info = graph::get_commit(txn, &parent.repo, &parent.id)?;
                    parent_info.children.retain(|c| c != &info.commit);
                    graph::put_commit(txn, parent_info);
                }
                for edge in &info.provenance {
                    let mut upstream =
                        graph::get_commit(txn, &edge.commit.repo, &edge.commit.id)?;
                    // A deletable commit is the newest of any range that
                    // holds it.
                    if let Some(pos) = upstream
                        .subvenance
                        .iter()
                        .position(|r| r.upper == info.commit)
                    {
                        if upstream.subvenance[pos].lower == info.commit {
                            upstream.subvenance.remove(pos);
                        } else if let Some(parent) = &info.parent {
                            upstream.subvenance[pos].upper = parent.clone();
                        }
                    }
                    upstream.subvenant_total = upstream.subvenant_total.saturating_sub(1);
                    graph::put_commit(txn, upstream);
                }
                let binding = commitstore::binding(txn, &info.commit)?;
                commitstore::remove_binding(txn, &info.commit);
                commitstore::clear_staged(txn, &info.commit);
                txn.delete(Key::Commit(info.commit.repo.clone(), info.commit.id.clone()));
                Ok(binding)
            })
            .await?;
        if let Some(id) = removed {
            self.storage.delete(&id);
        }
        Ok(())
    }

    /// Drops everything staged into an open commit.
    pub async fn clear_commit(&self, commit: &Commit) -> Result<()> {
        self.authorize(&commit.repo, Scope::Writer)?;
        let commit = commit.clone();
        self.meta
            .in_txn(|txn| {
                let info = graph::resolve_commit(txn, &commit)?;
                if info.finished.is_some() {
                    return Err(Error::CommitFinished(info.commit.clone()));
                }
                commitstore::clear_staged(txn, &info.commit);
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ---- blocking streams ----

    /// Every commit transitively caused by `commits`, emitted as each
    /// finishes, in causal order. `to_repos` filters the output without
    /// narrowing the traversal; empty means no filter. The stream ends
    /// once all downstream commits known at that point are accounted
    /// for.
    pub fn flush_commit(
        &self,
        commits: Vec<Commit>,
        to_repos: Vec<String>,
    ) -> impl Stream<Item = Result<CommitInfo>> {
        struct FlushState {
            repo: Repository,
            seeds: Vec<Commit>,
            canonical: Option<Vec<Commit>>,
            processed: HashSet<(String, String)>,
            to_repos: Vec<String>,
            rx: watch::Receiver<u64>,
            failed: bool,
        }
        let state = FlushState {
            repo: self.clone(),
            seeds: commits,
            canonical: None,
            processed: HashSet::new(),
            to_repos,
            rx: self.meta.watch(),
            failed: false,
        };
        futures::stream::unfold(state, |mut st| async move {
            if st.failed {
                return None;
            }
            if st.canonical.is_none() {
                let mut canonical = Vec::new();
                for seed in &st.seeds {
                    match st.repo.resolve_snapshot(seed) {
                        Ok(info) => canonical.push(info.commit),
                        Err(err) => {
                            st.failed = true;
                            return Some((Err(err), st));
                        }
                    }
                }
                st.canonical = Some(canonical);
            }
            let seeds = st.canonical.clone().unwrap_or_default();
            let seed_keys: HashSet<(String, String)> = seeds
                .iter()
                .map(|c| (c.repo.clone(), c.id.clone()))
                .collect();
            loop {
                let downstream = match st.repo.commits_downstream(&seeds) {
                    Ok(downstream) => downstream,
                    Err(err) => {
                        st.failed = true;
                        return Some((Err(err), st));
                    }
                };
                let in_set: HashSet<(String, String)> = downstream
                    .iter()
                    .map(|i| (i.commit.repo.clone(), i.commit.id.clone()))
                    .collect();
                let mut pending: Vec<&CommitInfo> = downstream
                    .iter()
                    .filter(|i| {
                        !st.processed
                            .contains(&(i.commit.repo.clone(), i.commit.id.clone()))
                    })
                    .collect();
                if pending.is_empty() {
                    return None;
                }
                pending.sort_by(|a, b| (a.started, &a.commit.id).cmp(&(b.started, &b.commit.id)));
                // Emit in causal order: a commit waits for its upstream
                // edges within the flush set.
                let candidate = pending.into_iter().find(|i| {
                    i.provenance.iter().all(|e| {
                        let key = (e.commit.repo.clone(), e.commit.id.clone());
                        !in_set.contains(&key)
                            || seed_keys.contains(&key)
                            || st.processed.contains(&key)
                    })
                });
                let Some(candidate) = candidate else {
                    if st.rx.changed().await.is_err() {
                        return None;
                    }
                    continue;
                };
                let target = candidate.commit.clone();
                let info = loop {
                    match st.repo.commit_record(&target.repo, &target.id) {
                        Ok(info) if info.finished.is_some() => break info,
                        Ok(_) => {
                            if st.rx.changed().await.is_err() {
                                return None;
                            }
                        }
                        Err(err) => {
                            st.failed = true;
                            return Some((Err(err), st));
                        }
                    }
                };
                st.processed.insert((target.repo, target.id));
                if st.to_repos.is_empty() || st.to_repos.contains(&info.commit.repo) {
                    return Some((Ok(info), st));
                }
            }
        })
    }

    /// An endless stream of commits on `branch` in creation order,
    /// emitting each one once it reaches `min_state`. `from` skips
    /// commits up to and including the given reference. A branch that
    /// does not exist yet is waited for, not an error.
    pub fn subscribe_commit(
        &self,
        branch: &Branch,
        from: Option<Commit>,
        min_state: CommitState,
    ) -> impl Stream<Item = Result<CommitInfo>> {
        struct SubState {
            repo: Repository,
            branch: Branch,
            start: Option<Option<Commit>>,
            cursor: Option<String>,
            min_state: CommitState,
            rx: watch::Receiver<u64>,
            failed: bool,
        }
        let state = SubState {
            repo: self.clone(),
            branch: branch.clone(),
            start: Some(from),
            cursor: None,
            min_state,
            rx: self.meta.watch(),
            failed: false,
        };
        futures::stream::unfold(state, |mut st| async move {
            if st.failed {
                return None;
            }
            if let Some(from) = st.start.take() {
                if let Some(from) = from {
                    match st.repo.resolve_snapshot(&from) {
                        Ok(info) => st.cursor = Some(info.commit.id),
                        Err(err) => {
                            st.failed = true;
                            return Some((Err(err), st));
                        }
                    }
                }
            }
            loop {
                let next = match st.repo.next_on_branch(&st.branch, st.cursor.as_deref()) {
                    Ok(next) => next,
                    Err(err) => {
                        st.failed = true;
                        return Some((Err(err), st));
                    }
                };
                let Some(target) = next else {
                    if st.rx.changed().await.is_err() {
                        return None;
                    }
                    continue;
                };
                match st.repo.commit_record(&target.repo, &target.id) {
                    Ok(info) if info.state() >= st.min_state => {
                        st.cursor = Some(info.commit.id.clone());
                        return Some((Ok(info), st));
                    }
                    Ok(_) => {
                        if st.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(err) => {
                        st.failed = true;
                        return Some((Err(err), st));
                    }
                }
            }
        })
    }

    // ---- snapshot reads ----

    fn repo_record(&self, name: &str) -> Result<RepoInfo> {
        match self.meta.get(&Key::Repo(name.to_string())) {
            Some(Record::Repo(info)) => Ok(info),
            Some(_) => Err(Error::Corrupt(format!("repo record for {name}"))),
            None => Err(Error::RepoNotFound(name.to_string())),
        }
    }

    fn branch_record(&self, branch: &Branch) -> Result<BranchInfo> {
        match self
            .meta
            .get(&Key::Branch(branch.repo.clone(), branch.name.clone()))
        {
            Some(Record::Branch(info)) => Ok(info),
            Some(_) => Err(Error::Corrupt(format!("branch record for {branch}"))),
            None => Err(Error::BranchNotFound(branch.clone())),
        }
    }

    pub(crate) fn commit_record(&self, repo: &str, id: &str) -> Result<CommitInfo> {
        match self.meta.get(&Key::Commit(repo.to_string(), id.to_string())) {
            Some(Record::Commit(info)) => Ok(info),
            Some(_) => Err(Error::Corrupt(format!("commit record for {repo}@{id}"))),
            None => Err(Error::CommitNotFound(Commit::new(repo, id))),
        }
    }

    /// Resolves a commit reference from a snapshot, outside any
    /// transaction.
    pub(crate) fn resolve_snapshot(&self, commit: &Commit) -> Result<CommitInfo> {
        self.repo_record(&commit.repo)?;
        if CommitId::from_hex(&commit.id).is_some() {
            return self.commit_record(&commit.repo, &commit.id);
        }
        let branch = Branch::new(&commit.repo, &commit.id);
        let info = self.branch_record(&branch)?;
        let head = info.head.ok_or(Error::NoHead(branch))?;
        self.commit_record(&head.repo, &head.id)
    }

    /// Transitive downstream set of `seeds`, via subvenance expansion.
    fn commits_downstream(&self, seeds: &[Commit]) -> Result<Vec<CommitInfo>> {
        let mut out = Vec::new();
        let mut seen: HashSet<(String, String)> = seeds
            .iter()
            .map(|c| (c.repo.clone(), c.id.clone()))
            .collect();
        let mut queue: VecDeque<CommitInfo> = VecDeque::new();
        for seed in seeds {
            queue.push_back(self.commit_record(&seed.repo, &seed.id)?);
        }
        while let Some(info) = queue.pop_front() {
            for commit in self.expand_subvenance_snapshot(&info)? {
                if seen.insert((commit.repo.clone(), commit.id.clone())) {
                    let downstream = self.commit_record(&commit.repo, &commit.id)?;
                    out.push(downstream.clone());
                    queue.push_back(downstream);
                }
            }
        }
        Ok(out)
    }

    fn expand_subvenance_snapshot(&self, info: &CommitInfo) -> Result<Vec<Commit>> {
        let mut out = Vec::new();
        for range in &info.subvenance {
            let lower = self.commit_record(&range.lower.repo, &range.lower.id)?;
            let branch = lower.branch.clone();
            let mut cur = lower;
            loop {
                out.push(cur.commit.clone());
                if cur.commit == range.upper {
                    break;
                }
                let next = cur.children.iter().find_map(|child| {
                    self.commit_record(&child.repo, &child.id)
                        .ok()
                        .filter(|c| c.branch == branch)
                });
                match next {
                    Some(next) => cur = next,
                    None => {
                        return Err(Error::Corrupt(format!(
                            "broken subvenance range {}..{}",
                            range.lower, range.upper
                        )))
                    }
                }
            }
        }
        Ok(out)
    }

    /// The oldest commit on `branch` newer than `cursor`, walking the
    /// parent chain down from the head and stopping where the chain
    /// leaves the branch.
    fn next_on_branch(&self, branch: &Branch, cursor: Option<&str>) -> Result<Option<Commit>> {
        self.repo_record(&branch.repo)?;
        let info = match self
            .meta
            .get(&Key::Branch(branch.repo.clone(), branch.name.clone()))
        {
            Some(Record::Branch(info)) => info,
            Some(_) => return Err(Error::Corrupt(format!("branch record for {branch}"))),
            None => return Ok(None),
        };
        let Some(head) = info.head else {
            return Ok(None);
        };
        let mut chain = Vec::new();
        let mut cur = Some(head);
        while let Some(commit) = cur {
            if Some(commit.id.as_str()) == cursor {
                break;
            }
            let commit_info = self.commit_record(&commit.repo, &commit.id)?;
            if commit_info.branch != *branch {
                break;
            }
            chain.push(commit);
            cur = commit_info.parent;
        }
        Ok(chain.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_lifecycle_on_one_branch() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = Branch::new("data", "main");
        repo.create_branch(&main, None, &[], None).await.unwrap();

        // A fresh branch has a finished empty head.
        let head = repo
            .inspect_commit(&Commit::new("data", "main"), None)
            .await
            .unwrap();
        assert_eq!(head.state(), CommitState::Finished);
        assert_eq!(head.size_bytes, 0);

        let commit = repo.start_commit(&main, &[]).await.unwrap();
        assert!(CommitId::from_hex(&commit.id).is_some());
        let open = repo.inspect_commit(&commit, None).await.unwrap();
        assert_eq!(open.parent, Some(head.commit.clone()));
        assert_eq!(open.state(), CommitState::Ready);

        // Second start on the same branch is refused while the head is
        // open.
        assert!(matches!(
            repo.start_commit(&main, &[]).await,
            Err(Error::HeadUnfinished(_))
        ));

        repo.finish_commit(&commit, "first", false).await.unwrap();
        let finished = repo.inspect_commit(&commit, None).await.unwrap();
        assert_eq!(finished.state(), CommitState::Finished);
        assert_eq!(finished.description, "first");
    }

    #[tokio::test]
    async fn branch_name_resolves_to_head() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = Branch::new("data", "main");
        repo.create_branch(&main, None, &[], None).await.unwrap();
        let commit = repo.start_commit(&main, &[]).await.unwrap();
        let resolved = repo
            .inspect_commit(&Commit::new("data", "main"), None)
            .await
            .unwrap();
        assert_eq!(resolved.commit, commit);
    }

    #[tokio::test]
    async fn provenance_cycle_is_refused() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let a = Branch::new("data", "a");
        let b = Branch::new("data", "b");
        repo.create_branch(&a, None, &[], None).await.unwrap();
        repo.create_branch(&b, None, &[a.clone()], None).await.unwrap();
        assert!(matches!(
            repo.create_branch(&a, None, &[b.clone()], None).await,
            Err(Error::ProvenanceCycle(_))
        ));
    }

    #[tokio::test]
    async fn propagation_mints_alias_commits() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = Branch::new("data", "main");
        let out = Branch::new("data", "out");
        repo.create_branch(&main, None, &[], None).await.unwrap();
        repo.create_branch(&out, None, &[main.clone()], None)
            .await
            .unwrap();

        let commit = repo.start_commit(&main, &[]).await.unwrap();
        let alias = repo
            .inspect_commit(&Commit::new("data", "out"), None)
            .await
            .unwrap();
        assert_eq!(alias.origin, CommitOrigin::Auto);
        assert_eq!(alias.provenance.len(), 1);
        assert_eq!(alias.provenance[0].commit, commit);
        assert_eq!(alias.ready_provenance, 0);
        assert_eq!(alias.state(), CommitState::Started);

        repo.finish_commit(&commit, "", false).await.unwrap();
        let alias = repo
            .inspect_commit(&alias.commit, None)
            .await
            .unwrap();
        assert_eq!(alias.ready_provenance, 1);
        assert_eq!(alias.state(), CommitState::Ready);

        let upstream = repo.inspect_commit(&commit, None).await.unwrap();
        assert_eq!(upstream.subvenant_total, 1);
        assert_eq!(upstream.subvenance.len(), 1);
    }

    #[tokio::test]
    async fn empty_finish_counts_as_failure_upstream() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = Branch::new("data", "main");
        let out = Branch::new("data", "out");
        repo.create_branch(&main, None, &[], None).await.unwrap();
        repo.create_branch(&out, None, &[main.clone()], None)
            .await
            .unwrap();
        let commit = repo.start_commit(&main, &[]).await.unwrap();
        repo.finish_commit(&commit, "", false).await.unwrap();
        let alias = repo
            .inspect_commit(&Commit::new("data", "out"), None)
            .await
            .unwrap();
        repo.finish_commit(&alias.commit, "", true).await.unwrap();
        let upstream = repo.inspect_commit(&commit, None).await.unwrap();
        assert_eq!(upstream.subvenant_failure, 1);
        assert_eq!(upstream.subvenant_success, 0);
    }

    #[tokio::test]
    async fn delete_repo_requires_force_or_empty() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        repo.create_branch(&Branch::new("data", "main"), None, &[], None)
            .await
            .unwrap();
        assert!(matches!(
            repo.delete_repo("data", false).await,
            Err(Error::RepoNotEmpty(_))
        ));
        repo.delete_repo("data", true).await.unwrap();
        assert!(matches!(
            repo.inspect_repo("data"),
            Err(Error::RepoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_commits_walks_newest_first_with_bounds() {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        let main = Branch::new("data", "main");
        repo.create_branch(&main, None, &[], None).await.unwrap();
        let head = Commit::new("data", "main");
        let c1 = repo.put_file(&head, "/1", "1").await.unwrap();
        let c2 = repo.put_file(&head, "/2", "2").await.unwrap();
        let c3 = repo.put_file(&head, "/3", "3").await.unwrap();

        let chain = repo
            .list_commits("data", Some(&Commit::new("data", "main")), None, None)
            .unwrap();
        // Seed commit included, newest first.
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0].commit, c3);
        assert_eq!(chain[1].commit, c2);
        assert_eq!(chain[2].commit, c1);

        let bounded = repo.list_commits("data", Some(&c3), Some(&c1), None).unwrap();
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded[0].commit, c3);
        assert_eq!(bounded[1].commit, c2);

        let capped = repo.list_commits("data", None, None, Some(2)).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn auth_gate_blocks_unauthorized_subjects() {
        struct OwnerOnly;
        impl AuthGate for OwnerOnly {
            fn check(&self, subject: &str, _repo: &str, _scope: Scope) -> bool {
                subject == "alice"
            }
        }
        let repo = Repository::new().auth_gate(Arc::new(OwnerOnly));
        let alice = repo.as_subject("alice");
        alice.create_repo("data", "").await.unwrap();
        let mallory = repo.as_subject("mallory");
        assert!(matches!(
            mallory.inspect_repo("data"),
            Err(Error::NotAuthorized { .. })
        ));
    }
}
