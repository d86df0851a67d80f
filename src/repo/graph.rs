//! Provenance graph maintenance.
//!
//! Provenance and subvenance are stored as flat edge lists on branch and
//! commit records keyed by stable ids, never as live bidirectional
//! pointers. Transitive closures are recomputed when edges change, and
//! commit propagation walks subvenant branches in provenance-depth order
//! so every alias commit sees its upstream heads already moved.
//!
//! All functions here operate inside a metadata transaction and stage
//! their writes through it; nothing mutates state directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use crate::id::CommitId;
use crate::meta::Txn;

use super::{
    Branch, BranchInfo, Commit, CommitInfo, CommitOrigin, CommitProvenance, CommitRange, Error,
    Key, Record, Result,
};

pub(crate) type MetaTxn<'a> = Txn<'a, Key, Record>;

pub(crate) fn get_repo(txn: &mut MetaTxn<'_>, name: &str) -> Result<super::RepoInfo> {
    match txn.get(&Key::Repo(name.to_string())) {
        Some(Record::Repo(info)) => Ok(info),
        Some(_) => Err(Error::Corrupt(format!("repo record for {name}"))),
        None => Err(Error::RepoNotFound(name.to_string())),
    }
}

pub(crate) fn maybe_branch(txn: &mut MetaTxn<'_>, branch: &Branch) -> Result<Option<BranchInfo>> {
    match txn.get(&Key::Branch(branch.repo.clone(), branch.name.clone())) {
        Some(Record::Branch(info)) => Ok(Some(info)),
        Some(_) => Err(Error::Corrupt(format!("branch record for {branch}"))),
        None => Ok(None),
    }
}

pub(crate) fn get_branch(txn: &mut MetaTxn<'_>, branch: &Branch) -> Result<BranchInfo> {
    maybe_branch(txn, branch)?.ok_or_else(|| Error::BranchNotFound(branch.clone()))
}

pub(crate) fn put_branch(txn: &mut MetaTxn<'_>, info: BranchInfo) {
    txn.put(
        Key::Branch(info.branch.repo.clone(), info.branch.name.clone()),
        Record::Branch(info),
    );
}

/// Fetches a commit by its canonical hex id.
pub(crate) fn get_commit(txn: &mut MetaTxn<'_>, repo: &str, id: &str) -> Result<CommitInfo> {
    match txn.get(&Key::Commit(repo.to_string(), id.to_string())) {
        Some(Record::Commit(info)) => Ok(info),
        Some(_) => Err(Error::Corrupt(format!("commit record for {repo}@{id}"))),
        None => Err(Error::CommitNotFound(Commit::new(repo, id))),
    }
}

pub(crate) fn put_commit(txn: &mut MetaTxn<'_>, info: CommitInfo) {
    txn.put(
        Key::Commit(info.commit.repo.clone(), info.commit.id.clone()),
        Record::Commit(info),
    );
}

/// Resolves a commit reference: a well-formed hex token names a commit
/// directly, anything else is read as a branch name whose head is taken.
pub(crate) fn resolve_commit(txn: &mut MetaTxn<'_>, commit: &Commit) -> Result<CommitInfo> {
    get_repo(txn, &commit.repo)?;
    if CommitId::from_hex(&commit.id).is_some() {
        return get_commit(txn, &commit.repo, &commit.id);
    }
    let branch = Branch::new(&commit.repo, &commit.id);
    let info = get_branch(txn, &branch)?;
    let head = info.head.ok_or(Error::NoHead(branch))?;
    get_commit(txn, &head.repo, &head.id)
}

pub(crate) fn all_branches(txn: &mut MetaTxn<'_>) -> Result<Vec<BranchInfo>> {
    let records = txn.select(|k| matches!(k, Key::Branch(_, _)));
    let mut out = Vec::with_capacity(records.len());
    for (key, record) in records {
        match record {
            Record::Branch(info) => out.push(info),
            _ => return Err(Error::Corrupt(format!("branch record under {key:?}"))),
        }
    }
    out.sort_by(|a, b| {
        (&a.branch.repo, &a.branch.name).cmp(&(&b.branch.repo, &b.branch.name))
    });
    Ok(out)
}

/// Fails with [`Error::ProvenanceCycle`] if pointing `branch` at `direct`
/// would close a cycle in the branch-provenance relation. Runs before any
/// state is staged.
pub(crate) fn detect_cycle(
    txn: &mut MetaTxn<'_>,
    branch: &Branch,
    direct: &[Branch],
) -> Result<()> {
    let mut queue: VecDeque<Branch> = direct.iter().cloned().collect();
    let mut visited: HashSet<Branch> = HashSet::new();
    while let Some(next) = queue.pop_front() {
        if &next == branch {
            return Err(Error::ProvenanceCycle(branch.clone()));
        }
        if !visited.insert(next.clone()) {
            continue;
        }
        if let Some(info) = maybe_branch(txn, &next)? {
            queue.extend(info.direct_provenance.iter().cloned());
        }
    }
    Ok(())
}

/// Recomputes every branch's transitive provenance closure and rebuilds
/// all subvenance back-edges from the direct edges. Called after any
/// mutation of the branch edge set.
pub(crate) fn rebuild_closures(txn: &mut MetaTxn<'_>) -> Result<()> {
    let branches = all_branches(txn)?;
    let direct: HashMap<Branch, Vec<Branch>> = branches
        .iter()
        .map(|b| (b.branch.clone(), b.direct_provenance.clone()))
        .collect();

    let mut closures: HashMap<Branch, Vec<Branch>> = HashMap::new();
    for info in &branches {
        let mut closure: Vec<Branch> = Vec::new();
        let mut seen: HashSet<Branch> = HashSet::new();
        let mut queue: VecDeque<Branch> = info.direct_provenance.iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(upstream) = direct.get(&next) {
                queue.extend(upstream.iter().cloned());
            }
            closure.push(next);
        }
        closure.sort_by(|a, b| (&a.repo, &a.name).cmp(&(&b.repo, &b.name)));
        closures.insert(info.branch.clone(), closure);
    }

    let mut subvenance: HashMap<Branch, Vec<Branch>> = HashMap::new();
    for (branch, closure) in &closures {
        for upstream in closure {
            subvenance
                .entry(upstream.clone())
                .or_default()
                .push(branch.clone());
        }
    }

    for mut info in branches {
        info.provenance = closures.remove(&info.branch).unwrap_or_default();
        let mut sub = subvenance.remove(&info.branch).unwrap_or_default();
        sub.sort_by(|a, b| (&a.repo, &a.name).cmp(&(&b.repo, &b.name)));
        info.subvenance = sub;
        put_branch(txn, info);
    }
    Ok(())
}

/// The provenance edges a head commit of `info` should carry right now:
/// one per direct provenance branch that has a head.
fn expected_edges(txn: &mut MetaTxn<'_>, info: &BranchInfo) -> Result<Vec<CommitProvenance>> {
    let mut edges = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for upstream in &info.direct_provenance {
        let Some(upstream_info) = maybe_branch(txn, upstream)? else {
            continue;
        };
        let Some(head) = upstream_info.head else {
            continue;
        };
        if seen.insert(format!("{}@{}", head.repo, head.id)) {
            edges.push(CommitProvenance {
                commit: head,
                branch: upstream.clone(),
            });
        }
    }
    Ok(edges)
}

/// Registers a freshly created commit with each of its provenance
/// targets: extends or appends a subvenance range and bumps the target's
/// subvenant total.
pub(crate) fn register_edges(txn: &mut MetaTxn<'_>, info: &CommitInfo) -> Result<u64> {
    let mut ready = 0u64;
    for edge in &info.provenance {
        let mut target = get_commit(txn, &edge.commit.repo, &edge.commit.id)?;
        if target.finished.is_some() {
            ready += 1;
        }
        let extended = match target.subvenance.last_mut() {
            Some(range) if Some(&range.upper) == info.parent.as_ref() => {
                range.upper = info.commit.clone();
                true
            }
            _ => false,
        };
        if !extended {
            target.subvenance.push(CommitRange {
                lower: info.commit.clone(),
                upper: info.commit.clone(),
            });
        }
        target.subvenant_total += 1;
        put_commit(txn, target);
    }
    Ok(ready)
}

/// Aligns one branch with the current heads of its provenance branches,
/// creating an origin=Auto alias commit when they moved. Returns true if
/// a commit was created.
fn align_branch(txn: &mut MetaTxn<'_>, branch: &Branch, now: SystemTime) -> Result<bool> {
    let mut info = get_branch(txn, branch)?;
    let expected = expected_edges(txn, &info)?;
    if expected.is_empty() {
        return Ok(false);
    }
    if let Some(head) = &info.head {
        let head_info = get_commit(txn, &head.repo, &head.id)?;
        let current: HashSet<&str> = head_info
            .provenance
            .iter()
            .map(|e| e.commit.id.as_str())
            .collect();
        let wanted: HashSet<&str> = expected.iter().map(|e| e.commit.id.as_str()).collect();
        if current == wanted {
            return Ok(false);
        }
    }

    let id = CommitId::random().to_hex();
    let commit = Commit::new(&branch.repo, &id);
    let mut alias = CommitInfo::new(commit.clone(), branch.clone(), CommitOrigin::Auto, now);
    alias.parent = info.head.clone();
    alias.provenance = expected;
    alias.ready_provenance = register_edges(txn, &alias)?;
    if let Some(parent) = &alias.parent {
        let mut parent_info = get_commit(txn, &parent.repo, &parent.id)?;
        parent_info.children.push(commit.clone());
        put_commit(txn, parent_info);
    }
    put_commit(txn, alias);
    info.head = Some(commit);
    put_branch(txn, info);
    Ok(true)
}

/// Propagates a head move on `changed` through its subvenant branches:
/// every branch downstream of `changed` gets an alias commit if its
/// provenance heads no longer match, walked shallowest-first so deeper
/// branches see their upstream aliases.
pub(crate) fn propagate(txn: &mut MetaTxn<'_>, changed: &Branch, now: SystemTime) -> Result<()> {
    let mut affected: Vec<BranchInfo> = all_branches(txn)?
        .into_iter()
        .filter(|b| b.provenance.contains(changed))
        .collect();
    // A branch's transitive provenance contains all of its upstreams, so
    // closure size orders the walk topologically.
    affected.sort_by_key(|b| b.provenance.len());
    for info in affected {
        align_branch(txn, &info.branch, now)?;
    }
    Ok(())
}

/// Ensures a newly created or re-pointed branch itself carries an alias
/// commit for the current upstream heads.
pub(crate) fn align_new_branch(
    txn: &mut MetaTxn<'_>,
    branch: &Branch,
    now: SystemTime,
) -> Result<()> {
    align_branch(txn, branch, now)?;
    Ok(())
}

/// Expands the subvenance ranges of `info` into the concrete list of
/// downstream commits, walking child links from each range's lower bound
/// to its upper bound.
pub(crate) fn expand_subvenance(
    txn: &mut MetaTxn<'_>,
    info: &CommitInfo,
) -> Result<Vec<Commit>> {
    let mut out = Vec::new();
    for range in &info.subvenance {
        let lower = get_commit(txn, &range.lower.repo, &range.lower.id)?;
        let branch = lower.branch.clone();
        let mut cur = lower;
        loop {
            out.push(cur.commit.clone());
            if cur.commit == range.upper {
                break;
            }
            let next = cur
                .children
                .iter()
                .find_map(|child| {
                    get_commit(txn, &child.repo, &child.id)
                        .ok()
                        .filter(|c| c.branch == branch)
                })
                .ok_or_else(|| {
                    Error::Corrupt(format!(
                        "broken subvenance range {}..{}",
                        range.lower, range.upper
                    ))
                })?;
            cur = next;
        }
    }
    Ok(out)
}

/// Applies the ready-counter cascade and success/failure bookkeeping for
/// a commit that just finished.
pub(crate) fn cascade_finish(
    txn: &mut MetaTxn<'_>,
    finished: &CommitInfo,
    empty: bool,
) -> Result<()> {
    for commit in expand_subvenance(txn, finished)? {
        let mut downstream = get_commit(txn, &commit.repo, &commit.id)?;
        // Monotonic and bounded by the provenance list length.
        if downstream.ready_provenance < downstream.provenance.len() as u64 {
            downstream.ready_provenance += 1;
        }
        put_commit(txn, downstream);
    }
    for edge in &finished.provenance {
        let mut upstream = get_commit(txn, &edge.commit.repo, &edge.commit.id)?;
        if empty {
            upstream.subvenant_failure += 1;
        } else {
            upstream.subvenant_success += 1;
        }
        put_commit(txn, upstream);
    }
    Ok(())
}

/// Evaluates size / commit-count triggers targeting the branch a commit
/// just finished on. Returns the branches whose heads moved.
pub(crate) fn evaluate_triggers(
    txn: &mut MetaTxn<'_>,
    finished: &CommitInfo,
) -> Result<Vec<Branch>> {
    let mut moved = Vec::new();
    for mut info in all_branches(txn)? {
        if info.branch.repo != finished.commit.repo {
            continue;
        }
        let Some(trigger) = info.trigger.clone() else {
            continue;
        };
        if trigger.branch != finished.branch.name {
            continue;
        }
        let mut size = 0u64;
        let mut count = 0u64;
        let head_id = info.head.as_ref().map(|c| c.id.clone());
        let mut cur = Some(finished.clone());
        while let Some(commit) = cur {
            if Some(&commit.commit.id) == head_id.as_ref() {
                break;
            }
            // A branch's initial empty commit does not count toward
            // trigger thresholds.
            if !(commit.parent.is_none() && commit.size_bytes == 0) {
                size += commit.size_bytes;
                count += 1;
            }
            cur = match &commit.parent {
                Some(parent) => Some(get_commit(txn, &parent.repo, &parent.id)?),
                None => None,
            };
        }
        let mut conditions = Vec::new();
        if trigger.size_bytes > 0 {
            conditions.push(size >= trigger.size_bytes);
        }
        if trigger.commits > 0 {
            conditions.push(count >= trigger.commits);
        }
        if conditions.is_empty() {
            continue;
        }
        let fire = if trigger.all {
            conditions.iter().all(|c| *c)
        } else {
            conditions.iter().any(|c| *c)
        };
        if fire {
            info.head = Some(finished.commit.clone());
            moved.push(info.branch.clone());
            put_branch(txn, info);
        }
    }
    Ok(moved)
}
