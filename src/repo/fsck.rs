//! Consistency checking and repair for the metadata graph.
//!
//! Fsck verifies the cross-record invariants no single operation can
//! see: branch heads that point at missing commits, finished commits
//! with no fileset binding, parent links to deleted commits, and
//! readiness counters that drifted from the provenance edges they
//! summarize. In fix mode the repairable issues are patched in the same
//! transaction that found them; repair commits carry origin
//! [`CommitOrigin::Fsck`].

use std::fmt;
use std::time::SystemTime;

use tracing::warn;

use crate::fileset::DEFAULT_TTL;
use crate::id::CommitId;

use super::{
    commitstore, graph, Branch, Commit, CommitInfo, CommitOrigin, Key, Repository, Result,
};

/// One detected inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsckIssue {
    /// A branch head names a commit that does not exist.
    DanglingHead { branch: Branch, head: Commit },
    /// A finished commit has no fileset binding.
    MissingBinding { commit: Commit },
    /// A commit's parent link names a commit that does not exist.
    MissingParent { commit: Commit, parent: Commit },
    /// `ready_provenance` disagrees with the provenance edges.
    BadReadyCount {
        commit: Commit,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsckIssue::DanglingHead { branch, head } => {
                write!(f, "branch {branch} heads missing commit {head}")
            }
            FsckIssue::MissingBinding { commit } => {
                write!(f, "finished commit {commit} has no fileset binding")
            }
            FsckIssue::MissingParent { commit, parent } => {
                write!(f, "commit {commit} has missing parent {parent}")
            }
            FsckIssue::BadReadyCount {
                commit,
                expected,
                actual,
            } => write!(
                f,
                "commit {commit} ready count is {actual}, expected {expected}"
            ),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FsckReport {
    pub issues: Vec<FsckIssue>,
    pub fixed: usize,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Repository {
    /// Scans the whole metadata graph for inconsistencies. With `fix`,
    /// repairable issues are patched atomically with the scan: dangling
    /// heads get a fresh empty repair commit, missing bindings an empty
    /// fileset, and drifted ready counters are recomputed. Missing
    /// parents are reported only.
    pub async fn fsck(&self, fix: bool) -> Result<FsckReport> {
        let storage = self.storage().clone();
        let now = SystemTime::now();
        let (report, bindings) = self
            .meta()
            .in_txn(|txn| {
                let mut report = FsckReport::default();
                let mut bindings = Vec::new();

                for mut branch in graph::all_branches(txn)? {
                    let Some(head) = branch.head.clone() else {
                        continue;
                    };
                    if txn
                        .get(&Key::Commit(head.repo.clone(), head.id.clone()))
                        .is_some()
                    {
                        continue;
                    }
                    report.issues.push(FsckIssue::DanglingHead {
                        branch: branch.branch.clone(),
                        head,
                    });
                    if fix {
                        let commit =
                            Commit::new(&branch.branch.repo, CommitId::random().to_hex());
                        let mut repair = CommitInfo::new(
                            commit.clone(),
                            branch.branch.clone(),
                            CommitOrigin::Fsck,
                            now,
                        );
                        repair.finished = Some(now);
                        let bound = storage.compact(&[], DEFAULT_TTL)?;
                        commitstore::bind(txn, &commit, bound);
                        bindings.push(bound);
                        graph::put_commit(txn, repair);
                        branch.head = Some(commit);
                        graph::put_branch(txn, branch);
                        report.fixed += 1;
                    }
                }

                let commits: Vec<CommitInfo> = txn
                    .select(|k| matches!(k, Key::Commit(_, _)))
                    .into_iter()
                    .filter_map(|(_, record)| match record {
                        super::Record::Commit(info) => Some(info),
                        _ => None,
                    })
                    .collect();

                for info in &commits {
                    if info.finished.is_some()
                        && commitstore::binding(txn, &info.commit)?.is_none()
                    {
                        report.issues.push(FsckIssue::MissingBinding {
                            commit: info.commit.clone(),
                        });
                        if fix {
                            let bound = storage.compact(&[], DEFAULT_TTL)?;
                            commitstore::bind(txn, &info.commit, bound);
                            bindings.push(bound);
                            report.fixed += 1;
                        }
                    }

                    if let Some(parent) = &info.parent {
                        if txn
                            .get(&Key::Commit(parent.repo.clone(), parent.id.clone()))
                            .is_none()
                        {
                            report.issues.push(FsckIssue::MissingParent {
                                commit: info.commit.clone(),
                                parent: parent.clone(),
                            });
                        }
                    }

                    let expected = info
                        .provenance
                        .iter()
                        .filter(|edge| {
                            matches!(
                                txn.get(&Key::Commit(
                                    edge.commit.repo.clone(),
                                    edge.commit.id.clone()
                                )),
                                Some(super::Record::Commit(c)) if c.finished.is_some()
                            )
                        })
                        .count() as u64;
                    if expected != info.ready_provenance {
                        report.issues.push(FsckIssue::BadReadyCount {
                            commit: info.commit.clone(),
                            expected,
                            actual: info.ready_provenance,
                        });
                        if fix {
                            let mut patched = info.clone();
                            patched.ready_provenance = expected;
                            graph::put_commit(txn, patched);
                            report.fixed += 1;
                        }
                    }
                }

                Ok((report, bindings))
            })
            .await?;
        for id in bindings {
            self.storage().pin(&id)?;
        }
        for issue in &report.issues {
            warn!(%issue, "fsck found inconsistency");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Record;

    async fn seeded() -> Repository {
        let repo = Repository::new();
        repo.create_repo("data", "").await.unwrap();
        repo.create_branch(&Branch::new("data", "main"), None, &[], None)
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn clean_graph_reports_nothing() {
        let repo = seeded().await;
        let commit = repo
            .put_file(&Commit::new("data", "main"), "/f", "x")
            .await
            .unwrap();
        let report = repo.fsck(false).await.unwrap();
        assert!(report.is_clean(), "unexpected issues: {:?}", report.issues);
        assert_eq!(&repo.get_file(&commit, "/f").unwrap()[..], b"x");
    }

    #[tokio::test]
    async fn dangling_head_is_detected_and_repaired() {
        let repo = seeded().await;
        // Corrupt the store directly: point the head at a commit that
        // was never written.
        let phantom = Commit::new("data", CommitId::random().to_hex());
        repo.meta()
            .in_txn(|txn| {
                let mut info = graph::get_branch(txn, &Branch::new("data", "main"))?;
                info.head = Some(phantom.clone());
                graph::put_branch(txn, info);
                Ok::<_, crate::repo::Error>(())
            })
            .await
            .unwrap();

        let report = repo.fsck(false).await.unwrap();
        assert_eq!(report.fixed, 0);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, FsckIssue::DanglingHead { .. })));

        let report = repo.fsck(true).await.unwrap();
        assert!(report.fixed >= 1);
        let head = repo
            .inspect_commit(&Commit::new("data", "main"), None)
            .await
            .unwrap();
        assert_eq!(head.origin, CommitOrigin::Fsck);
        assert!(repo.fsck(false).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn drifted_ready_counter_is_recomputed() {
        let repo = seeded().await;
        let commit = repo
            .put_file(&Commit::new("data", "main"), "/f", "x")
            .await
            .unwrap();
        repo.meta()
            .in_txn(|txn| {
                let mut info = graph::get_commit(txn, &commit.repo, &commit.id)?;
                info.ready_provenance = 7;
                graph::put_commit(txn, info);
                Ok::<_, crate::repo::Error>(())
            })
            .await
            .unwrap();

        let report = repo.fsck(true).await.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, FsckIssue::BadReadyCount { actual: 7, .. })));
        assert!(report.fixed >= 1);
        match repo.meta().get(&Key::Commit(commit.repo.clone(), commit.id.clone())) {
            Some(Record::Commit(info)) => assert_eq!(info.ready_provenance, 0),
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
