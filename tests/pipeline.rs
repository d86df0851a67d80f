//! Cross-repo provenance: propagation, readiness, flushing, triggers.

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use strata::repo::{Branch, Commit, CommitOrigin, CommitState, Repository, Trigger};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn cross_repo_pipeline_propagates_and_flushes() -> Result<()> {
    trace_init();
    let repo = Repository::new();
    repo.create_repo("images", "raw inputs").await?;
    repo.create_repo("edges", "derived").await?;
    let master = Branch::new("images", "master");
    repo.create_branch(&master, None, &[], None).await?;
    let out = Branch::new("edges", "out");
    repo.create_branch(&out, None, &[master.clone()], None)
        .await?;

    let input = repo.start_commit(&master, &[]).await?;
    repo.put_file(&input, "/cat.png", "pixels").await?;
    repo.finish_commit(&input, "add cat", false).await?;

    // Propagation minted an alias on edges@out tied to the new input.
    let alias = repo
        .inspect_commit(&Commit::new("edges", "out"), None)
        .await?;
    assert_eq!(alias.origin, CommitOrigin::Auto);
    assert_eq!(alias.provenance.len(), 1);
    assert_eq!(alias.provenance[0].commit, input);
    assert_eq!(alias.state(), CommitState::Ready);

    // The worker writes its output into the alias and finishes it a
    // little later; flush blocks until then.
    repo.put_file(&alias.commit, "/cat.edges", "edges").await?;
    let worker = {
        let repo = repo.clone();
        let commit = alias.commit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            repo.finish_commit(&commit, "edges done", false).await
        })
    };

    let flush = repo.flush_commit(vec![input.clone()], vec![]);
    futures::pin_mut!(flush);
    let flushed = flush.next().await.expect("one downstream commit")?;
    assert_eq!(flushed.commit, alias.commit);
    assert_eq!(flushed.state(), CommitState::Finished);
    assert!(flush.next().await.is_none());
    worker.await??;

    let input_info = repo.inspect_commit(&input, None).await?;
    assert_eq!(input_info.subvenant_total, 1);
    assert_eq!(input_info.subvenant_success, 1);
    assert_eq!(input_info.subvenant_failure, 0);

    assert_eq!(&repo.get_file(&alias.commit, "/cat.edges")?[..], b"edges");
    Ok(())
}

#[tokio::test]
async fn diamond_provenance_counts_ready_edges() -> Result<()> {
    trace_init();
    let repo = Repository::new();
    for name in ["a", "b", "c"] {
        repo.create_repo(name, "").await?;
    }
    let a = Branch::new("a", "master");
    let b = Branch::new("b", "master");
    repo.create_branch(&a, None, &[], None).await?;
    repo.create_branch(&b, None, &[], None).await?;
    let c = Branch::new("c", "out");
    repo.create_branch(&c, None, &[a.clone(), b.clone()], None)
        .await?;

    let on_a = repo.start_commit(&a, &[]).await?;
    let alias = repo.inspect_commit(&Commit::new("c", "out"), None).await?;
    assert_eq!(alias.provenance.len(), 2);
    // b's head is already finished, a's new commit is not.
    assert_eq!(alias.ready_provenance, 1);
    assert_eq!(alias.state(), CommitState::Started);

    repo.finish_commit(&on_a, "", false).await?;
    let alias = repo.inspect_commit(&alias.commit, None).await?;
    assert_eq!(alias.ready_provenance, 2);
    assert_eq!(alias.state(), CommitState::Ready);
    Ok(())
}

#[tokio::test]
async fn commit_count_trigger_moves_head() -> Result<()> {
    trace_init();
    let repo = Repository::new();
    repo.create_repo("data", "").await?;
    let staging = Branch::new("data", "staging");
    repo.create_branch(&staging, None, &[], None).await?;
    let prod = Branch::new("data", "prod");
    repo.create_branch(
        &prod,
        None,
        &[],
        Some(Trigger {
            branch: "staging".to_string(),
            cron_spec: String::new(),
            size_bytes: 0,
            commits: 2,
            all: false,
        }),
    )
    .await?;

    let head = Commit::new("data", "staging");
    let first = repo.put_file(&head, "/one", "1").await?;
    let prod_head = repo.inspect_branch(&prod)?.head.expect("seeded head");
    assert_ne!(prod_head, first, "one commit must not fire a two-commit trigger");

    let second = repo.put_file(&head, "/two", "2").await?;
    let prod_head = repo.inspect_branch(&prod)?.head.expect("seeded head");
    assert_eq!(prod_head, second);

    // The fire point resets the accumulator.
    let third = repo.put_file(&head, "/three", "3").await?;
    let prod_head = repo.inspect_branch(&prod)?.head.expect("seeded head");
    assert_ne!(prod_head, third);
    Ok(())
}

#[tokio::test]
async fn size_trigger_fires_on_accumulated_bytes() -> Result<()> {
    trace_init();
    let repo = Repository::new();
    repo.create_repo("data", "").await?;
    let staging = Branch::new("data", "staging");
    repo.create_branch(&staging, None, &[], None).await?;
    let prod = Branch::new("data", "prod");
    repo.create_branch(
        &prod,
        None,
        &[],
        Some(Trigger {
            branch: "staging".to_string(),
            cron_spec: String::new(),
            size_bytes: 8,
            commits: 0,
            all: false,
        }),
    )
    .await?;

    let head = Commit::new("data", "staging");
    repo.put_file(&head, "/small", "1234").await?;
    let before = repo.inspect_branch(&prod)?.head.expect("seeded head");
    let big = repo.put_file(&head, "/more", "56789abc").await?;
    let after = repo.inspect_branch(&prod)?.head.expect("seeded head");
    assert_ne!(before, after);
    assert_eq!(after, big);
    Ok(())
}
