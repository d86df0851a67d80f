//! TTL leases, background renewal, and the GC master.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use strata::fileset::{default_tag, Renewer, Storage, MIN_TTL};
use strata::repo::{Branch, Commit, InProcessLock, Master, Repository};

#[tokio::test]
async fn sweep_drops_lapsed_handles_but_keeps_commit_data() -> Result<()> {
    let repo = Repository::new();
    repo.create_repo("data", "").await?;
    repo.create_branch(&Branch::new("data", "main"), None, &[], None)
        .await?;
    let commit = repo
        .put_file(&Commit::new("data", "main"), "/kept", "k")
        .await?;

    let handle = repo.create_fileset(|w| {
        w.append("/tmp", None, Bytes::from_static(b"t"))?;
        Ok(())
    })?;
    repo.renew_fileset(&handle.to_hex(), MIN_TTL)?;

    let master = Master::new(repo.clone(), InProcessLock::new(), Duration::from_secs(3600));

    // Inside the lease nothing happens to the handle.
    master.sweep();
    assert!(repo.storage().contains(&handle));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let stats = master.sweep();
    assert!(stats.filesets_deleted >= 1);
    assert!(!repo.storage().contains(&handle));

    // Data bound to a finished commit is a GC root.
    assert_eq!(&repo.get_file(&commit, "/kept")?[..], b"k");
    Ok(())
}

#[tokio::test]
async fn background_renewal_outlives_the_base_ttl() -> Result<()> {
    let storage = Storage::new();
    let renewer = Renewer::new(storage.clone(), MIN_TTL);
    let mut writer = storage.unordered_writer(MIN_TTL, default_tag(), Some(renewer.clone()));
    writer.append("/lease", None, Bytes::from_static(b"l"))?;
    let id = writer.close()?;

    // Well past the base TTL, the half-TTL renewal cadence has kept it.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    storage.gc(&Default::default());
    assert!(storage.contains(&id));

    renewer.remove(&id);
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let stats = storage.gc(&Default::default());
    assert_eq!(stats.filesets_deleted, 1);
    assert!(!storage.contains(&id));
    Ok(())
}

#[tokio::test]
async fn renew_validates_bounds_before_touching_anything() -> Result<()> {
    let repo = Repository::new();
    let handle = repo.create_fileset(|w| {
        w.append("/x", None, Bytes::from_static(b"x"))?;
        Ok(())
    })?;
    let token = handle.to_hex();

    assert!(repo.renew_fileset(&token, Duration::from_millis(500)).is_err());
    assert!(repo
        .renew_fileset(&token, Duration::from_secs(60 * 60))
        .is_err());
    assert!(repo.renew_fileset("not-hex-at-all", MIN_TTL).is_err());
    assert_eq!(repo.renew_fileset(&token, MIN_TTL)?, handle);
    Ok(())
}
