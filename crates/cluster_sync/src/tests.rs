use std::time::Duration;

use common::{
    types::{
        DeviceId,
        RepositoryFamily,
        WorkingCopyVersion,
    },
    version_store::{
        write_lock_name,
        VersionStore,
    },
};
use errors::ErrorMetadataAnyhowExt;
use pretty_assertions::assert_eq;

use crate::{
    operator,
    testing::SyncFixture,
};

fn device(name: &str) -> DeviceId {
    DeviceId::from(name)
}

#[tokio::test(start_paused = true)]
async fn test_two_node_promotion() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(7));
    fixture
        .store
        .insert_row(repository, device("repo002"), WorkingCopyVersion::at(5));

    let engine = fixture.engine("repo002");
    assert_eq!(engine.before_read().await?, Some(7));

    // repo002 pulled from the leader and recorded the leader's version.
    assert_eq!(
        fixture
            .fetcher
            .attempted_sources()
            .iter()
            .map(|source| source.as_str())
            .collect::<Vec<_>>(),
        vec!["ssh://repo001/source/widgets.git"],
    );
    assert_eq!(
        fixture.store.row(repository, &device("repo002")),
        Some(WorkingCopyVersion::at(7)),
    );
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(7)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_read_at_leader_version_skips_fetch() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(7));

    let engine = fixture.engine("repo001");
    assert_eq!(engine.before_read().await?, Some(7));
    assert_eq!(fixture.fetcher.fetch_count(), 0);

    // Repeated reads with no intervening writes change nothing.
    assert_eq!(engine.before_read().await?, Some(7));
    assert_eq!(fixture.fetcher.fetch_count(), 0);
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(7)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sole_device_bootstrap() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);

    let engine = fixture.engine("repo001");
    assert_eq!(engine.before_read().await?, Some(0));
    assert_eq!(
        fixture.store.row(fixture.repository.id, &device("repo001")),
        Some(WorkingCopyVersion::at(0)),
    );
    assert_eq!(fixture.fetcher.fetch_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_bootstrap_refused() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);

    let engine = fixture.engine("repo001");
    let err = engine.before_read().await.unwrap_err();
    assert!(err.is_config_error());
    assert!(err.msg().contains("more than one device"));
    // Nothing was persisted; the next read still refuses.
    assert_eq!(fixture.store.row(fixture.repository.id, &device("repo001")), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_on_unbound_device_refused() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo002"]);

    let engine = fixture.engine("repo001");
    let err = engine.before_read().await.unwrap_err();
    assert!(err.is_config_error());
    assert_eq!(err.short_msg(), "DeviceNotBound");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_leader_lost() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    // The leader is only reachable over http, which cannot serve fetches.
    fixture.bind(vec![
        SyncFixture::ssh_binding("repo001"),
        SyncFixture::http_binding("repo002"),
    ]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(5));
    fixture
        .store
        .insert_row(repository, device("repo002"), WorkingCopyVersion::at(12));

    let engine = fixture.engine("repo001");
    let err = engine.before_read().await.unwrap_err();
    assert!(err.is_leader_lost());
    assert_eq!(fixture.fetcher.fetch_count(), 0);
    // This device's row is untouched; it never reached version 12.
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(5)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fetch_fails_over_across_leaders() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002", "repo003"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(9));
    fixture
        .store
        .insert_row(repository, device("repo002"), WorkingCopyVersion::at(9));
    fixture
        .store
        .insert_row(repository, device("repo003"), WorkingCopyVersion::at(2));
    fixture.fetcher.fail_host("repo001");

    let engine = fixture.engine("repo003");
    assert_eq!(engine.before_read().await?, Some(9));
    // First leader refused, second served the pull.
    assert_eq!(fixture.fetcher.fetch_count(), 2);
    assert_eq!(
        fixture.store.row(repository, &device("repo003")),
        Some(WorkingCopyVersion::at(9)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_working_copy_is_actionable() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(3));
    fixture
        .store
        .insert_row(repository, device("repo002"), WorkingCopyVersion::at(1));

    let mut repo = fixture.repository.clone();
    repo.working_copy = repo.working_copy.join("missing");
    let engine = fixture.engine_for(repo, Some(device("repo002")));
    let err = engine.before_read().await.unwrap_err();
    assert!(err.is_not_initialized());
    assert!(err.msg().contains("materialize"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_after_creation_seeds_all_bindings() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;

    let engine = fixture.engine("repo001");
    engine.after_creation().await?;
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(0)),
    );
    assert_eq!(
        fixture.store.row(repository, &device("repo002")),
        Some(WorkingCopyVersion::at(0)),
    );

    // With rows seeded, a two-device cluster no longer has an ambiguous
    // bootstrap.
    assert_eq!(engine.before_read().await?, Some(0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_after_creation_with_unresolved_service() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    // Nothing registered for the fixture's cluster service id.
    let engine = fixture.engine("repo001");
    let err = engine.after_creation().await.unwrap_err();
    assert!(err.is_config_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_write_round_trip() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;

    let mut engine = fixture.engine("repo001");
    engine.after_creation().await?;
    engine.before_write(Some("alice")).await?;

    // The durable marker is in place while the write runs.
    let row = fixture.store.row(repository, &device("repo001")).unwrap();
    assert!(row.is_writing);
    let properties = row.write_properties.unwrap();
    assert_eq!(properties.user_id.as_deref(), Some("alice"));
    assert_eq!(properties.device_id, device("repo001"));
    assert!(row.write_owner.is_some());

    let event_id = fixture.push_log.record_push(repository);
    engine.after_write().await?;

    // Marker cleared, version minted from the push event, lock released.
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(event_id)),
    );
    assert!(!fixture.store.lock_held(&write_lock_name(repository)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_write_version_stays_put_without_push_events() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(5));

    let mut engine = fixture.engine("repo001");
    engine.before_write(None).await?;
    engine.after_write().await?;
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(5)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_write_freezes_repository() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;

    let mut engine_a = fixture.engine("repo001");
    engine_a.after_creation().await?;
    engine_a.before_write(Some("alice")).await?;
    // The writing process dies: its database session (and advisory lock) go
    // away, but the durable marker stays.
    drop(engine_a);
    assert!(!fixture.store.lock_held(&write_lock_name(repository)));
    assert!(fixture.store.row(repository, &device("repo001")).unwrap().is_writing);

    let mut engine_b = fixture.engine("repo002");
    let err = engine_b.before_write(None).await.unwrap_err();
    assert!(err.is_frozen());
    // Subsequent attempts stay frozen until the operator intervenes.
    let err = engine_b.before_write(None).await.unwrap_err();
    assert!(err.is_frozen());

    operator::clear_write_marker(fixture.store.as_ref(), repository, device("repo001")).await?;
    engine_b.before_write(None).await?;
    let event_id = fixture.push_log.record_push(repository);
    engine_b.after_write().await?;
    assert_eq!(
        fixture.store.row(repository, &device("repo002")),
        Some(WorkingCopyVersion::at(event_id)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_advisory_lock_durable_marker_survives() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;

    let mut engine = fixture.engine("repo001");
    engine.after_creation().await?;
    engine.before_write(Some("alice")).await?;
    let event_id = fixture.push_log.record_push(repository);

    // Database restart: the advisory lock evaporates and the next couple of
    // operations fail to connect, but the row marker survives.
    fixture.store.break_locks();
    fixture.store.fail_connections(2);

    engine.after_write().await?;
    assert_eq!(
        fixture.store.row(repository, &device("repo001")),
        Some(WorkingCopyVersion::at(event_id)),
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_release_budget_exhaustion_freezes() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;

    let mut engine = fixture.engine("repo001");
    engine.after_creation().await?;
    engine.before_write(None).await?;
    fixture.store.fail_connections(u32::MAX);

    let err = engine.after_write().await.unwrap_err();
    assert!(err.is_frozen());
    // The marker is still planted; any future writer sees the freeze.
    fixture.store.fail_connections(0);
    assert!(fixture.store.row(repository, &device("repo001")).unwrap().is_writing);
    let mut engine_b = fixture.engine("repo001");
    let err = engine_b.before_write(None).await.unwrap_err();
    assert!(err.is_frozen());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_after_write_without_before_write() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);

    let mut engine = fixture.engine("repo001");
    let err = engine.after_write().await.unwrap_err();
    assert!(err.is_programmer_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_double_before_write_is_rejected() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);

    let mut engine = fixture.engine("repo001");
    engine.after_creation().await?;
    engine.before_write(None).await?;
    let err = engine.before_write(None).await.unwrap_err();
    assert!(err.is_programmer_error());
    engine.after_write().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_contended_write_lock_times_out_transient() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);

    let mut engine_a = fixture.engine("repo001");
    engine_a.after_creation().await?;
    engine_a.before_write(None).await?;

    // The competing device never gets the lock and gives up after the wait
    // budget (virtual time fast-forwards through it).
    let mut engine_b = fixture.engine("repo002");
    let err = engine_b.before_write(None).await.unwrap_err();
    assert!(err.is_transient());

    engine_a.after_write().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_writes_serialize_across_engines() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002"]);
    let repository = fixture.repository.id;

    let mut engine_a = fixture.engine("repo001");
    engine_a.after_creation().await?;
    engine_a.before_write(Some("alice")).await?;

    let mut engine_b = fixture.engine("repo002");
    let waiter = tokio::spawn(async move {
        engine_b.before_write(Some("bob")).await?;
        engine_b.after_write().await?;
        anyhow::Ok(())
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // B is parked on the write lock while A holds it.
    assert!(!waiter.is_finished());

    let event_id = fixture.push_log.record_push(repository);
    engine_a.after_write().await?;
    waiter.await??;

    // B ran strictly after A: it pulled A's version before planting its own
    // marker, and both rows ended clean.
    assert_eq!(
        fixture.store.row(repository, &device("repo002")),
        Some(WorkingCopyVersion::at(event_id)),
    );
    assert_eq!(fixture.fetcher.fetch_count(), 1);
    assert!(!fixture.store.row(repository, &device("repo001")).unwrap().is_writing);
    assert!(!fixture.store.lock_held(&write_lock_name(repository)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disabled_repositories_are_noops() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);

    let mut observed = fixture.repository.clone();
    observed.hosted = false;
    let mut hg = fixture.repository.clone();
    hg.family = RepositoryFamily::Mercurial;
    let mut unclustered = fixture.repository.clone();
    unclustered.cluster_service = None;

    let disabled = [
        fixture.engine_for(observed, Some(device("repo001"))),
        fixture.engine_for(hg, Some(device("repo001"))),
        fixture.engine_for(unclustered, Some(device("repo001"))),
        fixture.engine_for(fixture.repository.clone(), None),
    ];
    for mut engine in disabled {
        assert!(!engine.is_enabled());
        // The predicate is stable across calls.
        assert!(!engine.is_enabled());
        engine.after_creation().await?;
        assert_eq!(engine.before_read().await?, None);
        engine.before_write(Some("alice")).await?;
        engine.after_write().await?;
    }

    // No rows were written and no fetches attempted by any of it.
    assert_eq!(
        fixture.store.row(fixture.repository.id, &device("repo001")),
        None,
    );
    assert_eq!(fixture.fetcher.fetch_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_read_lands_on_observed_max() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001", "repo002", "repo003"]);
    let repository = fixture.repository.id;
    for (name, version) in [("repo001", 4), ("repo002", 9), ("repo003", 9)] {
        fixture
            .store
            .insert_row(repository, device(name), WorkingCopyVersion::at(version));
    }
    let observed_max = 9;

    let engine = fixture.engine("repo001");
    assert_eq!(engine.before_read().await?, Some(observed_max));
    assert_eq!(
        fixture.store.row(repository, &device("repo001")).unwrap().version,
        observed_max,
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_operator_clear_requires_marker() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(5));

    let err = operator::clear_write_marker(fixture.store.as_ref(), repository, device("repo001"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no interrupted write"));
    assert!(
        operator::clear_write_marker(fixture.store.as_ref(), repository, device("repo002"))
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_read_lock_contention_times_out() -> anyhow::Result<()> {
    let fixture = SyncFixture::new();
    fixture.bind_ssh(&["repo001"]);
    let repository = fixture.repository.id;
    fixture
        .store
        .insert_row(repository, device("repo001"), WorkingCopyVersion::at(1));

    // Another process on this device holds the read lock and never lets go.
    let _held = fixture
        .store
        .read_lock(repository, device("repo001"), Duration::from_secs(1))
        .await?;

    let engine = fixture.engine("repo001");
    let err = engine.before_read().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.short_msg(), "ReadLockTimeout");
    Ok(())
}
