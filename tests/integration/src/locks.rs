//! Named cluster locks between nodes holding separate store connections.

use std::sync::Arc;
use std::time::Duration;

use kiln_cluster::{ClusterConfig, ClusterError, DelegateRegistry, Msid};
use kiln_store::StoreError;

use crate::helpers::TestCluster;

#[tokio::test]
async fn init_artifact_is_mutually_exclusive() {
    let cluster = TestCluster::new();
    let a = cluster.node(100, ClusterConfig::default(), DelegateRegistry::new());
    let b = cluster.node(200, ClusterConfig::default(), DelegateRegistry::new());

    let held = a
        .coordinator
        .locks()
        .acquire("init-artifact", Duration::from_secs(5))
        .await
        .unwrap();

    let err = b
        .coordinator
        .locks()
        .acquire("init-artifact", Duration::from_secs(1))
        .await
        .unwrap_err();
    match err {
        ClusterError::LockTimeout { name, waited_ms } => {
            assert_eq!(name, "init-artifact");
            assert!(waited_ms >= 1_000);
        }
        other => panic!("expected lock timeout, got {other}"),
    }

    assert!(a.coordinator.locks().release(&held).unwrap());
    let next = b
        .coordinator
        .locks()
        .acquire("init-artifact", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(next.owner(), Msid(200));
    assert!(next.token() > held.token());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_proceeds_once_holder_releases() {
    let cluster = TestCluster::new();
    let a = cluster.node(100, ClusterConfig::default(), DelegateRegistry::new());
    let b = cluster.node(200, ClusterConfig::default(), DelegateRegistry::new());

    let held = a
        .coordinator
        .locks()
        .acquire("prepare-template", Duration::from_secs(1))
        .await
        .unwrap();

    let waiter = Arc::clone(b.coordinator.locks());
    let task = tokio::spawn(async move {
        waiter
            .acquire("prepare-template", Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    a.coordinator.locks().release(&held).unwrap();

    let handle = task.await.unwrap().unwrap();
    assert_eq!(handle.owner(), Msid(200));
    assert_eq!(
        b.coordinator.locks().holder("prepare-template").unwrap(),
        Some((Msid(200), handle.token()))
    );
}

#[tokio::test]
async fn crashed_holders_lease_runs_out() {
    let cluster = TestCluster::new();
    let config = ClusterConfig {
        lock_lease_ttl_ms: 30_000,
        ..ClusterConfig::default()
    };
    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    let b = cluster.node(200, config, DelegateRegistry::new());

    let stale = a
        .coordinator
        .locks()
        .acquire("snapshot-volume-9", Duration::from_secs(1))
        .await
        .unwrap();

    // the holder stops renewing; its lease lapses on the store clock
    cluster.advance(Duration::from_secs(31));
    let fresh = b
        .coordinator
        .locks()
        .acquire("snapshot-volume-9", Duration::from_millis(100))
        .await
        .unwrap();
    assert!(fresh.token() > stale.token());

    // the stale holder's release does not free the new lease
    assert!(!a.coordinator.locks().release(&stale).unwrap());
    assert_eq!(
        b.coordinator.locks().holder("snapshot-volume-9").unwrap(),
        Some((Msid(200), fresh.token()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_in_one_process_share_the_lock() {
    let cluster = TestCluster::new();
    let a = cluster.node(100, ClusterConfig::default(), DelegateRegistry::new());
    let b = cluster.node(200, ClusterConfig::default(), DelegateRegistry::new());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let locks = Arc::clone(a.coordinator.locks());
        tasks.push(tokio::spawn(async move {
            locks.acquire("seed-router", Duration::from_secs(5)).await
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }
    assert!(handles.iter().all(|h| h.token() == handles[0].token()));
    assert_eq!(a.coordinator.locks().local_refs("seed-router"), 4);

    let locks = a.coordinator.locks();
    for handle in &handles[..3] {
        assert!(!locks.release_local_ref(handle).unwrap());
    }
    assert!(b
        .coordinator
        .locks()
        .acquire("seed-router", Duration::ZERO)
        .await
        .is_err());

    assert!(locks.release_local_ref(&handles[3]).unwrap());
    assert!(b
        .coordinator
        .locks()
        .acquire("seed-router", Duration::ZERO)
        .await
        .is_ok());
}

#[tokio::test]
async fn abandoned_wait_leaves_nothing_behind() {
    let cluster = TestCluster::new();
    let a = cluster.node(100, ClusterConfig::default(), DelegateRegistry::new());
    let b = cluster.node(200, ClusterConfig::default(), DelegateRegistry::new());

    let held = a
        .coordinator
        .locks()
        .acquire("migrate-vm-12", Duration::from_secs(1))
        .await
        .unwrap();

    let gave_up = tokio::time::timeout(
        Duration::from_millis(150),
        b.coordinator
            .locks()
            .acquire("migrate-vm-12", Duration::from_secs(30)),
    )
    .await;
    assert!(gave_up.is_err());

    a.coordinator.locks().release(&held).unwrap();
    assert_eq!(a.coordinator.locks().holder("migrate-vm-12").unwrap(), None);
    assert_eq!(b.coordinator.locks().local_refs("migrate-vm-12"), 0);
}

#[tokio::test]
async fn writer_in_another_process_does_not_stretch_the_timeout() {
    let cluster = TestCluster::new();
    let a = cluster.node(100, ClusterConfig::default(), DelegateRegistry::new());

    // another process sits on the database write lock
    let other = cluster.open();
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let writer = std::thread::spawn(move || {
        other.transaction::<_, StoreError>(|_| {
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(1_500));
            Ok(())
        })
    });
    held_rx.recv().unwrap();

    let started = std::time::Instant::now();
    let err = a
        .coordinator
        .locks()
        .acquire("init-artifact", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::LockTimeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(500));

    writer.join().unwrap().unwrap();
    assert!(a
        .coordinator
        .locks()
        .acquire("init-artifact", Duration::from_millis(100))
        .await
        .is_ok());
}
