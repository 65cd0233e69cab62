//! Membership as seen through separate connections to one database.

use std::time::Duration;

use kiln_cluster::{
    ClusterConfig, ClusterError, DelegateRegistry, MembershipRegistry, Msid, NodeState,
};

use crate::helpers::TestCluster;

fn window(config: &ClusterConfig) -> i64 {
    config.liveness_window().as_millis() as i64
}

#[tokio::test]
async fn started_node_is_visible_to_other_processes() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();
    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    let startup = a.coordinator.start().await.unwrap();

    let store = cluster.open();
    let observer = MembershipRegistry::new(store.clone());
    let active = observer
        .active_nodes(store.now_ms() - window(&config))
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].msid, Msid(100));
    assert_eq!(active[0].runid, startup.record.runid);
    assert_eq!(active[0].service_address, "10.0.0.1:8250");
    assert_eq!(active[0].state, NodeState::Up);
}

#[tokio::test]
async fn silent_node_drops_out_of_active_set() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();
    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    let b = cluster.node(200, config.clone(), DelegateRegistry::new());
    a.coordinator.start().await.unwrap();
    b.coordinator.start().await.unwrap();

    // only node 100 keeps heartbeating
    for _ in 0..4 {
        cluster.advance(config.heartbeat_interval());
        a.coordinator.tick().await.unwrap();
    }

    let store = cluster.open();
    let cutoff = store.now_ms() - window(&config);
    let registry = MembershipRegistry::new(store);
    let active: Vec<_> = registry
        .active_nodes(cutoff)
        .unwrap()
        .into_iter()
        .map(|n| n.msid)
        .collect();
    let inactive: Vec<_> = registry
        .inactive_nodes(cutoff)
        .unwrap()
        .into_iter()
        .map(|n| n.msid)
        .collect();
    assert_eq!(active, vec![Msid(100)]);
    assert_eq!(inactive, vec![Msid(200)]);
}

#[tokio::test]
async fn old_generation_is_superseded() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();
    let old = cluster.node(100, config.clone(), DelegateRegistry::new());
    old.coordinator.start().await.unwrap();

    cluster.advance(Duration::from_millis(1));
    let new = cluster.node(100, config.clone(), DelegateRegistry::new());
    let startup = new.coordinator.start().await.unwrap();
    assert!(startup.record.runid > old.coordinator.identity().runid);

    let err = old.coordinator.tick().await.unwrap_err();
    assert!(matches!(err, ClusterError::Superseded { current, .. } if current == startup.record.runid));

    // the stale heartbeat did not touch the new generation's row
    let record = new
        .coordinator
        .membership()
        .find_by_msid(Msid(100))
        .unwrap()
        .unwrap();
    assert_eq!(record.runid, startup.record.runid);
}

#[tokio::test]
async fn superseded_loop_exits_on_its_own() {
    let cluster = TestCluster::new();
    let config = ClusterConfig {
        heartbeat_interval_ms: 10,
        ..ClusterConfig::default()
    };
    let old = cluster.node(100, config.clone(), DelegateRegistry::new());
    old.coordinator.start().await.unwrap();

    cluster.advance(Duration::from_millis(1));
    let new = cluster.node(100, config, DelegateRegistry::new());
    new.coordinator.start().await.unwrap();

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = old.coordinator.spawn(shutdown_rx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn departed_node_can_rejoin() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();
    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    let b = cluster.node(200, config.clone(), DelegateRegistry::new());
    a.coordinator.start().await.unwrap();
    b.coordinator.start().await.unwrap();

    assert!(b.coordinator.leave().await.unwrap());
    cluster.advance(Duration::from_secs(30));
    let report = a.coordinator.tick().await.unwrap();
    assert!(report.suspected.is_empty());
    assert_eq!(report.active, 1);

    let b = cluster.node(200, config.clone(), DelegateRegistry::new());
    let startup = b.coordinator.start().await.unwrap();
    assert!(startup.record.is_member());

    let report = a.coordinator.tick().await.unwrap();
    assert_eq!(report.active, 2);
}
