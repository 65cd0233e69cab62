//! A node dies with compensation frames outstanding; survivors agree it
//! is dead, one takes its frames over and undoes its work.

use std::time::Duration;

use kiln_cluster::{
    ClusterConfig, ClusterEvent, ContextId, DelegateRegistry, Msid, NodeIdentity, NodeState,
    PeerState, QuorumPolicy, RunId,
};

use crate::helpers::{Recorder, TestCluster, VolumeArgs, VERSION};

const CLEANUP: &[&str] = &["unmount", "deleteLease"];

fn strict_config() -> ClusterConfig {
    ClusterConfig::from_toml_str(
        r#"
        alerts_before_down = 1
        quorum = { fixed = 3 }
        "#,
    )
    .unwrap()
}

/// Starts node 100 (runid 1), has it record two cleanup steps on context
/// 7, then lets it die and the liveness window pass.
async fn crash_node_with_frames(cluster: &TestCluster, config: &ClusterConfig) {
    let identity = NodeIdentity::new(Msid(100), RunId(1), "mgmt-a", VERSION, "10.0.0.1:8250");
    let a = cluster.node_as(identity, config.clone(), DelegateRegistry::new());
    a.coordinator.start().await.unwrap();

    let scope = a.coordinator.scope(ContextId(7)).unwrap();
    scope.push("unmount", 1, &VolumeArgs::new("vol-1")).unwrap();
    scope.push("deleteLease", 1, &VolumeArgs::new("vol-1")).unwrap();
    drop(a);

    cluster.advance(Duration::from_secs(5));
}

#[tokio::test]
async fn survivor_replays_dead_nodes_frames_newest_first() {
    let cluster = TestCluster::new();
    let config = strict_config();
    crash_node_with_frames(&cluster, &config).await;

    let recorder = Recorder::default();
    let mut b = cluster.node(200, config.clone(), recorder.registry(CLEANUP));
    let c = cluster.node(300, config.clone(), recorder.registry(CLEANUP));
    let d = cluster.node(400, config.clone(), recorder.registry(CLEANUP));
    for node in [&b, &c, &d] {
        node.coordinator.start().await.unwrap();
    }

    // two votes are not enough under a fixed quorum of three
    assert!(c.coordinator.tick().await.unwrap().declared_down.is_empty());
    assert!(d.coordinator.tick().await.unwrap().declared_down.is_empty());
    assert!(recorder.calls().is_empty());

    let report = b.coordinator.tick().await.unwrap();
    assert_eq!(report.active, 3);
    assert_eq!(report.declared_down, vec![Msid(100)]);
    assert_eq!(report.frames_taken_over, 2);
    assert_eq!(report.replay.replayed, 2);
    assert_eq!(recorder.calls(), vec!["deleteLease vol-1", "unmount vol-1"]);

    let ledger = b.coordinator.ledger();
    assert!(ledger.leftovers(Msid(100)).unwrap().is_empty());
    assert!(ledger.claimable(Msid(200)).unwrap().is_empty());

    let record = b
        .coordinator
        .membership()
        .find_by_msid(Msid(100))
        .unwrap()
        .unwrap();
    assert_eq!(record.state, NodeState::Down);

    let events = b.drain_events();
    assert!(events.contains(&ClusterEvent::NodeDeclaredDown {
        msid: Msid(100),
        runid: RunId(1),
        votes: 3,
        threshold: 3,
    }));
    assert!(events.contains(&ClusterEvent::FramesTakenOver {
        from: Msid(100),
        frames: 2,
    }));
}

#[tokio::test]
async fn only_one_survivor_takes_over() {
    let cluster = TestCluster::new();
    let config = ClusterConfig {
        quorum: QuorumPolicy::Fixed(2),
        alerts_before_down: 1,
        ..ClusterConfig::default()
    };
    crash_node_with_frames(&cluster, &config).await;

    let recorder = Recorder::default();
    let nodes: Vec<_> = [200, 300, 400]
        .into_iter()
        .map(|msid| cluster.node(msid, config.clone(), recorder.registry(CLEANUP)))
        .collect();
    for node in &nodes {
        node.coordinator.start().await.unwrap();
    }

    let mut taken = 0;
    let mut declared = 0;
    for node in &nodes {
        let report = node.coordinator.tick().await.unwrap();
        taken += report.frames_taken_over;
        declared += report.declared_down.len();
    }
    assert_eq!(taken, 2);
    assert_eq!(declared, 1);
    // each cleanup step ran exactly once
    assert_eq!(recorder.calls(), vec!["deleteLease vol-1", "unmount vol-1"]);
}

#[tokio::test]
async fn majority_quorum_converges_over_rounds() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();
    crash_node_with_frames(&cluster, &config).await;

    let recorder = Recorder::default();
    let b = cluster.node(200, config.clone(), recorder.registry(CLEANUP));
    let c = cluster.node(300, config.clone(), recorder.registry(CLEANUP));
    b.coordinator.start().await.unwrap();
    c.coordinator.start().await.unwrap();

    let mut declared = Vec::new();
    for _ in 0..3 {
        for node in [&b, &c] {
            let report = node.coordinator.tick().await.unwrap();
            declared.extend(report.declared_down);
        }
        cluster.advance(Duration::from_millis(1_500));
    }
    assert_eq!(declared, vec![Msid(100)]);
    assert_eq!(recorder.calls(), vec!["deleteLease vol-1", "unmount vol-1"]);
}

#[tokio::test]
async fn restarted_node_starts_with_clean_votes() {
    let cluster = TestCluster::new();
    let config = strict_config();
    crash_node_with_frames(&cluster, &config).await;

    let recorder = Recorder::default();
    let mut b = cluster.node(200, config.clone(), recorder.registry(CLEANUP));
    let c = cluster.node(300, config.clone(), recorder.registry(CLEANUP));
    let d = cluster.node(400, config.clone(), recorder.registry(CLEANUP));
    for node in [&b, &c, &d] {
        node.coordinator.start().await.unwrap();
    }
    for node in [&c, &d, &b] {
        node.coordinator.tick().await.unwrap();
    }
    b.drain_events();

    // node 100 comes back as a new generation
    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    let startup = a.coordinator.start().await.unwrap();
    assert!(startup.record.runid > RunId(1));
    assert_eq!(startup.record.state, NodeState::Up);
    assert_eq!(startup.forgotten_observations, 3);
    assert_eq!(startup.recovered_frames, 0);

    let report = b.coordinator.tick().await.unwrap();
    assert_eq!(report.active, 4);
    assert!(report.suspected.is_empty());
    assert!(b.drain_events().contains(&ClusterEvent::NodeRecovered {
        msid: Msid(100),
        runid: startup.record.runid,
    }));
    assert_eq!(
        b.coordinator
            .peers()
            .count_agreeing(Msid(100), startup.record.runid, PeerState::Down)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn quick_restart_replays_own_leftovers() {
    let cluster = TestCluster::new();
    let config = ClusterConfig::default();

    let a = cluster.node(100, config.clone(), DelegateRegistry::new());
    a.coordinator.start().await.unwrap();
    let scope = a.coordinator.scope(ContextId(3)).unwrap();
    scope.push("unmount", 1, &VolumeArgs::new("vol-2")).unwrap();
    scope.push("deleteLease", 1, &VolumeArgs::new("vol-2")).unwrap();
    drop(a);

    // back before anyone noticed
    cluster.advance(Duration::from_millis(200));
    let recorder = Recorder::default();
    let a = cluster.node(100, config, recorder.registry(CLEANUP));
    let startup = a.coordinator.start().await.unwrap();

    assert_eq!(startup.recovered_frames, 2);
    assert_eq!(startup.replay.replayed, 2);
    assert_eq!(recorder.calls(), vec!["deleteLease vol-2", "unmount vol-2"]);
}

#[tokio::test]
async fn frames_without_a_delegate_wait_for_one() {
    let cluster = TestCluster::new();
    let config = ClusterConfig {
        quorum: QuorumPolicy::Fixed(1),
        alerts_before_down: 1,
        replay_backoff_ms: 0,
        ..ClusterConfig::default()
    };
    crash_node_with_frames(&cluster, &config).await;

    // this survivor only knows how to undo one of the two steps
    let recorder = Recorder::default();
    let b = cluster.node(200, config.clone(), recorder.registry(&["unmount"]));
    b.coordinator.start().await.unwrap();

    let report = b.coordinator.tick().await.unwrap();
    assert_eq!(report.frames_taken_over, 2);
    assert_eq!(report.replay.failed, 1);
    assert_eq!(report.replay.replayed, 0);
    // "unmount" is older and must not run before "deleteLease"
    assert!(recorder.calls().is_empty());

    let left = b.coordinator.ledger().claimable(Msid(200)).unwrap();
    assert_eq!(left.len(), 2);
    assert_eq!(left[0].delegate, "deleteLease");
    assert_eq!(left[0].attempts, 1);
}
