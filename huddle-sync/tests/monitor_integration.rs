//! Integration tests for peer link classification over the mesh.

use huddle_sync::mesh::{LinkProfile, Mesh};
use huddle_sync::monitor::{ConnectionType, MonitorConfig, PeerLinkMonitor, PeerLinkStatus};
use huddle_sync::peers::{
    CandidatePairState, CandidatePairStats, CandidateStats, CandidateType, FixedStats,
    PeerConnection, PeerStatsError, StaticPeerRegistry, StatsRecord,
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;

struct Unreachable;

#[async_trait]
impl PeerConnection for Unreachable {
    async fn stats(&self) -> Result<Vec<StatsRecord>, PeerStatsError> {
        Err(PeerStatsError::Disconnected)
    }
}

fn relayed_report() -> Vec<StatsRecord> {
    vec![
        StatsRecord::CandidatePair(CandidatePairStats {
            id: "CP1".into(),
            state: Some(CandidatePairState::Succeeded),
            local_candidate_id: Some("L1".into()),
            url: Some("turn:example:3478".into()),
            ..CandidatePairStats::default()
        }),
        StatsRecord::LocalCandidate(CandidateStats {
            id: "L1".into(),
            candidate_type: Some(CandidateType::Relay),
            ..CandidateStats::default()
        }),
    ]
}

#[tokio::test]
async fn test_relayed_peer_classified() {
    let registry = Arc::new(StaticPeerRegistry::new());
    registry.insert("peer-1", Arc::new(FixedStats(relayed_report())));

    let monitor = PeerLinkMonitor::new(registry, MonitorConfig::for_testing());
    let statuses = monitor.inspect_once().await;

    let status = &statuses["peer-1"];
    assert_eq!(status.connection_type, ConnectionType::Relayed);
    assert_eq!(status.server.as_deref(), Some("turn:example:3478"));
    assert_eq!(status.candidate_type, Some(CandidateType::Relay));
}

#[tokio::test]
async fn test_failing_peer_isolated() {
    let registry = Arc::new(StaticPeerRegistry::new());
    registry.insert("good", Arc::new(FixedStats(relayed_report())));
    registry.insert("bad", Arc::new(Unreachable));

    let monitor = PeerLinkMonitor::new(registry, MonitorConfig::for_testing());
    let statuses = monitor.inspect_once().await;

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses["good"].connection_type, ConnectionType::Relayed);
    assert_eq!(statuses["bad"], PeerLinkStatus::unknown());
}

#[tokio::test]
async fn test_mesh_link_profiles() {
    let mesh = Mesh::new();
    let me = Arc::new(mesh.join("me"));
    for peer in ["lan", "nat", "turn", "broken", "slow"] {
        mesh.join(peer);
    }
    mesh.set_link_profile(
        "me",
        "nat",
        LinkProfile::ServerReflexive {
            address: "203.0.113.7".into(),
            url: "stun:stun.example:3478".into(),
        },
    );
    mesh.set_link_profile(
        "me",
        "turn",
        LinkProfile::Relayed {
            url: "turn:relay.example:3478".into(),
        },
    );
    mesh.set_link_profile("me", "broken", LinkProfile::Failing);
    mesh.set_link_profile(
        "me",
        "slow",
        LinkProfile::Slow {
            delay: Duration::from_secs(5),
        },
    );

    let monitor = PeerLinkMonitor::new(me, MonitorConfig::for_testing());
    let statuses = monitor.inspect_once().await;

    assert_eq!(statuses["lan"].connection_type, ConnectionType::Direct);
    assert_eq!(statuses["lan"].label(), "host");
    assert_eq!(statuses["nat"].connection_type, ConnectionType::Direct);
    assert_eq!(statuses["nat"].server.as_deref(), Some("stun:stun.example:3478"));
    assert_eq!(statuses["turn"].connection_type, ConnectionType::Relayed);
    assert_eq!(statuses["turn"].label(), "TURN (relay)");
    assert_eq!(statuses["broken"].connection_type, ConnectionType::Unknown);
    assert_eq!(statuses["slow"].connection_type, ConnectionType::Unknown);
}

#[tokio::test]
async fn test_partitioned_peer_drops_out() {
    let mesh = Mesh::new();
    let me = Arc::new(mesh.join("me"));
    mesh.join("near");
    mesh.join("far");

    let monitor = PeerLinkMonitor::new(me, MonitorConfig::for_testing());
    monitor.start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(monitor.statuses().len(), 2);

    mesh.partition("me", "far");
    tokio::time::sleep(Duration::from_millis(60)).await;
    let statuses = monitor.statuses();
    assert!(statuses.contains_key("near"));
    assert!(!statuses.contains_key("far"));

    monitor.stop();
    assert!(!monitor.is_running());
}

#[tokio::test]
async fn test_stop_discards_in_flight_cycle() {
    let mesh = Mesh::new();
    let me = Arc::new(mesh.join("me"));
    mesh.join("slow");
    mesh.set_link_profile(
        "me",
        "slow",
        LinkProfile::Slow {
            delay: Duration::from_millis(30),
        },
    );

    let monitor = PeerLinkMonitor::new(me, MonitorConfig::for_testing());
    monitor.start();
    tokio::time::sleep(Duration::from_millis(5)).await;
    monitor.stop();
    let cycles = monitor.completed_cycles();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(monitor.completed_cycles(), cycles);
    assert!(monitor.statuses().is_empty());
}
