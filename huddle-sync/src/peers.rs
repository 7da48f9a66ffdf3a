//! Peer registry and connection statistics records.
//!
//! Statistics follow the shape of WebRTC `getStats()` reports: a flat list of
//! records tagged by `type`. Every field is optional; absent or unrecognised
//! values end up as `None`/`Unknown` instead of failing the whole report.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque peer identifier as reported by the mesh.
pub type PeerId = String;

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    /// Server reflexive (address learned through STUN)
    Srflx,
    /// Peer reflexive
    Prflx,
    /// TURN relay
    Relay,
    #[serde(other)]
    Unknown,
}

impl FromStr for CandidateType {
    type Err = PeerStatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::Srflx),
            "prflx" => Ok(CandidateType::Prflx),
            "relay" => Ok(CandidateType::Relay),
            other => Err(PeerStatsError::Malformed(format!("unknown candidate type {other:?}"))),
        }
    }
}

/// ICE candidate pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Failed,
    Succeeded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidatePairStats {
    pub id: String,
    pub state: Option<CandidatePairState>,
    pub selected: Option<bool>,
    #[serde(alias = "localCandidate", alias = "local")]
    pub local_candidate_id: Option<String>,
    pub remote_candidate_id: Option<String>,
    /// Relay/STUN server URL, when the browser reports it on the pair
    pub url: Option<String>,
}

impl CandidatePairStats {
    /// Whether this pair carries the active path.
    pub fn is_active(&self) -> bool {
        self.state == Some(CandidatePairState::Succeeded) || self.selected == Some(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateStats {
    pub id: String,
    pub candidate_type: Option<CandidateType>,
    pub address: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
}

/// One record of a connection statistics report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatsRecord {
    CandidatePair(CandidatePairStats),
    #[serde(alias = "candidate")]
    LocalCandidate(CandidateStats),
    RemoteCandidate(CandidateStats),
    /// Transport, codec, inbound-rtp and the rest
    #[serde(other)]
    Other,
}

impl StatsRecord {
    /// Parse a JSON array of stats records. Entries that do not fit a known
    /// shape become [`StatsRecord::Other`].
    pub fn parse_report(json: &str) -> Result<Vec<StatsRecord>, PeerStatsError> {
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(json).map_err(|e| PeerStatsError::Malformed(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|entry| serde_json::from_value(entry).unwrap_or(StatsRecord::Other))
            .collect())
    }
}

/// A live connection to one peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Current connection statistics.
    async fn stats(&self) -> Result<Vec<StatsRecord>, PeerStatsError>;
}

/// Enumerates the peers currently connected to this replica.
pub trait PeerRegistry: Send + Sync {
    fn peers(&self) -> Vec<(PeerId, Arc<dyn PeerConnection>)>;
}

/// Registry backed by an explicit map, for embedding and tests.
#[derive(Default)]
pub struct StaticPeerRegistry {
    peers: RwLock<BTreeMap<PeerId, Arc<dyn PeerConnection>>>,
}

impl StaticPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer_id: impl Into<PeerId>, connection: Arc<dyn PeerConnection>) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.into(), connection);
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .is_some()
    }
}

impl PeerRegistry for StaticPeerRegistry {
    fn peers(&self) -> Vec<(PeerId, Arc<dyn PeerConnection>)> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, connection)| (id.clone(), connection.clone()))
            .collect()
    }
}

/// A connection that answers with a fixed report.
pub struct FixedStats(pub Vec<StatsRecord>);

#[async_trait]
impl PeerConnection for FixedStats {
    async fn stats(&self) -> Result<Vec<StatsRecord>, PeerStatsError> {
        Ok(self.0.clone())
    }
}

/// Peer statistics errors.
#[derive(Debug, Clone, Error)]
pub enum PeerStatsError {
    #[error("peer stats unavailable: {0}")]
    Unavailable(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("malformed stats report: {0}")]
    Malformed(String),
}
