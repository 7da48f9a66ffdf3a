//! Relay server: accepts WebSocket connections and routes published frames
//! to every other connection subscribed to the same topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{RelayConfig, RelayFrame};
use crate::transport::TransportError;

/// A frame on a topic channel, tagged with the connection that published it.
type Routed = (u64, Arc<Vec<u8>>);

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub frames_lagged: u64,
    pub active_topics: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Topic name → broadcast channel.
struct TopicTable {
    topics: RwLock<HashMap<String, broadcast::Sender<Routed>>>,
    capacity: usize,
}

impl TopicTable {
    async fn get_or_create(&self, topic: &str) -> broadcast::Sender<Routed> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                return sender.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(sender) = topics.get(topic) {
            return sender.clone();
        }
        let (sender, _) = broadcast::channel(self.capacity.max(1));
        topics.insert(topic.to_string(), sender.clone());
        sender
    }

    async fn get(&self, topic: &str) -> Option<broadcast::Sender<Routed>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Drop the channel of a topic nobody listens to anymore.
    async fn remove_if_idle(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if topics.get(topic).is_some_and(|sender| sender.receiver_count() == 0) {
            topics.remove(topic);
        }
    }
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    topics: Arc<TopicTable>,
    stats: Arc<AtomicRelayStats>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: RelayConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| TransportError::Unavailable(format!("bind {}: {e}", config.bind_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        Ok(Self {
            listener,
            local_addr,
            topics: Arc::new(TopicTable {
                topics: RwLock::new(HashMap::new()),
                capacity: config.topic_capacity,
            }),
            stats: Arc::new(AtomicRelayStats::default()),
            next_connection: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub async fn stats(&self) -> RelayStats {
        snapshot(&self.stats, &self.topics).await
    }

    /// Run the accept loop on a background task. Returns a handle that can
    /// read stats while the relay runs.
    pub fn spawn(self) -> RelayHandle {
        let url = self.url();
        let stats = self.stats.clone();
        let topics = self.topics.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Relay stopped: {e}");
            }
        });
        RelayHandle {
            url,
            stats,
            topics,
            task,
        }
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), TransportError> {
        log::info!("Relay listening on {}", self.local_addr);
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let topics = self.topics.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, connection_id, &topics, &stats).await {
                    log::warn!("Relay connection {addr} ended with error: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Handle to a relay running in the background.
pub struct RelayHandle {
    url: String,
    stats: Arc<AtomicRelayStats>,
    topics: Arc<TopicTable>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn stats(&self) -> RelayStats {
        snapshot(&self.stats, &self.topics).await
    }

    /// Stop accepting connections. Established connections end when their
    /// peers disconnect.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn snapshot(stats: &AtomicRelayStats, topics: &TopicTable) -> RelayStats {
    RelayStats {
        total_connections: stats.total_connections.load(Ordering::Relaxed),
        active_connections: stats.active_connections.load(Ordering::Relaxed),
        frames_relayed: stats.frames_relayed.load(Ordering::Relaxed),
        frames_lagged: stats.frames_lagged.load(Ordering::Relaxed),
        active_topics: topics.topics.read().await.len(),
    }
}

/// Forward one topic's channel into a connection's outgoing queue, skipping
/// frames the connection published itself.
fn spawn_forwarder(
    connection_id: u64,
    topic: String,
    mut receiver: broadcast::Receiver<Routed>,
    outgoing: mpsc::Sender<Vec<u8>>,
    stats: Arc<AtomicRelayStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok((publisher, payload)) => {
                    if publisher == connection_id {
                        continue;
                    }
                    let frame = RelayFrame::Publish {
                        topic: topic.clone(),
                        payload: payload.as_ref().clone(),
                    };
                    let Ok(encoded) = frame.encode() else { continue };
                    if outgoing.send(encoded).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    stats.frames_lagged.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Connection {connection_id} lagged by {n} frames on {topic}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: u64,
    topics: &Arc<TopicTable>,
    stats: &Arc<AtomicRelayStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("Relay connection {connection_id} established from {addr}");

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(topics.capacity.max(1));
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match RelayFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode relay frame from {addr}: {e}");
                                continue;
                            }
                        };
                        match frame {
                            RelayFrame::Subscribe { topic } => {
                                if !forwarders.contains_key(&topic) {
                                    let receiver = topics.get_or_create(&topic).await.subscribe();
                                    let forwarder = spawn_forwarder(
                                        connection_id,
                                        topic.clone(),
                                        receiver,
                                        out_tx.clone(),
                                        stats.clone(),
                                    );
                                    forwarders.insert(topic.clone(), forwarder);
                                    log::debug!("Connection {connection_id} subscribed to {topic}");
                                }
                            }
                            RelayFrame::Unsubscribe { topic } => {
                                if let Some(forwarder) = forwarders.remove(&topic) {
                                    forwarder.abort();
                                    let _ = forwarder.await;
                                    topics.remove_if_idle(&topic).await;
                                }
                            }
                            RelayFrame::Publish { topic, payload } => {
                                // no channel means no subscribers
                                let delivered = match topics.get(&topic).await {
                                    Some(sender) => sender.send((connection_id, Arc::new(payload))).unwrap_or(0),
                                    None => 0,
                                };
                                if delivered > 0 {
                                    stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            RelayFrame::Ping(nonce) => {
                                let pong = match RelayFrame::Pong(nonce).encode() {
                                    Ok(pong) => pong,
                                    Err(e) => break Err(e.into()),
                                };
                                if let Err(e) = ws_sender.send(Message::Binary(pong.into())).await {
                                    break Err(e.into());
                                }
                            }
                            RelayFrame::Pong(_) => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Relay connection {connection_id} closed from {addr}");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e.into()),
                    _ => {}
                }
            }

            outgoing = out_rx.recv() => {
                if let Some(encoded) = outgoing {
                    if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                        break Err(e.into());
                    }
                }
            }
        }
    };

    for (topic, forwarder) in forwarders {
        forwarder.abort();
        let _ = forwarder.await;
        topics.remove_if_idle(&topic).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::bind(RelayConfig::for_testing()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_topic_table_reuses_channel() {
        let table = TopicTable {
            topics: RwLock::new(HashMap::new()),
            capacity: 4,
        };
        let first = table.get_or_create("t").await;
        let rx = first.subscribe();
        let second = table.get_or_create("t").await;
        assert_eq!(second.receiver_count(), 1);

        table.remove_if_idle("t").await;
        assert_eq!(table.topics.read().await.len(), 1);

        drop(rx);
        table.remove_if_idle("t").await;
        assert!(table.topics.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_does_not_create_topic() {
        let table = TopicTable {
            topics: RwLock::new(HashMap::new()),
            capacity: 4,
        };
        assert!(table.get("nobody").await.is_none());
        assert!(table.topics.read().await.is_empty());

        table.get_or_create("somebody").await;
        assert!(table.get("somebody").await.is_some());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_unavailable() {
        let server = RelayServer::bind(RelayConfig::for_testing()).await.unwrap();
        let taken = RelayConfig {
            bind_addr: server.local_addr().to_string(),
            ..RelayConfig::for_testing()
        };
        assert!(matches!(
            RelayServer::bind(taken).await,
            Err(TransportError::Unavailable(_))
        ));
    }
}
