//! Relay client implementing [`BroadcastTransport`] over one WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::RelayFrame;
use crate::transport::{
    BroadcastTransport, FrameSink, TopicSubscription, TransportError, DEFAULT_SUBSCRIPTION_CAPACITY,
};

type Sinks = HashMap<String, Vec<(u64, FrameSink)>>;

struct ClientState {
    connected: AtomicBool,
    sinks: Mutex<Sinks>,
    next_subscription: AtomicU64,
    pongs: AtomicU64,
}

impl ClientState {
    fn sinks(&self) -> MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connection to a [`super::RelayServer`].
pub struct RelayTransport {
    url: String,
    outgoing: mpsc::Sender<Vec<u8>>,
    state: Arc<ClientState>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayTransport {
    /// Connect to the relay at `url` (e.g. `ws://127.0.0.1:4444`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Unavailable(format!("connect {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(ClientState {
            connected: AtomicBool::new(true),
            sinks: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            pongs: AtomicU64::new(0),
        });

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_SUBSCRIPTION_CAPACITY);
        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
            writer_state.connected.store(false, Ordering::SeqCst);
        });

        // Reader task: route incoming frames to local subscriptions
        let reader_state = state.clone();
        let relay_url = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Publish { topic, payload }) => {
                                let frame = Arc::new(payload);
                                let sinks = reader_state.sinks();
                                if let Some(subscribers) = sinks.get(&topic) {
                                    for (_, sink) in subscribers {
                                        sink.deliver(frame.clone());
                                    }
                                }
                            }
                            Ok(RelayFrame::Pong(_)) => {
                                reader_state.pongs.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(other) => log::debug!("Ignoring unexpected relay frame {other:?}"),
                            Err(e) => log::warn!("Failed to decode frame from {relay_url}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            log::info!("Relay connection to {relay_url} lost");
            reader_state.connected.store(false, Ordering::SeqCst);
            // Dropping the sinks ends every subscription's stream.
            reader_state.sinks().clear();
        });

        log::info!("Connected to relay {url}");
        Ok(Self {
            url: url.to_string(),
            outgoing: out_tx,
            state,
            reader,
            writer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    /// Send an application-level ping.
    pub async fn ping(&self, nonce: u64) -> Result<(), TransportError> {
        self.send(RelayFrame::Ping(nonce)).await
    }

    /// Pongs received so far.
    pub fn pongs_received(&self) -> u64 {
        self.state.pongs.load(Ordering::Relaxed)
    }

    /// Close the connection. Subscriptions end and later calls fail with
    /// [`TransportError::Unavailable`].
    pub fn close(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.state.sinks().clear();
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!("relay {} not connected", self.url)))
        }
    }

    async fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let encoded = frame.encode()?;
        self.outgoing
            .send(encoded)
            .await
            .map_err(|_| TransportError::Unavailable(format!("relay {} connection closed", self.url)))
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl BroadcastTransport for RelayTransport {
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send(RelayFrame::Publish {
            topic: topic.to_string(),
            payload: bytes,
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, TransportError> {
        self.ensure_connected()?;

        let id = self.state.next_subscription.fetch_add(1, Ordering::Relaxed);
        let release_state = Arc::downgrade(&self.state);
        let release_outgoing = self.outgoing.clone();
        let release_topic = topic.to_string();
        let (sink, subscription) =
            TopicSubscription::channel(topic, DEFAULT_SUBSCRIPTION_CAPACITY, move || {
                let Some(state) = release_state.upgrade() else { return };
                let mut sinks = state.sinks();
                let Some(subscribers) = sinks.get_mut(&release_topic) else { return };
                subscribers.retain(|(sid, _)| *sid != id);
                if subscribers.is_empty() {
                    sinks.remove(&release_topic);
                    let frame = RelayFrame::Unsubscribe {
                        topic: release_topic.clone(),
                    };
                    if let Ok(encoded) = frame.encode() {
                        let _ = release_outgoing.try_send(encoded);
                    }
                }
            });

        let first = {
            let mut sinks = self.state.sinks();
            let subscribers = sinks.entry(topic.to_string()).or_default();
            subscribers.push((id, sink));
            subscribers.len() == 1
        };
        if first {
            self.send(RelayFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await?;
        }
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = RelayTransport::connect(&format!("ws://127.0.0.1:{port}")).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
