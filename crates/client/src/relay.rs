//! Connection to a single relay.
//!
//! One WebSocket session per relay. The socket is split on connect: the
//! write half sits behind a mutex for REQ/EVENT/CLOSE sends, and a reader
//! task owns the read half, fanning parsed messages out on a broadcast
//! channel. Publish acknowledgements (OK frames) are additionally routed to
//! per-event oneshot waiters so `publish` can await its own ack without
//! scanning the broadcast stream.
//!
//! A malformed inbound message is logged and skipped; it never tears down
//! the connection.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use agora_core::Event;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A relay's answer to a published event.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub event_id: String,
    pub accepted: bool,
    /// Empty when accepted, relay-supplied reason when rejected.
    pub message: String,
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// How long `publish` waits for an OK frame.
    pub ack_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay.
    pub max_reconnect_delay: Duration,
    /// Broadcast buffer for inbound messages.
    pub incoming_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            incoming_buffer: 1024,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type AckSender = oneshot::Sender<Acknowledgement>;

/// One bidirectional session to a relay.
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsSink>>>,
    /// Parsed inbound messages; subscriptions tap this.
    incoming: broadcast::Sender<RelayMessage>,
    pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
    disconnected: Arc<Notify>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayConnection {
    pub fn new(url: impl AsRef<str>, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )));
            }
        }
        let (incoming, _) = broadcast::channel(config.incoming_buffer);
        Ok(Self {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            incoming,
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            disconnected: Arc::new(Notify::new()),
            reader_task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Establish the WebSocket session. Returns the connect latency.
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<Duration> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Connected => return Ok(Duration::ZERO),
                ConnectionState::Connecting => {
                    return Err(ClientError::Connection(
                        "connect already in progress".to_string(),
                    ));
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }

        debug!(url = %self.url, "connecting to relay");
        let started = Instant::now();

        let stream = match timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "connect timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let latency = started.elapsed();
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);

        let handle = self.spawn_reader(source);
        *self.reader_task.lock().await = Some(handle);

        *self.state.write().await = ConnectionState::Connected;
        info!(url = %self.url, ?latency, "connected to relay");
        Ok(latency)
    }

    fn spawn_reader(&self, mut source: WsSource) -> tokio::task::JoinHandle<()> {
        let url = self.url.to_string();
        let state = Arc::clone(&self.state);
        let writer = Arc::clone(&self.writer);
        let incoming = self.incoming.clone();
        let pending_acks = Arc::clone(&self.pending_acks);
        let disconnected = Arc::clone(&self.disconnected);

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                        Ok(message) => {
                            if let RelayMessage::Ok {
                                event_id,
                                success,
                                message: reason,
                            } = &message
                                && let Some(tx) = pending_acks.lock().await.remove(event_id)
                            {
                                let _ = tx.send(Acknowledgement {
                                    event_id: event_id.clone(),
                                    accepted: *success,
                                    message: reason.clone(),
                                });
                            }
                            if let RelayMessage::Notice { message: notice } = &message {
                                debug!(url = %url, notice = %notice, "relay notice");
                            }
                            // No receivers is fine; nothing is subscribed yet.
                            let _ = incoming.send(message);
                        }
                        Err(e) => {
                            debug!(url = %url, error = %e, "skipping malformed relay message");
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        let mut guard = writer.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!(url = %url, "relay closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(url = %url, error = %e, "websocket read error");
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            writer.lock().await.take();
            // Waiters on in-flight publishes see a dropped channel.
            pending_acks.lock().await.clear();
            disconnected.notify_waiters();
            debug!(url = %url, "reader loop ended");
        })
    }

    /// Resolve when the connection is no longer up. Used by the pool's
    /// reconnect supervisor.
    pub async fn wait_disconnected(&self) {
        loop {
            let notified = self.disconnected.notified();
            if *self.state.read().await != ConnectionState::Connected {
                return;
            }
            notified.await;
        }
    }

    /// Subscribe to the parsed inbound message stream.
    pub fn messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.incoming.subscribe()
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let mut guard = self.writer.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    /// Open a subscription on this relay.
    pub async fn subscribe(&self, subscription_id: &str, filters: &[Filter]) -> Result<()> {
        self.send(&ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        })
        .await
    }

    /// Close a subscription on this relay.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.send(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    /// Send an event and wait for the relay's OK frame.
    pub async fn publish(&self, event: &Event) -> Result<Acknowledgement> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(event.id.clone(), tx);

        if let Err(e) = self.send(&ClientMessage::Event(event.clone())).await {
            self.pending_acks.lock().await.remove(&event.id);
            return Err(e);
        }

        match timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::Connection(
                "connection lost awaiting acknowledgement".to_string(),
            )),
            Err(_) => {
                self.pending_acks.lock().await.remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no acknowledgement within {:?}",
                    self.config.ack_timeout
                )))
            }
        }
    }

    /// Tear the session down. Idempotent; forcibly drops the socket if the
    /// close handshake stalls.
    pub async fn close(&self) {
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = timeout(Duration::from_secs(2), sink.close()).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        self.pending_acks.lock().await.clear();
        self.disconnected.notify_waiters();
        debug!(url = %self.url, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockRelayBehavior, mock_relay};

    fn fast_config() -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(RelayConnection::new("https://example.com", RelayConfig::default()).is_err());
        assert!(RelayConnection::new("not a url", RelayConfig::default()).is_err());
        assert!(RelayConnection::new("wss://relay.example", RelayConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn publish_receives_acknowledgement() {
        let relay = mock_relay(MockRelayBehavior::AckAll).await;
        let conn = RelayConnection::new(&relay.url, fast_config()).unwrap();
        conn.connect().await.unwrap();

        let ack = conn.publish(&sample_event("e1")).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.event_id, "e1");

        conn.close().await;
    }

    #[tokio::test]
    async fn publish_rejection_carries_reason() {
        let relay = mock_relay(MockRelayBehavior::RejectAll {
            reason: "blocked: not welcome".to_string(),
        })
        .await;
        let conn = RelayConnection::new(&relay.url, fast_config()).unwrap();
        conn.connect().await.unwrap();

        let ack = conn.publish(&sample_event("e1")).await.unwrap();
        assert!(!ack.accepted);
        assert!(ack.message.contains("blocked"));

        conn.close().await;
    }

    #[tokio::test]
    async fn publish_times_out_against_a_silent_relay() {
        let relay = mock_relay(MockRelayBehavior::Silent).await;
        let conn = RelayConnection::new(&relay.url, fast_config()).unwrap();
        conn.connect().await.unwrap();

        let err = conn.publish(&sample_event("e1")).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        conn.close().await;
    }

    #[tokio::test]
    async fn subscribe_streams_events_until_eose() {
        let relay = mock_relay(MockRelayBehavior::ServeEvents(vec![
            sample_event("a"),
            sample_event("b"),
        ]))
        .await;
        let conn = RelayConnection::new(&relay.url, fast_config()).unwrap();
        conn.connect().await.unwrap();

        let mut messages = conn.messages();
        conn.subscribe("sub1", &[Filter::new().kinds(vec![1])])
            .await
            .unwrap();

        let mut ids = vec![];
        loop {
            match timeout(Duration::from_secs(2), messages.recv())
                .await
                .expect("relay went quiet")
                .expect("stream closed")
            {
                RelayMessage::Event { event, .. } => ids.push(event.id),
                RelayMessage::Eose { subscription_id } => {
                    assert_eq!(subscription_id, "sub1");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(ids, vec!["a", "b"]);

        conn.close().await;
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let conn = RelayConnection::new("wss://unreachable.example", fast_config()).unwrap();
        let err = conn
            .send(&ClientMessage::Close {
                subscription_id: "s".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_wakes_waiters() {
        let relay = mock_relay(MockRelayBehavior::CloseImmediately).await;
        let conn = Arc::new(RelayConnection::new(&relay.url, fast_config()).unwrap());
        conn.connect().await.unwrap();

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.wait_disconnected().await })
        };

        timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let relay = mock_relay(MockRelayBehavior::Silent).await;
        let conn = RelayConnection::new(&relay.url, fast_config()).unwrap();
        conn.connect().await.unwrap();
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }
}
