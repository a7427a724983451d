//! In-process relay for connection and pool tests.
//!
//! Listens on a loopback port, speaks just enough of the wire protocol to
//! script acknowledgement and delivery scenarios.

use agora_core::Event;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
pub enum MockRelayBehavior {
    /// OK-true every EVENT, EOSE every REQ.
    AckAll,
    /// OK-false every EVENT with the given reason.
    RejectAll { reason: String },
    /// Read frames, never answer.
    Silent,
    /// Close the socket as soon as the handshake completes.
    CloseImmediately,
    /// Answer REQ with these events followed by EOSE.
    ServeEvents(Vec<Event>),
    /// Answer REQ with EOSE immediately, then push the events after a
    /// delay, as a relay delivering live events would.
    ServeEventsAfter { events: Vec<Event>, delay: Duration },
}

pub struct MockRelay {
    pub url: String,
    accept_task: JoinHandle<()>,
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub async fn mock_relay(behavior: MockRelayBehavior) -> MockRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let accept_task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    run_session(ws, behavior).await;
                }
            });
        }
    });

    MockRelay { url, accept_task }
}

async fn run_session(mut ws: WebSocketStream<TcpStream>, behavior: MockRelayBehavior) {
    if matches!(behavior, MockRelayBehavior::CloseImmediately) {
        let _ = ws.close(None).await;
        return;
    }

    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(kind) = value.get(0).and_then(Value::as_str) else {
            continue;
        };
        if matches!(behavior, MockRelayBehavior::Silent) {
            continue;
        }

        match kind {
            "EVENT" => {
                let id = value
                    .get(1)
                    .and_then(|e| e.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let (accepted, reason) = match &behavior {
                    MockRelayBehavior::RejectAll { reason } => (false, reason.clone()),
                    _ => (true, String::new()),
                };
                let reply = json!(["OK", id, accepted, reason]).to_string();
                if ws.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            "REQ" => {
                let sub = value.get(1).and_then(Value::as_str).unwrap_or("").to_string();
                match &behavior {
                    MockRelayBehavior::ServeEvents(events) => {
                        for event in events {
                            let frame = json!(["EVENT", sub, event]).to_string();
                            if ws.send(Message::Text(frame.into())).await.is_err() {
                                return;
                            }
                        }
                        let eose = json!(["EOSE", sub]).to_string();
                        let _ = ws.send(Message::Text(eose.into())).await;
                    }
                    MockRelayBehavior::ServeEventsAfter { events, delay } => {
                        let eose = json!(["EOSE", sub]).to_string();
                        let _ = ws.send(Message::Text(eose.into())).await;
                        tokio::time::sleep(*delay).await;
                        for event in events {
                            let frame = json!(["EVENT", sub, event]).to_string();
                            if ws.send(Message::Text(frame.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => {
                        let eose = json!(["EOSE", sub]).to_string();
                        let _ = ws.send(Message::Text(eose.into())).await;
                    }
                }
            }
            _ => {}
        }
    }
}
