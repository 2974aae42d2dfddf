use std::{net::SocketAddr, time::Duration};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    live::FeedEvent,
    pipeline::{BridgeError, LiveFeed},
    sources::reading_from_json,
};

/// One message pushed by the upstream subscriber.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayMessage {
    Connecting,
    ConnectionTimeout,
    Connected,
    ConnectionAck,
    HeartbeatTimeout,
    HeartbeatReconnect,
    Disconnected,
    Data {
        payload: serde_json::Map<String, serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl From<RelayMessage> for FeedEvent {
    fn from(m: RelayMessage) -> Self {
        match m {
            RelayMessage::Connecting => FeedEvent::Connecting,
            RelayMessage::ConnectionTimeout => FeedEvent::ConnectionTimeout,
            RelayMessage::Connected => FeedEvent::Connected,
            RelayMessage::ConnectionAck => FeedEvent::ConnectionAck,
            RelayMessage::HeartbeatTimeout => FeedEvent::HeartbeatTimeout,
            RelayMessage::HeartbeatReconnect => FeedEvent::HeartbeatReconnect,
            RelayMessage::Disconnected => FeedEvent::Disconnected,
            RelayMessage::Data { payload } => FeedEvent::Data(reading_from_json(payload)),
            RelayMessage::Error { message } => FeedEvent::Error(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedRelayOptions {
    pub bind_addr: String,
    pub channel_capacity: usize,
    /// Silence allowed before the feed is established.
    pub connection_timeout: Duration,
    /// Silence allowed once data is flowing.
    pub feed_timeout: Duration,
}

#[derive(Clone)]
struct RelayState {
    tx: mpsc::Sender<FeedEvent>,
}

/// Live feed delivered by an external subscriber over HTTP.
///
/// The subscriber POSTs JSON arrays of [`RelayMessage`] to `/feed/events`. A
/// watchdog turns silence into `connection_timeout` or `heartbeat_timeout`.
pub struct HttpFeedRelay {
    options: FeedRelayOptions,
    events_tx: mpsc::Sender<FeedEvent>,
    events_rx: Option<mpsc::Receiver<FeedEvent>>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpFeedRelay {
    pub fn new(options: FeedRelayOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity.max(1));
        Self {
            options,
            events_tx,
            events_rx: Some(events_rx),
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    /// Address actually bound, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl LiveFeed for HttpFeedRelay {
    fn subscribe(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.events_rx.take()
    }

    async fn connect(&mut self) -> Result<(), BridgeError> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let _ = self.events_tx.send(FeedEvent::Connecting).await;

        let addr: SocketAddr = self
            .options
            .bind_addr
            .parse()
            .map_err(|e| BridgeError::Feed(format!("invalid relay bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Feed(format!("failed to bind feed relay listener: {e}")))?;
        self.local_addr = listener.local_addr().ok();

        let (raw_tx, raw_rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let app = Router::new()
            .route("/feed/events", post(ingest_events))
            .with_state(RelayState { tx: raw_tx });

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "feed relay server error");
            }
        }));
        self.tasks.push(tokio::spawn(watchdog(
            raw_rx,
            self.events_tx.clone(),
            self.options.connection_timeout,
            self.options.feed_timeout,
        )));

        tracing::info!(addr = ?self.local_addr, "feed relay listening");
        Ok(())
    }

    async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.local_addr = None;
    }
}

async fn watchdog(
    mut raw: mpsc::Receiver<FeedEvent>,
    out: mpsc::Sender<FeedEvent>,
    connection_timeout: Duration,
    feed_timeout: Duration,
) {
    let mut established = false;

    loop {
        let limit = if established { feed_timeout } else { connection_timeout };
        let event = match tokio::time::timeout(limit, raw.recv()).await {
            Ok(Some(event)) => {
                match &event {
                    FeedEvent::Connected | FeedEvent::ConnectionAck | FeedEvent::Data(_) => {
                        established = true
                    }
                    FeedEvent::Error(_) => {}
                    _ => established = false,
                }
                event
            }
            Ok(None) => break,
            Err(_) if established => {
                established = false;
                FeedEvent::HeartbeatTimeout
            }
            Err(_) => FeedEvent::ConnectionTimeout,
        };

        if out.send(event).await.is_err() {
            break;
        }
    }
}

async fn ingest_events(
    State(state): State<RelayState>,
    Json(messages): Json<Vec<RelayMessage>>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("feed_relay_requests_total").increment(1);

    for message in messages {
        if state.tx.send(message.into()).await.is_err() {
            // Channel closed; treat as server error
            metrics::counter!("feed_relay_failed_total").increment(1);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::domain::Value;
    use serde_json::json;

    fn options(connection_timeout: Duration) -> FeedRelayOptions {
        FeedRelayOptions {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 16,
            connection_timeout,
            feed_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn relay_messages_map_to_feed_events() {
        let msg: RelayMessage = serde_json::from_value(json!({ "event": "heartbeat_reconnect" })).unwrap();
        assert_eq!(FeedEvent::from(msg), FeedEvent::HeartbeatReconnect);

        let msg: RelayMessage =
            serde_json::from_value(json!({ "event": "error", "message": "bad token" })).unwrap();
        assert_eq!(FeedEvent::from(msg), FeedEvent::Error("bad token".to_string()));

        let msg: RelayMessage = serde_json::from_value(json!({
            "event": "data",
            "payload": { "timestamp": "2024-01-01T00:00:00Z", "power": 1200, "currency": null }
        }))
        .unwrap();
        let FeedEvent::Data(reading) = FeedEvent::from(msg) else {
            panic!("expected data event");
        };
        assert_eq!(reading.number("power"), Some(1200.0));
        assert_eq!(reading.get("currency"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn posted_events_reach_the_subscriber() {
        let mut relay = HttpFeedRelay::new(options(Duration::from_secs(60)));
        let mut events = relay.subscribe().unwrap();
        relay.connect().await.unwrap();
        let addr = relay.local_addr().unwrap();

        let status = reqwest::Client::new()
            .post(format!("http://{addr}/feed/events"))
            .json(&json!([
                { "event": "connected" },
                { "event": "data", "payload": { "timestamp": "2024-01-01T00:00:00Z", "power": 900.5 } }
            ]))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::ACCEPTED);

        assert_eq!(events.recv().await, Some(FeedEvent::Connecting));
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        let Some(FeedEvent::Data(reading)) = events.recv().await else {
            panic!("expected data event");
        };
        assert_eq!(reading.number("power"), Some(900.5));

        relay.close().await;
    }

    #[tokio::test]
    async fn silence_before_connect_becomes_connection_timeout() {
        let mut relay = HttpFeedRelay::new(options(Duration::from_millis(30)));
        let mut events = relay.subscribe().unwrap();
        relay.connect().await.unwrap();

        assert_eq!(events.recv().await, Some(FeedEvent::Connecting));
        assert_eq!(events.recv().await, Some(FeedEvent::ConnectionTimeout));

        relay.close().await;
    }
}
