use std::fmt;

use bridge_client::domain::Reading;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{BridgeError, LiveFeed, PointWriter},
    transform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Disconnected,
    Waiting,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Numeric status code as published on the status channel.
    pub fn code(self) -> i32 {
        match self {
            ConnectionState::Unknown => -1,
            ConnectionState::Disconnected => 0,
            ConnectionState::Waiting => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 100,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Everything the live feed can tell us.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connecting,
    ConnectionTimeout,
    Connected,
    ConnectionAck,
    HeartbeatTimeout,
    HeartbeatReconnect,
    Disconnected,
    Data(Reading),
    Error(String),
}

impl FeedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FeedEvent::Connecting => "connecting",
            FeedEvent::ConnectionTimeout => "connection_timeout",
            FeedEvent::Connected => "connected",
            FeedEvent::ConnectionAck => "connection_ack",
            FeedEvent::HeartbeatTimeout => "heartbeat_timeout",
            FeedEvent::HeartbeatReconnect => "heartbeat_reconnect",
            FeedEvent::Disconnected => "disconnected",
            FeedEvent::Data(_) => "data",
            FeedEvent::Error(_) => "error",
        }
    }
}

/// Transition table. `None` leaves the state unchanged.
///
/// A disconnect while waiting or connecting is reconnect churn and is ignored.
pub fn next_state(current: ConnectionState, event: &FeedEvent) -> Option<ConnectionState> {
    match event {
        FeedEvent::Connecting | FeedEvent::HeartbeatReconnect => Some(ConnectionState::Connecting),
        FeedEvent::Connected | FeedEvent::ConnectionAck | FeedEvent::Data(_) => {
            Some(ConnectionState::Connected)
        }
        FeedEvent::ConnectionTimeout | FeedEvent::HeartbeatTimeout => Some(ConnectionState::Waiting),
        FeedEvent::Disconnected => match current {
            ConnectionState::Waiting | ConnectionState::Connecting => None,
            _ => Some(ConnectionState::Disconnected),
        },
        FeedEvent::Error(_) => None,
    }
}

/// Outward notifications for observers of the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status(ConnectionState),
    Processed(Reading),
    Error(String),
}

/// Consumes the live feed and writes every reading as a point.
pub struct LiveIngestConnection<F, W> {
    feed: F,
    writer: W,
    measurement: String,
    state: ConnectionState,
    notify: mpsc::UnboundedSender<Notification>,
}

impl<F, W> LiveIngestConnection<F, W>
where
    F: LiveFeed,
    W: PointWriter,
{
    pub fn new(
        feed: F,
        writer: W,
        measurement: impl Into<String>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            feed,
            writer,
            measurement: measurement.into(),
            state: ConnectionState::Unknown,
            notify,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn emit(&self, notification: Notification) {
        // Nobody listening is fine.
        let _ = self.notify.send(notification);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "status changed");
        self.state = state;
        metrics::counter!("live_status_changes_total").increment(1);
        metrics::gauge!("live_connection_status").set(f64::from(state.code()));
        self.emit(Notification::Status(state));
    }

    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            tracing::debug!(state = %self.state, "connect requested while already active");
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        tracing::info!("connecting to live feed");
        self.feed.connect().await
    }

    pub async fn handle(&mut self, event: FeedEvent) {
        if let Some(state) = next_state(self.state, &event) {
            self.set_state(state);
        }

        match event {
            FeedEvent::Data(reading) => self.process(reading).await,
            FeedEvent::Error(message) => {
                tracing::error!(error = %message, "live feed error");
                self.emit(Notification::Error(message));
            }
            FeedEvent::ConnectionTimeout => tracing::warn!("live feed connection timeout"),
            ev @ (FeedEvent::Connecting | FeedEvent::Disconnected) => {
                tracing::info!(event = ev.name(), "live feed lifecycle")
            }
            other => tracing::debug!(event = other.name(), "live feed lifecycle"),
        }
    }

    async fn process(&mut self, reading: Reading) {
        let normalized = transform::normalize_phases(&reading);
        let Some(ts) = normalized.timestamp() else {
            tracing::warn!("dropping live reading without a parseable timestamp");
            metrics::counter!("live_readings_rejected_total").increment(1);
            return;
        };
        tracing::debug!(%ts, "received live reading");

        let point = transform::encode(&self.measurement, &normalized);
        match self.writer.write(point).await {
            Ok(()) => metrics::counter!("live_readings_processed_total").increment(1),
            Err(e) => {
                tracing::error!(error = %e, %ts, "failed to write live reading");
                metrics::counter!("live_write_failures_total").increment(1);
            }
        }

        self.emit(Notification::Processed(reading));
    }

    /// Drive the connection until the feed ends or `shutdown` fires.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), BridgeError> {
        let mut events = self
            .feed
            .subscribe()
            .ok_or_else(|| BridgeError::Feed("feed events already taken".to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        tracing::warn!("live feed event channel closed");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    pub async fn close(&mut self) {
        tracing::info!("closing live feed");
        self.feed.close().await;

        if let Err(e) = self.writer.close().await {
            tracing::error!(error = %e, "error closing storage writer");
        }

        self.set_state(ConnectionState::Disconnected);
    }
}
