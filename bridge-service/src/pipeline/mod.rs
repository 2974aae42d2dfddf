use bridge_client::{
    db::Row,
    domain::{ConsumptionPage, Cursor, Point},
};
use tokio::sync::mpsc;

use crate::live::FeedEvent;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("feed error: {0}")]
    Feed(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("query error: {0}")]
    Query(String),
}

/// The real-time subscription. Transport details live behind this trait; the
/// connection only sees named lifecycle events.
#[async_trait::async_trait]
pub trait LiveFeed: Send {
    /// Hands out the event receiver. Only one consumer is supported.
    fn subscribe(&mut self) -> Option<mpsc::Receiver<FeedEvent>>;

    async fn connect(&mut self) -> Result<(), BridgeError>;

    async fn close(&mut self);
}

/// Paginated historical consumption records for one home.
#[async_trait::async_trait]
pub trait HistoryApi: Send + Sync {
    async fn consumption_page(
        &self,
        home_id: &str,
        first: u32,
        after: &Cursor,
    ) -> Result<ConsumptionPage, BridgeError>;
}

/// Accepts points for persistence. Implementations may batch internally, so a
/// successful `write` means accepted, not necessarily durable.
#[async_trait::async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, point: Point) -> Result<(), BridgeError>;

    /// Flushes anything buffered and releases the connection.
    async fn close(&self) -> Result<(), BridgeError>;
}

#[async_trait::async_trait]
pub trait StorageQuery: Send + Sync {
    async fn query(&self, expression: &str) -> Result<Vec<Row>, BridgeError>;
}

#[async_trait::async_trait]
impl<T: PointWriter + ?Sized> PointWriter for std::sync::Arc<T> {
    async fn write(&self, point: Point) -> Result<(), BridgeError> {
        (**self).write(point).await
    }

    async fn close(&self) -> Result<(), BridgeError> {
        (**self).close().await
    }
}
