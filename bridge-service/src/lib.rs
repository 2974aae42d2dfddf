pub mod pipeline;
pub mod config;
pub mod sources;
pub mod sinks;
pub mod transform;
pub mod live;
pub mod backfill;
pub mod observability;
pub mod metrics_server;
pub mod shutdown;

pub use pipeline::{BridgeError, HistoryApi, LiveFeed, PointWriter, StorageQuery};
