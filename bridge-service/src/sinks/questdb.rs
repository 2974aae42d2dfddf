use bridge_client::db::{self, Row};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::pipeline::{BridgeError, StorageQuery};

/// Read side of QuestDB over the PostgreSQL wire protocol.
#[derive(Clone)]
pub struct QuestDbQuery {
    pool: PgPool,
}

impl QuestDbQuery {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, BridgeError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to connect to QuestDB pgwire: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StorageQuery for QuestDbQuery {
    async fn query(&self, expression: &str) -> Result<Vec<Row>, BridgeError> {
        let rows = db::fetch_rows(&self.pool, expression).await.map_err(|e| {
            metrics::counter!("questdb_query_errors_total").increment(1);
            BridgeError::Query(e.to_string())
        })?;
        tracing::debug!(rows = rows.len(), "questdb query completed");
        Ok(rows)
    }
}
