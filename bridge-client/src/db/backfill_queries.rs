use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::{postgres::PgRow, Column, PgPool, Row as _};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::domain::Value;

/// A dynamically typed result row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Tag value that marks rows written by the backfill job.
pub const BACKFILL_SOURCE: &str = "backfill";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DayCoverage {
    pub day: PrimitiveDateTime,
    pub hours: i64,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Query for the most recent backfilled row together with its running totals.
pub fn latest_backfilled_sql(measurement: &str) -> String {
    format!(
        "SELECT timestamp, accumulatedConsumption, accumulatedCost FROM {} \
         WHERE source = '{BACKFILL_SOURCE}' ORDER BY timestamp DESC LIMIT 1",
        quote_ident(measurement)
    )
}

/// Run an arbitrary query and decode every column into a [`Value`].
pub async fn fetch_rows(pool: &PgPool, sql: &str) -> Result<Vec<Row>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows.iter().map(decode_row).collect())
}

fn decode_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), decode_column(row, col.ordinal())))
        .collect()
}

// NULLs decode as `None` for any type, so the first probe settles them.
fn decode_column(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<OffsetDateTime>, _>(idx) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<Option<PrimitiveDateTime>, _>(idx) {
        return v.map(PrimitiveDateTime::assume_utc).into();
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(f64::from).into();
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(i64::from).into();
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.into();
    }
    Value::Null
}

/// Number of backfilled hourly rows per UTC calendar day in `[start, end)`.
pub async fn day_coverage(
    pool: &PgPool,
    measurement: &str,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
) -> Result<Vec<DayCoverage>> {
    let sql = format!(
        r#"
        SELECT
            timestamp AS day,
            count() AS hours
        FROM {}
        WHERE source = '{BACKFILL_SOURCE}'
          AND timestamp >= $1
          AND timestamp <  $2
        SAMPLE BY 1d ALIGN TO CALENDAR
        "#,
        quote_ident(measurement)
    );

    let rows = sqlx::query_as::<_, DayCoverage>(&sql)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
