pub mod backfill_queries;

pub use backfill_queries::{day_coverage, fetch_rows, latest_backfilled_sql, DayCoverage, Row, BACKFILL_SOURCE};
