use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_client::{
    db::{self, Row, BACKFILL_SOURCE},
    domain::{ConsumptionNode, ConsumptionPage, Cursor, Reading, Value, TIMESTAMP_KEY},
};
use time::{format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{HistoryApi, PointWriter, StorageQuery},
    transform,
};

/// Pagination token for the instant: base64 of its UTC ISO-8601 form with
/// millisecond precision. Stable, so a restart asks for exactly the same page.
pub fn cursor_for(instant: OffsetDateTime) -> Result<Cursor, time::error::Format> {
    let iso = instant.to_offset(UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))?;
    Ok(Cursor::new(STANDARD.encode(iso)))
}

/// Running totals for one UTC calendar day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayAccumulator {
    day: Option<Date>,
    consumption: f64,
    cost: f64,
}

impl DayAccumulator {
    /// Continue from totals already persisted for `day`.
    pub fn resume(day: Date, consumption: f64, cost: f64) -> Self {
        Self {
            day: Some(day),
            consumption,
            cost,
        }
    }

    /// Add one record and return the `(consumption, cost)` snapshot.
    pub fn add(&mut self, at: OffsetDateTime, consumption: f64, cost: f64) -> (f64, f64) {
        let day = at.to_offset(UtcOffset::UTC).date();
        if self.day != Some(day) {
            self.day = Some(day);
            self.consumption = 0.0;
            self.cost = 0.0;
        }
        self.consumption += consumption;
        self.cost += cost;
        (self.consumption, self.cost)
    }
}

/// The latest backfilled row found in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub at: OffsetDateTime,
    pub accumulated_consumption: f64,
    pub accumulated_cost: f64,
}

impl ResumePoint {
    pub fn from_row(row: &Row) -> Option<Self> {
        let at = match row.get(TIMESTAMP_KEY)? {
            Value::Time(ts) => *ts,
            Value::Text(s) => OffsetDateTime::parse(s, &Rfc3339).ok()?,
            _ => return None,
        };
        let number = |key: &str| row.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        Some(Self {
            at,
            accumulated_consumption: number("accumulatedConsumption"),
            accumulated_cost: number("accumulatedCost"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub home_id: String,
    pub measurement: String,
    pub from_date: Date,
    pub page_size: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub pages: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed_requests: u64,
    pub failed_writes: u64,
    pub cancelled: bool,
}

/// Point for one historical record plus the day's running totals.
pub fn backfill_reading(node: &ConsumptionNode, consumption: f64, totals: (f64, f64)) -> Reading {
    Reading::new()
        .with(TIMESTAMP_KEY, node.from)
        .with("source", BACKFILL_SOURCE)
        .with("accumulatedConsumptionLastHour", consumption)
        .with("accumulatedConsumption", totals.0)
        .with("accumulatedCost", totals.1)
        .with("currency", node.currency.clone())
        .with("cost", node.cost)
        .with("unitPrice", node.unit_price)
        .with("unitPriceVAT", node.unit_price_vat)
        .with("totalCost", node.total_cost)
        .with("unitCost", node.unit_cost)
        .with(
            "consumptionUnit",
            node.consumption_unit.clone().filter(|u| !u.is_empty()),
        )
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Resumable historical reconciliation job.
pub struct BackfillEngine<A, Q, W> {
    api: A,
    query: Q,
    writer: W,
    settings: BackfillSettings,
}

impl<A, Q, W> BackfillEngine<A, Q, W>
where
    A: HistoryApi,
    Q: StorageQuery,
    W: PointWriter,
{
    pub fn new(api: A, query: Q, writer: W, settings: BackfillSettings) -> Self {
        Self {
            api,
            query,
            writer,
            settings,
        }
    }

    /// Latest backfilled row, or `None` when there is none or the query fails.
    pub async fn discover_resume_point(&self) -> Option<ResumePoint> {
        let sql = db::latest_backfilled_sql(&self.settings.measurement);
        match self.query.query(&sql).await {
            Ok(rows) => rows.first().and_then(ResumePoint::from_row),
            Err(e) => {
                tracing::warn!(error = %e, "could not determine backfill resume point");
                None
            }
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> BackfillSummary {
        let mut summary = BackfillSummary::default();

        let resume = self.discover_resume_point().await;
        let (start_at, mut acc, floor) = match &resume {
            Some(r) => {
                tracing::info!(resume_at = %r.at, "resuming backfill after last stored record");
                let day = r.at.to_offset(UtcOffset::UTC).date();
                (
                    r.at,
                    DayAccumulator::resume(day, r.accumulated_consumption, r.accumulated_cost),
                    Some(r.at),
                )
            }
            None => {
                let start = self.settings.from_date.midnight().assume_utc();
                tracing::info!(from = %start, "starting backfill from configured date");
                (start, DayAccumulator::default(), None)
            }
        };
        let mut cursor = match cursor_for(start_at) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(error = %e, start = %start_at, "cannot build backfill start cursor");
                return summary;
            }
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.api.consumption_page(&self.settings.home_id, self.settings.page_size, &cursor) => res,
            };

            match result {
                Ok(page) => {
                    summary.pages += 1;
                    self.process_page(&page, &mut acc, floor, cancel, &mut summary)
                        .await;
                    tracing::info!(
                        cursor = %cursor,
                        nodes = page.nodes.len(),
                        written = summary.written,
                        "backfill page processed"
                    );

                    if cancel.is_cancelled() || !page.has_next_page {
                        break;
                    }
                    match page.end_cursor {
                        Some(next) => cursor = next,
                        None => {
                            tracing::warn!(cursor = %cursor, "page reports more data but no next cursor");
                            break;
                        }
                    }
                }
                Err(e) => {
                    summary.failed_requests += 1;
                    metrics::counter!("backfill_page_failures_total").increment(1);
                    tracing::error!(error = %e, cursor = %cursor, "backfill page request failed, retrying after delay");
                }
            }

            if !pause(self.settings.delay, cancel).await {
                break;
            }
        }

        summary.cancelled = cancel.is_cancelled();
        if summary.cancelled {
            tracing::info!(?summary, "backfill cancelled");
        } else {
            tracing::info!(?summary, "backfill complete");
        }
        summary
    }

    async fn process_page(
        &self,
        page: &ConsumptionPage,
        acc: &mut DayAccumulator,
        floor: Option<OffsetDateTime>,
        cancel: &CancellationToken,
        summary: &mut BackfillSummary,
    ) {
        let mut previous: Option<OffsetDateTime> = None;

        for node in &page.nodes {
            if cancel.is_cancelled() {
                break;
            }

            let Some(consumption) = node.consumption else {
                summary.skipped += 1;
                continue;
            };
            if floor.is_some_and(|f| node.from <= f) {
                // Already persisted by an earlier run.
                summary.skipped += 1;
                continue;
            }
            if previous.is_some_and(|p| node.from < p) {
                tracing::warn!(from = %node.from, "backfill record out of order; day totals may be off");
            }
            previous = Some(node.from);

            let totals = acc.add(node.from, consumption, node.cost.unwrap_or(0.0));
            let reading = backfill_reading(node, consumption, totals);
            let point = transform::encode(&self.settings.measurement, &reading);

            match self.writer.write(point).await {
                Ok(()) => {
                    summary.written += 1;
                    metrics::counter!("backfill_points_written_total").increment(1);
                }
                Err(e) => {
                    summary.failed_writes += 1;
                    metrics::counter!("backfill_write_failures_total").increment(1);
                    tracing::error!(error = %e, from = %node.from, "failed to write backfill point");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{live::tests::MemoryWriter, pipeline::BridgeError};
    use bridge_client::domain::{FieldValue, Point};
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };
    use time::macros::{date, datetime};

    #[derive(Default)]
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<ConsumptionPage, BridgeError>>>,
        cursors: Mutex<Vec<Cursor>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<ConsumptionPage, BridgeError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                cursors: Mutex::default(),
            }
        }

        fn cursors(&self) -> Vec<Cursor> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HistoryApi for ScriptedApi {
        async fn consumption_page(
            &self,
            _home_id: &str,
            _first: u32,
            after: &Cursor,
        ) -> Result<ConsumptionPage, BridgeError> {
            self.cursors.lock().unwrap().push(after.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(last_page(vec![])))
        }
    }

    struct ScriptedQuery(Result<Vec<Row>, String>);

    #[async_trait::async_trait]
    impl StorageQuery for ScriptedQuery {
        async fn query(&self, _expression: &str) -> Result<Vec<Row>, BridgeError> {
            self.0.clone().map_err(BridgeError::Query)
        }
    }

    fn no_history() -> ScriptedQuery {
        ScriptedQuery(Ok(vec![]))
    }

    /// Cancels the token once `limit` points have been written.
    struct CancellingWriter {
        inner: MemoryWriter,
        cancel: CancellationToken,
        limit: usize,
    }

    #[async_trait::async_trait]
    impl PointWriter for CancellingWriter {
        async fn write(&self, point: Point) -> Result<(), BridgeError> {
            self.inner.write(point).await?;
            if self.inner.points().len() >= self.limit {
                self.cancel.cancel();
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn node(from: OffsetDateTime, consumption: Option<f64>, cost: Option<f64>) -> ConsumptionNode {
        ConsumptionNode {
            consumption,
            cost,
            currency: Some("NOK".to_string()),
            unit_price: Some(1.2),
            consumption_unit: Some("kWh".to_string()),
            ..ConsumptionNode::at(from)
        }
    }

    fn last_page(nodes: Vec<ConsumptionNode>) -> ConsumptionPage {
        ConsumptionPage {
            nodes,
            has_next_page: false,
            end_cursor: None,
        }
    }

    fn settings() -> BackfillSettings {
        BackfillSettings {
            home_id: "home-1".to_string(),
            measurement: "live_data".to_string(),
            from_date: date!(2024-01-01),
            page_size: 24,
            delay: Duration::ZERO,
        }
    }

    fn accumulated(points: &[Point]) -> Vec<f64> {
        points
            .iter()
            .filter_map(|p| p.float_field("accumulatedConsumption"))
            .collect()
    }

    #[test]
    fn cursor_encodes_utc_iso_instant() {
        let cursor = cursor_for(datetime!(2024-01-01 01:00:00 +01:00)).unwrap();
        let decoded = STANDARD.decode(cursor.as_str()).unwrap();
        assert_eq!(decoded, b"2024-01-01T00:00:00.000Z");
        assert_eq!(cursor, cursor_for(datetime!(2024-01-01 00:00:00 UTC)).unwrap());
    }

    #[test]
    fn accumulator_resets_on_utc_day_change() {
        let mut acc = DayAccumulator::default();
        assert_eq!(acc.add(datetime!(2024-01-01 22:00:00 UTC), 1.0, 0.5), (1.0, 0.5));
        assert_eq!(acc.add(datetime!(2024-01-01 23:00:00 UTC), 1.0, 0.5), (2.0, 1.0));
        assert_eq!(acc.add(datetime!(2024-01-02 00:00:00 UTC), 2.0, 1.0), (2.0, 1.0));
        // 00:30 at +01:00 is 23:30 UTC on the previous day.
        assert_eq!(acc.add(datetime!(2024-01-02 00:30:00 +01:00), 1.0, 0.0), (1.0, 0.0));
    }

    #[test]
    fn resume_point_reads_timestamp_and_totals() {
        let row: Row = [
            (TIMESTAMP_KEY.to_string(), Value::Time(datetime!(2024-02-01 05:00:00 UTC))),
            ("accumulatedConsumption".to_string(), Value::Number(3.5)),
            ("accumulatedCost".to_string(), Value::Null),
        ]
        .into_iter()
        .collect();

        let resume = ResumePoint::from_row(&row).unwrap();
        assert_eq!(resume.at, datetime!(2024-02-01 05:00:00 UTC));
        assert_eq!(resume.accumulated_consumption, 3.5);
        assert_eq!(resume.accumulated_cost, 0.0);

        let empty: Row = [(TIMESTAMP_KEY.to_string(), Value::Null)].into_iter().collect();
        assert!(ResumePoint::from_row(&empty).is_none());
    }

    #[tokio::test]
    async fn day_boundary_resets_running_totals() {
        let api = ScriptedApi::new(vec![Ok(last_page(vec![
            node(datetime!(2024-01-01 23:00:00 UTC), Some(1.0), Some(0.5)),
            node(datetime!(2024-01-02 00:00:00 UTC), Some(2.0), Some(1.0)),
        ]))]);
        let writer = Arc::new(MemoryWriter::default());
        let engine = BackfillEngine::new(api, no_history(), writer.clone(), settings());

        let summary = engine.run(&CancellationToken::new()).await;

        assert_eq!(summary.written, 2);
        assert_eq!(accumulated(&writer.points()), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn written_points_carry_snapshots_and_source_tag() {
        let api = ScriptedApi::new(vec![Ok(last_page(vec![
            node(datetime!(2024-01-01 00:00:00 UTC), Some(1.5), Some(0.75)),
            node(datetime!(2024-01-01 01:00:00 UTC), None, None),
        ]))]);
        let writer = Arc::new(MemoryWriter::default());
        let engine = BackfillEngine::new(api, no_history(), writer.clone(), settings());

        let summary = engine.run(&CancellationToken::new()).await;
        let points = writer.points();

        assert_eq!(summary.skipped, 1);
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.timestamp, Some(datetime!(2024-01-01 00:00:00 UTC)));
        assert_eq!(p.tag("source"), Some("backfill"));
        assert_eq!(p.tag("currency"), Some("NOK"));
        assert_eq!(p.tag("consumptionUnit"), Some("kWh"));
        assert_eq!(p.float_field("accumulatedConsumptionLastHour"), Some(1.5));
        assert_eq!(p.float_field("accumulatedCost"), Some(0.75));
        assert_eq!(p.field("cost"), Some(&FieldValue::Float(0.75)));
        assert_eq!(p.float_field("unitPrice"), Some(1.2));
        assert!(!p.has_key("unitPriceVAT"));
        assert!(!p.has_key("totalCost"));
    }

    #[tokio::test]
    async fn resumes_from_latest_stored_timestamp() {
        let latest = datetime!(2024-03-10 05:00:00 UTC);
        let row: Row = [
            (TIMESTAMP_KEY.to_string(), Value::Time(latest)),
            ("accumulatedConsumption".to_string(), Value::Number(5.0)),
            ("accumulatedCost".to_string(), Value::Number(2.0)),
        ]
        .into_iter()
        .collect();
        let api = Arc::new(ScriptedApi::new(vec![Ok(last_page(vec![
            node(latest, Some(9.0), Some(9.0)),
            node(datetime!(2024-03-10 06:00:00 UTC), Some(1.0), Some(0.5)),
        ]))]));
        let writer = Arc::new(MemoryWriter::default());
        let engine = BackfillEngine::new(
            ArcApi(api.clone()),
            ScriptedQuery(Ok(vec![row])),
            writer.clone(),
            settings(),
        );

        let summary = engine.run(&CancellationToken::new()).await;

        assert_eq!(api.cursors().first(), Some(&cursor_for(latest).unwrap()));
        assert_eq!(summary.skipped, 1);
        let points = writer.points();
        assert_eq!(accumulated(&points), vec![6.0]);
        assert_eq!(points[0].float_field("accumulatedCost"), Some(2.5));
    }

    #[tokio::test]
    async fn failed_resume_query_starts_from_configured_date() {
        let api = Arc::new(ScriptedApi::default());
        let engine = BackfillEngine::new(
            ArcApi(api.clone()),
            ScriptedQuery(Err("connection refused".to_string())),
            Arc::new(MemoryWriter::default()),
            settings(),
        );

        engine.run(&CancellationToken::new()).await;

        assert_eq!(
            api.cursors(),
            vec![cursor_for(datetime!(2024-01-01 00:00:00 UTC)).unwrap()]
        );
    }

    #[tokio::test]
    async fn follows_reported_cursor_and_retries_failed_pages_in_place() {
        let api = Arc::new(ScriptedApi::new(vec![
            Ok(ConsumptionPage {
                nodes: vec![node(datetime!(2024-01-01 00:00:00 UTC), Some(1.0), None)],
                has_next_page: true,
                end_cursor: Some(Cursor::new("page-2")),
            }),
            Err(BridgeError::Api("503".to_string())),
            Ok(last_page(vec![node(datetime!(2024-01-01 01:00:00 UTC), Some(1.0), None)])),
        ]));
        let writer = Arc::new(MemoryWriter::default());
        let engine = BackfillEngine::new(ArcApi(api.clone()), no_history(), writer.clone(), settings());

        let summary = engine.run(&CancellationToken::new()).await;

        let start = cursor_for(datetime!(2024-01-01 00:00:00 UTC)).unwrap();
        assert_eq!(
            api.cursors(),
            vec![start, Cursor::new("page-2"), Cursor::new("page-2")]
        );
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.pages, 2);
        assert_eq!(accumulated(&writer.points()), vec![1.0, 2.0]);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn cancellation_mid_page_stops_writing() {
        let cancel = CancellationToken::new();
        let nodes = (0..5)
            .map(|h| node(datetime!(2024-01-01 00:00:00 UTC) + time::Duration::hours(h), Some(1.0), None))
            .collect();
        let api = ScriptedApi::new(vec![Ok(ConsumptionPage {
            nodes,
            has_next_page: true,
            end_cursor: Some(Cursor::new("next")),
        })]);
        let writer = Arc::new(CancellingWriter {
            inner: MemoryWriter::default(),
            cancel: cancel.clone(),
            limit: 2,
        });
        let engine = BackfillEngine::new(api, no_history(), writer.clone(), settings());

        let summary = engine.run(&cancel).await;

        assert!(summary.cancelled);
        assert_eq!(summary.written, 2);
        assert_eq!(writer.inner.points().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_cuts_the_pacing_delay_short() {
        let api = ScriptedApi::new(vec![Err(BridgeError::Api("rate limited".to_string()))]);
        let engine = BackfillEngine::new(
            api,
            no_history(),
            Arc::new(MemoryWriter::default()),
            BackfillSettings {
                delay: Duration::from_secs(3600),
                ..settings()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), engine.run(&cancel))
            .await
            .expect("backfill should stop promptly once cancelled");

        assert!(summary.cancelled);
        assert_eq!(summary.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_successful_pages() {
        let delay = Duration::from_secs(2);
        let api = TimedApi {
            inner: ScriptedApi::new(vec![
                Ok(ConsumptionPage {
                    nodes: vec![node(datetime!(2024-01-01 00:00:00 UTC), Some(1.0), None)],
                    has_next_page: true,
                    end_cursor: Some(Cursor::new("page-2")),
                }),
                Ok(last_page(vec![node(datetime!(2024-01-01 01:00:00 UTC), Some(1.0), None)])),
            ]),
            calls: Mutex::default(),
        };
        let api = Arc::new(api);
        let engine = BackfillEngine::new(
            TimedArcApi(api.clone()),
            no_history(),
            Arc::new(MemoryWriter::default()),
            BackfillSettings { delay, ..settings() },
        );

        let summary = engine.run(&CancellationToken::new()).await;

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.failed_requests, 0);
        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= delay);
    }

    struct TimedApi {
        inner: ScriptedApi,
        calls: Mutex<Vec<tokio::time::Instant>>,
    }

    struct TimedArcApi(Arc<TimedApi>);

    #[async_trait::async_trait]
    impl HistoryApi for TimedArcApi {
        async fn consumption_page(
            &self,
            home_id: &str,
            first: u32,
            after: &Cursor,
        ) -> Result<ConsumptionPage, BridgeError> {
            self.0.calls.lock().unwrap().push(tokio::time::Instant::now());
            self.0.inner.consumption_page(home_id, first, after).await
        }
    }

    struct ArcApi(Arc<ScriptedApi>);

    #[async_trait::async_trait]
    impl HistoryApi for ArcApi {
        async fn consumption_page(
            &self,
            home_id: &str,
            first: u32,
            after: &Cursor,
        ) -> Result<ConsumptionPage, BridgeError> {
            self.0.consumption_page(home_id, first, after).await
        }
    }
}
