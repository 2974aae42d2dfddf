use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use bridge_client::db::day_coverage;
use bridge_service::{config::AppConfig, observability, sinks::QuestDbQuery};
use time::{macros::format_description, Date, Duration, OffsetDateTime};

const HOURS_PER_DAY: i64 = 24;

fn parse_day(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).with_context(|| format!("invalid date {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    // usage: backfill_coverage [from YYYY-MM-DD] [to YYYY-MM-DD, exclusive]
    let args: Vec<String> = std::env::args().skip(1).collect();
    let from = match args.first() {
        Some(s) => parse_day(s)?,
        None => cfg.backfill_from_date()?,
    };
    let to = match args.get(1) {
        Some(s) => parse_day(s)?,
        None => OffsetDateTime::now_utc().date(),
    };
    if from >= to {
        bail!("empty window: {from} .. {to}");
    }

    let query = QuestDbQuery::connect(&cfg.questdb.uri, cfg.questdb.max_connections).await?;
    let rows = day_coverage(query.pool(), &cfg.measurement, from.midnight(), to.midnight()).await?;

    let by_day: BTreeMap<Date, i64> = rows.into_iter().map(|r| (r.day.date(), r.hours)).collect();

    let mut day = from;
    let mut incomplete = 0u32;
    let mut total_hours = 0i64;
    while day < to {
        let hours = by_day.get(&day).copied().unwrap_or(0);
        total_hours += hours;
        if hours < HOURS_PER_DAY {
            incomplete += 1;
            tracing::warn!(day = %day, hours, "incomplete backfill day");
        } else {
            tracing::debug!(day = %day, hours, "complete backfill day");
        }
        day += Duration::days(1);
    }

    tracing::info!(
        measurement = %cfg.measurement,
        from = %from,
        to = %to,
        total_hours,
        incomplete_days = incomplete,
        "backfill coverage report"
    );

    Ok(())
}
