use std::{net::SocketAddr, time::Duration};

use bridge_client::domain::{FieldValue, Point};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::pipeline::{BridgeError, PointWriter};

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash. Line
/// breaks cannot be escaped in identifiers, so they are replaced by an
/// escaped space.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' | '\r' => out.push_str("\\ "),
            _ => out.push(ch),
        }
    }
}

fn ilp_escape_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out.push('"');
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field(out: &mut String, first: &mut bool, key: &str, value: &FieldValue) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }

    ilp_escape_ident(key, out);
    out.push('=');
    match value {
        // Unsuffixed numbers are floats in ILP.
        FieldValue::Float(v) => out.push_str(&v.to_string()),
        FieldValue::Bool(true) => out.push('t'),
        FieldValue::Bool(false) => out.push('f'),
        FieldValue::Str(s) => ilp_escape_string(s, out),
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Content hash of a point. Identical timestamp, tags and fields always give
/// the same id, so rewrites can be deduplicated on `(timestamp, event_id)`.
/// Written as a string field; a per-row unique value must not be a SYMBOL.
pub fn event_id(point: &Point) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, &point.measurement);
    match point.timestamp {
        Some(ts) => {
            h.update(&[1]);
            h.update(&ts.unix_timestamp_nanos().to_le_bytes());
        }
        None => {
            h.update(&[0]);
        }
    }
    for (k, v) in &point.tags {
        hash_str(&mut h, k);
        hash_str(&mut h, v);
    }
    for (k, v) in &point.fields {
        hash_str(&mut h, k);
        match v {
            FieldValue::Float(x) => {
                h.update(&[0]);
                h.update(&x.to_bits().to_le_bytes());
            }
            FieldValue::Bool(b) => {
                h.update(&[1, u8::from(*b)]);
            }
            FieldValue::Str(s) => {
                h.update(&[2]);
                hash_str(&mut h, s);
            }
        }
    }
    h.finalize().to_hex().to_string()
}

/// Render one ILP line (without the trailing newline).
///
/// Returns `false` and leaves `out` untouched when the point has no writable
/// field, since ILP rejects field-less lines.
pub fn write_ilp_line(point: &Point, with_event_id: bool, out: &mut String) -> bool {
    let writable = |v: &FieldValue| !matches!(v, FieldValue::Float(x) if !x.is_finite());
    if !point.fields.values().any(writable) {
        return false;
    }

    // measurement
    ilp_escape_ident(&point.measurement, out);

    // tags (SYMBOL columns); ILP has no empty tag values
    for (k, v) in point.tags.iter().filter(|(k, v)| !k.is_empty() && !v.is_empty()) {
        push_tag(out, k, v);
    }

    // fields
    out.push(' ');
    let mut first = true;
    if with_event_id {
        push_field(out, &mut first, "event_id", &FieldValue::Str(event_id(point)));
    }
    for (k, v) in point.fields.iter().filter(|(_, v)| writable(v)) {
        push_field(out, &mut first, k, v);
    }

    // timestamp (nanos); the server assigns one when absent
    if let Some(ts) = point.timestamp {
        out.push(' ');
        out.push_str(&ts.unix_timestamp_nanos().to_string());
    }

    true
}

#[derive(Debug, Clone)]
pub struct IlpWriterOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub flush_interval: Duration,
    pub event_id: bool,
}

impl Default for IlpWriterOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            flush_interval: Duration::from_secs(10),
            event_id: true,
        }
    }
}

/// Streams points to QuestDB over ILP/TCP.
///
/// `write` hands the point to a single background task that batches by size
/// and by flush interval; `close` drains the buffer and shuts the socket.
pub struct QuestDbIlpWriter {
    tx: Mutex<Option<mpsc::Sender<Point>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QuestDbIlpWriter {
    /// Connects eagerly so that an unreachable backend fails startup.
    pub async fn connect(addr: SocketAddr, options: IlpWriterOptions) -> Result<Self, BridgeError> {
        let stream = connect(addr).await?;
        tracing::info!(%addr, batch_size = options.batch_size, "connected to QuestDB ILP");

        let (tx, rx) = mpsc::channel(options.batch_size.max(1).saturating_mul(2));
        let worker = IlpWorker {
            addr,
            options,
            stream,
        };
        let handle = tokio::spawn(worker.run(rx));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait::async_trait]
impl PointWriter for QuestDbIlpWriter {
    async fn write(&self, point: Point) -> Result<(), BridgeError> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| BridgeError::Storage("ILP writer is closed".to_string()))?;

        tx.send(point)
            .await
            .map_err(|_| BridgeError::Storage("ILP worker channel closed".to_string()))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        // Dropping the last sender lets the worker drain and exit.
        drop(self.tx.lock().await.take());

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| BridgeError::Storage(format!("ILP worker join error: {e}")))?;
            tracing::info!("QuestDB ILP writer closed");
        }
        Ok(())
    }
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, BridgeError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| BridgeError::Storage(format!("failed to connect to QuestDB ILP: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

struct IlpWorker {
    addr: SocketAddr,
    options: IlpWriterOptions,
    stream: TcpStream,
}

impl IlpWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Point>) {
        let mut buffer: Vec<Point> = Vec::with_capacity(self.options.batch_size);
        let period = self.options.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(point) => {
                        buffer.push(point);
                        if buffer.len() >= self.options.batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }

        // Best-effort flush.
        let _ = self.stream.shutdown().await;
    }

    fn encode_batch(&self, batch: &[Point]) -> Vec<u8> {
        // Heuristic capacity: ~256 bytes per line.
        let mut s = String::with_capacity(batch.len().saturating_mul(256));
        for point in batch {
            if write_ilp_line(point, self.options.event_id, &mut s) {
                s.push('\n');
            } else {
                tracing::debug!(measurement = %point.measurement, "skipping point without fields");
            }
        }
        s.into_bytes()
    }

    /// Write failures never escape the worker: the batch is retried, then dropped.
    async fn flush(&mut self, batch: &mut Vec<Point>) {
        let payload = self.encode_batch(batch);
        let records = batch.len();
        batch.clear();

        if payload.is_empty() {
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.stream.write_all(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_records_total").increment(records as u64);
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);
                    return;
                }
                Err(e) if attempt < self.options.max_retries => {
                    attempt += 1;
                    let sleep_for = self.options.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "QuestDB ILP flush failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);

                    tokio::time::sleep(sleep_for).await;
                    match connect(self.addr).await {
                        Ok(stream) => self.stream = stream,
                        Err(e) => tracing::warn!(error = %e, attempt, "QuestDB ILP reconnect failed"),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, records, "QuestDB ILP flush failed, dropping batch");
                    metrics::counter!("questdb_ilp_sink_errors_total").increment(1);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::domain::{Reading, TIMESTAMP_KEY};
    use time::macros::datetime;
    use tokio::io::AsyncReadExt;

    fn sample_point() -> Point {
        let mut p = Point::new("live_data");
        p.timestamp = Some(datetime!(2024-01-01 00:00:00 UTC));
        p.tags.insert("currency".to_string(), "NOK".to_string());
        p.fields.insert("power".to_string(), FieldValue::Float(1250.5));
        p.fields.insert("online".to_string(), FieldValue::Bool(true));
        p
    }

    #[test]
    fn ilp_escape_ident_escapes_commas_spaces_and_equals() {
        let mut out = String::new();
        ilp_escape_ident("a b,c=d", &mut out);
        assert_eq!(out, "a\\ b\\,c\\=d");
    }

    #[test]
    fn string_fields_are_quoted_and_escaped() {
        let mut out = String::new();
        ilp_escape_string("say \"hi\" \\o/", &mut out);
        assert_eq!(out, "\"say \\\"hi\\\" \\\\o/\"");
    }

    #[test]
    fn line_has_tags_typed_fields_and_nanosecond_timestamp() {
        let point = sample_point();
        let mut line = String::new();

        assert!(write_ilp_line(&point, false, &mut line));

        assert_eq!(
            line,
            format!(
                "live_data,currency=NOK online=t,power=1250.5 {}",
                datetime!(2024-01-01 00:00:00 UTC).unix_timestamp_nanos()
            )
        );
    }

    #[test]
    fn integral_floats_have_no_integer_suffix() {
        let mut point = sample_point();
        point.fields.insert("powerL1".to_string(), FieldValue::Float(2300.0));
        let mut line = String::new();
        write_ilp_line(&point, false, &mut line);
        assert!(line.contains("powerL1=2300"));
        assert!(!line.contains("powerL1=2300i"));
    }

    #[test]
    fn event_id_is_deterministic_and_content_sensitive() {
        let a = sample_point();
        let mut b = sample_point();
        assert_eq!(event_id(&a), event_id(&b));

        b.fields.insert("power".to_string(), FieldValue::Float(1.0));
        assert_ne!(event_id(&a), event_id(&b));

        let mut line = String::new();
        write_ilp_line(&a, true, &mut line);
        assert!(line.starts_with(&format!("live_data,currency=NOK event_id=\"{}\",online=t", event_id(&a))));
    }

    #[test]
    fn default_options_never_emit_event_id_as_a_tag() {
        let point = sample_point();
        let mut line = String::new();
        write_ilp_line(&point, IlpWriterOptions::default().event_id, &mut line);

        let (series, _) = line.split_once(' ').unwrap();
        assert_eq!(series, "live_data,currency=NOK");
        assert!(line.contains(&format!("event_id=\"{}\"", event_id(&point))));
    }

    #[test]
    fn empty_tag_values_are_not_rendered() {
        let reading = Reading::new()
            .with(TIMESTAMP_KEY, "2024-01-01T00:00:00Z")
            .with("currency", "")
            .with("power", 1.0);
        let point = crate::transform::encode("live_data", &reading);
        let mut line = String::new();

        assert!(write_ilp_line(&point, false, &mut line));
        assert_eq!(
            line,
            format!("live_data power=1 {}", datetime!(2024-01-01 00:00:00 UTC).unix_timestamp_nanos())
        );
    }

    #[test]
    fn line_breaks_in_tags_become_escaped_spaces() {
        let mut out = String::new();
        ilp_escape_ident("north\nwing", &mut out);
        assert_eq!(out, "north\\ wing");
    }

    #[test]
    fn points_without_finite_fields_are_skipped() {
        let mut point = Point::new("live_data");
        point.tags.insert("currency".to_string(), "NOK".to_string());
        let mut line = String::new();
        assert!(!write_ilp_line(&point, false, &mut line));

        point.fields.insert("power".to_string(), FieldValue::Float(f64::NAN));
        assert!(!write_ilp_line(&point, false, &mut line));
        assert!(line.is_empty());
    }

    #[test]
    fn missing_timestamp_is_left_to_the_server() {
        let mut point = sample_point();
        point.timestamp = None;
        let mut line = String::new();
        write_ilp_line(&point, false, &mut line);
        assert!(line.ends_with("power=1250.5"));
    }

    #[tokio::test]
    async fn writer_flushes_buffered_points_on_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let options = IlpWriterOptions {
            event_id: false,
            ..IlpWriterOptions::default()
        };
        let writer = QuestDbIlpWriter::connect(addr, options).await.unwrap();
        writer.write(sample_point()).await.unwrap();
        writer.close().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.lines().count(), 1);
        assert!(received.starts_with("live_data,currency=NOK "));

        assert!(writer.write(sample_point()).await.is_err());
    }
}
