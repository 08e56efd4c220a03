//! Streaming CSV downloads.
//!
//! A producer task owns the database cursor and the CSV encoder; the HTTP
//! response consumes from a bounded single-slot channel, so peak memory is
//! one batch in flight plus one batch buffered regardless of client speed.
//! The header row always precedes data, and a `"Number of rows: <N>"`
//! trailer always precedes clean stream end; a truncated stream with no
//! trailer is the canonical signal of an aborted download.

pub mod csv;
pub mod pg_source;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub use csv::Field;

/// One output column: its name and whether values are written unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub numeric: bool,
}

/// Totals for the unfiltered variant of a download query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnfilteredStats {
    pub row_count: u64,
    pub column_count: u64,
}

/// A batched row producer. The production implementation is a server-side
/// Postgres cursor; tests substitute scripted sources.
#[async_trait]
pub trait RowSource: Send {
    /// Column descriptions for the filtered query.
    async fn columns(&mut self) -> Result<Vec<ColumnDesc>>;

    /// The next batch of at most `n` rows; empty means exhausted.
    async fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Field>>>;

    /// Closes the cursor and ends the transaction.
    async fn finish(&mut self) -> Result<()>;

    /// Totals for the unfiltered query, if one was supplied. Must only be
    /// called after [`finish`](Self::finish) so the connection never runs
    /// two cursors at once.
    async fn unfiltered_stats(&mut self) -> Result<Option<UnfilteredStats>>;
}

/// What the metrics callback receives once the download completes.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetrics {
    pub bytes_downloaded: u64,
    pub column_count: u64,
    pub column_count_filtered: u64,
    pub download_time_in_seconds: f64,
    pub row_count: u64,
    pub row_count_filtered: u64,
}

pub type MetricsCallback = Box<dyn FnOnce(StreamMetrics) + Send + Sync>;

pub struct StreamOptions {
    pub principal_email: String,
    pub database: String,
    pub sql_digest: String,
    pub batch_size: usize,
    /// Per-put timeout; a consumer stalled longer than this aborts the
    /// producer. Matches the statement timeout.
    pub put_timeout: Duration,
    pub metrics: Option<MetricsCallback>,
}

/// Spawns the producer task and returns the byte stream for the response
/// body. Errors after the first byte arrive as an `Err` item, truncating
/// the stream without a trailer.
pub fn spawn_download(
    source: Box<dyn RowSource>,
    options: StreamOptions,
) -> ReceiverStream<Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes>>(1);
    tokio::spawn(run_producer(source, options, tx));
    ReceiverStream::new(rx)
}

async fn run_producer(
    mut source: Box<dyn RowSource>,
    options: StreamOptions,
    tx: mpsc::Sender<Result<Bytes>>,
) {
    info!(
        principal_email = %options.principal_email,
        database = %options.database,
        sql_digest = %options.sql_digest,
        "download started"
    );

    match produce(source.as_mut(), &options, &tx).await {
        Ok(metrics) => {
            info!(
                principal_email = %options.principal_email,
                database = %options.database,
                sql_digest = %options.sql_digest,
                duration_ms = (metrics.download_time_in_seconds * 1000.0) as u64,
                rows = metrics.row_count_filtered,
                bytes = metrics.bytes_downloaded,
                "download finished"
            );
            if let Some(callback) = options.metrics {
                callback(metrics);
            }
        }
        Err(e) => {
            warn!(
                principal_email = %options.principal_email,
                database = %options.database,
                sql_digest = %options.sql_digest,
                "download aborted: {e}"
            );
            // Close the cursor before reporting; the send fails harmlessly
            // when the consumer is already gone.
            if let Err(close_err) = source.finish().await {
                warn!("cursor cleanup failed: {close_err}");
            }
            // The slot may still hold an undelivered chunk; wait for it so
            // the error carrier is never dropped on the floor.
            let _ = tokio::time::timeout(options.put_timeout, tx.send(Err(e))).await;
        }
    }
}

async fn produce(
    source: &mut dyn RowSource,
    options: &StreamOptions,
    tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<StreamMetrics> {
    let started = Instant::now();
    let mut bytes_downloaded: u64 = 0;
    let mut row_count_filtered: u64 = 0;

    let columns = source.columns().await?;
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut buf = Vec::new();
    csv::write_header(&mut buf, &names);
    bytes_downloaded += buf.len() as u64;
    put(tx, buf, options.put_timeout).await?;

    loop {
        let batch = source.fetch(options.batch_size).await?;
        if batch.is_empty() {
            break;
        }
        let mut buf = Vec::new();
        for row in &batch {
            csv::write_row(&mut buf, row);
        }
        row_count_filtered += batch.len() as u64;
        bytes_downloaded += buf.len() as u64;
        put(tx, buf, options.put_timeout).await?;
    }

    let mut buf = Vec::new();
    csv::write_row(
        &mut buf,
        &[Field::Text(format!("Number of rows: {row_count_filtered}"))],
    );
    bytes_downloaded += buf.len() as u64;
    put(tx, buf, options.put_timeout).await?;

    // The filtered cursor closes before the unfiltered queries run so the
    // connection never has two result sets open.
    source.finish().await?;
    let stats = source.unfiltered_stats().await?;

    let column_count_filtered = names.len() as u64;
    let (row_count, column_count) = match stats {
        Some(stats) => (stats.row_count, stats.column_count),
        None => (row_count_filtered, column_count_filtered),
    };

    Ok(StreamMetrics {
        bytes_downloaded,
        column_count,
        column_count_filtered,
        download_time_in_seconds: started.elapsed().as_secs_f64(),
        row_count,
        row_count_filtered,
    })
}

async fn put(
    tx: &mpsc::Sender<Result<Bytes>>,
    buf: Vec<u8>,
    put_timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(put_timeout, tx.send(Ok(Bytes::from(buf)))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(Error::StreamAborted("client disconnected".to_string())),
        Err(_) => Err(Error::StreamAborted(format!(
            "consumer stalled for more than {}ms",
            put_timeout.as_millis()
        ))),
    }
}
