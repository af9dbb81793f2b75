//! Buffer module for accumulating records into flush-worthy batches.
//!
//! [`BatchAccumulator`] holds pending records and decides when a flush is due,
//! either because enough records piled up or because too much time passed
//! since the last flush. The time threshold is only checked when a record is
//! added; there is no background timer. Hosts that need bounded latency while
//! idle must call [`BatchAccumulator::flush`] themselves.
//!
//! A flush snapshots the pending records into a [`PendingFlush`] and clears the
//! buffer, so new records can be added while the snapshot is being delivered.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{DeliveryClient, FlushResult};
use crate::record::Record;

/// Thresholds that decide when a batch is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of records that triggers a flush
    pub max_records: usize,

    /// Age of the oldest unflushed period that triggers a flush
    pub max_time_between_flushes: Duration,

    /// Compressed payload ceiling handed to the packager
    pub max_payload_size: usize,
}

impl BufferConfig {
    /// Create a config with the given thresholds and the protocol payload ceiling.
    pub fn new(max_records: usize, max_time_between_flushes: Duration) -> Self {
        Self {
            max_records,
            max_time_between_flushes,
            max_payload_size: crate::packager::MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }
}

/// A batch snapshot that has been taken out of the accumulator but not yet
/// delivered.
///
/// Awaiting it (or calling [`PendingFlush::deliver`]) packages and sends the
/// batch. `deliver` can be called again after a retryable failure.
pub struct PendingFlush {
    id: Uuid,
    batch: Vec<Record>,
    client: Arc<DeliveryClient>,
}

impl PendingFlush {
    /// Identifier used to correlate log lines of one flush.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn batch(&self) -> &[Record] {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Package and send the batch.
    pub async fn deliver(&self) -> FlushResult {
        let result = self.client.send_records(&self.batch).await;
        match &result {
            Ok(report) => debug!(
                flush_id = %self.id,
                records = report.records,
                payloads = report.payloads,
                dropped = report.dropped_records,
                "Flush delivered"
            ),
            Err(e) => debug!(
                flush_id = %self.id,
                records = self.batch.len(),
                retryable = e.is_retryable(),
                "Flush failed"
            ),
        }
        result
    }
}

impl IntoFuture for PendingFlush {
    type Output = FlushResult;
    type IntoFuture = Pin<Box<dyn Future<Output = FlushResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.deliver().await })
    }
}

impl std::fmt::Debug for PendingFlush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFlush")
            .field("id", &self.id)
            .field("records", &self.batch.len())
            .finish()
    }
}

/// Accumulates records and hands out batches when a flush is due.
///
/// Mutation goes through `&mut self`, so one owner drives it. Hosts sharing
/// an accumulator across tasks wrap it in a mutex.
pub struct BatchAccumulator {
    /// Records waiting for the next flush
    pending: Vec<Record>,

    /// When the last flush (triggered or forced) happened
    last_flush: Instant,

    config: BufferConfig,

    client: Arc<DeliveryClient>,
}

impl BatchAccumulator {
    /// Create an accumulator delivering through `client`.
    pub fn new(config: BufferConfig, client: Arc<DeliveryClient>) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            config,
            client,
        }
    }

    /// Add a record, returning the batch to deliver if a flush is now due.
    pub fn add(&mut self, record: Record) -> Option<PendingFlush> {
        self.pending.push(record);

        if !self.should_flush() {
            return None;
        }

        debug!(
            records = self.pending.len(),
            since_last_flush_ms = self.last_flush.elapsed().as_millis() as u64,
            "Flush threshold reached"
        );
        Some(self.flush())
    }

    /// Whether the pending records should be flushed now.
    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.config.max_records
            || self.last_flush.elapsed() > self.config.max_time_between_flushes
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Time since the last flush.
    pub fn since_last_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Snapshot and clear the pending records regardless of thresholds.
    ///
    /// The flush timer is reset exactly as for a triggered flush.
    pub fn flush(&mut self) -> PendingFlush {
        let batch = std::mem::take(&mut self.pending);
        self.last_flush = Instant::now();

        let flush = PendingFlush {
            id: Uuid::new_v4(),
            batch,
            client: Arc::clone(&self.client),
        };
        info!(flush_id = %flush.id, records = flush.len(), "Flushing batch");
        flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Credential, ProxyConfig};

    fn test_client() -> Arc<DeliveryClient> {
        let config = ClientConfig::new(
            "http://127.0.0.1:9/log/v1",
            Credential::ApiKey("test-key".to_string()),
        );
        let proxy = ProxyConfig {
            ignore_system_proxy: true,
            ..ProxyConfig::default()
        };
        Arc::new(DeliveryClient::new(&config, &proxy).unwrap())
    }

    fn accumulator(max_records: usize, max_time: Duration) -> BatchAccumulator {
        BatchAccumulator::new(BufferConfig::new(max_records, max_time), test_client())
    }

    #[tokio::test]
    async fn test_count_trigger() {
        let mut acc = accumulator(3, Duration::from_secs(60));

        assert!(acc.add(Record::new().with("n", 1)).is_none());
        assert!(acc.add(Record::new().with("n", 2)).is_none());
        assert_eq!(acc.len(), 2);

        let flush = acc.add(Record::new().with("n", 3)).expect("third record should flush");
        assert_eq!(flush.len(), 3);
        assert_eq!(flush.batch()[2].get("n"), Some(&serde_json::json!(3)));

        assert!(acc.is_empty());
        assert!(!acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_is_lazy() {
        let mut acc = accumulator(usize::MAX, Duration::from_millis(1000));

        assert!(acc.add(Record::new()).is_none());
        tokio::time::advance(Duration::from_secs(2)).await;

        // Nothing happens until the next record arrives
        assert_eq!(acc.len(), 1);
        assert!(acc.should_flush());

        let flush = acc.add(Record::new()).expect("elapsed time should flush");
        assert_eq!(flush.len(), 2);
        assert!(acc.is_empty());
        assert!(!acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_threshold_is_strict() {
        let mut acc = accumulator(usize::MAX, Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(acc.add(Record::new()).is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_flush_resets_timer() {
        let mut acc = accumulator(usize::MAX, Duration::from_millis(1000));
        acc.add(Record::new());

        tokio::time::advance(Duration::from_millis(900)).await;
        let flush = acc.flush();
        assert_eq!(flush.len(), 1);
        assert!(acc.is_empty());

        // Timer restarted at the forced flush
        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(acc.add(Record::new()).is_none());
        assert_eq!(acc.since_last_flush(), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_forced_flush_of_empty_accumulator() {
        let mut acc = accumulator(10, Duration::from_secs(5));
        assert!(acc.is_empty());

        let flush = acc.flush();
        assert!(flush.is_empty());

        let report = flush.await.unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(report.payloads, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_decoupled_from_pending() {
        let mut acc = accumulator(2, Duration::from_secs(60));
        acc.add(Record::new().with("n", 1));
        let flush = acc.add(Record::new().with("n", 2)).unwrap();

        acc.add(Record::new().with("n", 3));
        assert_eq!(flush.len(), 2);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_buffer_config() {
        let config = BufferConfig::new(5, Duration::from_millis(250)).with_max_payload_size(1234);
        assert_eq!(config.max_records, 5);
        assert_eq!(config.max_time_between_flushes, Duration::from_millis(250));
        assert_eq!(config.max_payload_size, 1234);
    }
}
