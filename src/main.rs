//! Log Forwarder - ships newline-delimited JSON logs to an ingest endpoint
//!
//! This service reads one JSON object per line from stdin, batches the
//! records, and delivers them gzip-compressed to the configured endpoint.
//!
//! ## Features
//!
//! - Count and time based batching
//! - Payload splitting under the endpoint's size ceiling
//! - Re-delivery of transient failures with exponential backoff
//! - Final flush on EOF or SIGINT, bounded by a shutdown timeout
//!
//! ## Configuration
//!
//! Configuration is loaded from `LOG_FORWARDER_*` environment variables, see
//! [`log_forwarder::config`]. `SOURCE` sets the `plugin.source` attribute and
//! `RUST_LOG` the logging level filter (default: info).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_forwarder::buffer::{BatchAccumulator, PendingFlush};
use log_forwarder::client::DeliveryClient;
use log_forwarder::config::PluginConfig;
use log_forwarder::metrics::{self, MetricsSink, NoopMetrics, SummaryAggregator};
use log_forwarder::packager::PayloadPackager;
use log_forwarder::record::Record;
use log_forwarder::retry::{deliver_with_retry, RetryPolicy};

/// How long the final flush may take before pending data is abandoned.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound for the idle flush ticker.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How often aggregated delivery metrics are logged.
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting log forwarder...");

    let config = match PluginConfig::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.client.endpoint,
                max_records = config.buffer.max_records,
                max_time_between_flushes_ms = config.buffer.max_time_between_flushes.as_millis() as u64,
                max_payload_size = config.buffer.max_payload_size,
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let aggregator = match metrics::new_aggregator(&config.client) {
        Ok(aggregator) => aggregator,
        Err(e) => {
            error!(error = %e, "Metrics reporting disabled");
            None
        }
    };
    let sink: Arc<dyn MetricsSink> = match &aggregator {
        Some(aggregator) => aggregator.clone(),
        None => Arc::new(NoopMetrics),
    };

    let client = match DeliveryClient::with_metrics(&config.client, &config.proxy, sink) {
        Ok(client) => {
            let packager = PayloadPackager::with_max_packet_size(config.buffer.max_payload_size);
            info!(endpoint = %client.endpoint(), "HTTP client initialized");
            Arc::new(client.with_packager(packager))
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let policy = RetryPolicy::new(config.max_retries);
    let flush_interval = config.buffer.max_time_between_flushes;
    let mut accumulator = BatchAccumulator::new(config.buffer, client);
    let source = std::env::var("SOURCE").ok();

    let mut deliveries = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Flushes are otherwise only considered when a record arrives
    let mut ticker = interval(flush_interval.max(MIN_TICK_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut metrics_ticker = interval(METRICS_REPORT_INTERVAL);
    metrics_ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Log forwarder running. Reading records from stdin.");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(record) = parse_line(&line, source.as_deref()) else {
                        continue;
                    };
                    if let Some(flush) = accumulator.add(record) {
                        spawn_delivery(&mut deliveries, flush, &policy);
                    }
                }
                Ok(None) => {
                    info!("Input closed, stopping...");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input, stopping...");
                    break;
                }
            },

            _ = ticker.tick() => {
                if !accumulator.is_empty() && accumulator.since_last_flush() >= flush_interval {
                    debug!(records = accumulator.len(), "Flushing idle batch");
                    spawn_delivery(&mut deliveries, accumulator.flush(), &policy);
                }
            }

            _ = metrics_ticker.tick(), if aggregator.is_some() => {
                report_metrics(aggregator.as_deref());
            }

            Some(joined) = deliveries.join_next() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Delivery task failed");
                }
            }

            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("Shutdown signal received, stopping..."),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    // Graceful shutdown: the final batch is delivered, not discarded
    info!("Initiating graceful shutdown...");
    if !accumulator.is_empty() {
        spawn_delivery(&mut deliveries, accumulator.flush(), &policy);
    }

    let drain = async {
        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Delivery task failed during shutdown");
            }
        }
    };
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
        Ok(()) => info!("All pending batches handled"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, abandoning pending batches"
        ),
    }

    report_metrics(aggregator.as_deref());
    info!("Log forwarder stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Log the delivery metrics aggregated since the last report.
fn report_metrics(aggregator: Option<&SummaryAggregator>) {
    if let Some(aggregator) = aggregator {
        let reported = aggregator.report();
        debug!(summaries = reported, "Delivery metrics reported");
    }
}

/// Deliver a flush in the background, retrying transient failures.
fn spawn_delivery(deliveries: &mut JoinSet<()>, flush: PendingFlush, policy: &RetryPolicy) {
    let policy = policy.clone();
    deliveries.spawn(async move {
        match deliver_with_retry(&flush, &policy).await {
            Ok(report) => debug!(
                flush_id = %flush.id(),
                records = report.records,
                dropped = report.dropped_records,
                "Delivery task finished"
            ),
            Err(e) => debug!(
                flush_id = %flush.id(),
                error = %e,
                records = flush.len(),
                "Delivery task gave up, batch lost"
            ),
        }
    });
}

/// Turn one input line into a record ready for delivery.
///
/// Blank lines are skipped; lines that are not JSON objects are logged and skipped.
fn parse_line(line: &str, source: Option<&str>) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Skipping line that is not valid JSON");
            return None;
        }
    };

    let Some(record) = Record::from_value(value) else {
        warn!("Skipping line that is not a JSON object");
        return None;
    };

    let record = record.remap(env!("CARGO_PKG_VERSION"), source);
    if record.get("timestamp").is_some() {
        Some(record)
    } else {
        Some(record.with("timestamp", Utc::now().timestamp_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_remaps_record() {
        let record = parse_line(r#"{"log":"hello","timestamp":1700000000}"#, Some("K8S")).unwrap();

        assert_eq!(record.get("message"), Some(&Value::from("hello")));
        assert!(record.get("log").is_none());
        assert_eq!(record.get("timestamp"), Some(&Value::from(1_700_000_000_000_i64)));
        assert_eq!(record.get("plugin").unwrap()["source"], Value::from("K8S"));
    }

    #[test]
    fn test_parse_line_adds_timestamp() {
        let before = Utc::now().timestamp_millis();
        let record = parse_line(r#"{"message":"no time"}"#, None).unwrap();
        let ts = record.get("timestamp").and_then(Value::as_i64).unwrap();
        assert!(ts >= before);
    }

    #[test]
    fn test_parse_line_skips_invalid_input() {
        assert!(parse_line("", None).is_none());
        assert!(parse_line("   ", None).is_none());
        assert!(parse_line("not json", None).is_none());
        assert!(parse_line("[1, 2, 3]", None).is_none());
    }

    #[tokio::test]
    async fn test_spawned_delivery_finishes_on_terminal_failure() {
        use log_forwarder::buffer::BufferConfig;
        use log_forwarder::config::{ClientConfig, Credential, ProxyConfig};

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/log/v1")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let config = ClientConfig::new(
            format!("{}/log/v1", server.url()),
            Credential::ApiKey("mock-api-key".to_string()),
        );
        let proxy = ProxyConfig {
            ignore_system_proxy: true,
            ..ProxyConfig::default()
        };
        let client = Arc::new(DeliveryClient::new(&config, &proxy).unwrap());
        let mut accumulator =
            BatchAccumulator::new(BufferConfig::new(1, Duration::from_secs(60)), client);
        let flush = accumulator.add(Record::new()).unwrap();

        let mut deliveries = JoinSet::new();
        spawn_delivery(&mut deliveries, flush, &RetryPolicy::new(3));

        let joined = deliveries.join_next().await.expect("one delivery task");
        assert!(joined.is_ok());
        assert!(deliveries.is_empty());
        mock.assert_async().await;
    }
}
