//! Summary metrics emitted by the delivery client.
//!
//! The client only talks to the [`MetricsSink`] trait. [`NoopMetrics`] is the
//! drop-in default when reporting is disabled; [`SummaryAggregator`] keeps
//! in-memory summaries (count, sum, min, max) per metric name and dimensions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::ClientConfig;

/// Time spent serializing and compressing a batch.
pub const PACKAGING_TIME: &str = "logs.forwarder.packaging.time";
/// Time spent sending one payload.
pub const PAYLOAD_SEND_TIME: &str = "logs.forwarder.payload.send.time";
/// Compressed size of one payload.
pub const PAYLOAD_SIZE: &str = "logs.forwarder.payload.size";
/// Time spent sending all payloads of a batch.
pub const TOTAL_SEND_TIME: &str = "logs.forwarder.total.send.time";
/// Number of payloads a batch was split into.
pub const PAYLOAD_COUNT: &str = "logs.forwarder.payload.count";

const LOGS_US_PROD_URL: &str = "https://log-api.newrelic.com/log/v1";
const LOGS_EU_PROD_URL: &str = "https://log-api.eu.newrelic.com/log/v1";
const LOGS_STAGING_URL: &str = "https://staging-log-api.newrelic.com/log/v1";
const METRICS_US_PROD_URL: &str = "https://metric-api.newrelic.com/metric/v1";
const METRICS_EU_PROD_URL: &str = "https://metric-api.eu.newrelic.com/metric/v1";
const METRICS_STAGING_URL: &str = "https://staging-metric-api.newrelic.com/metric/v1";

/// Metric dimensions. Values are JSON scalars so numeric tags stay numeric.
pub type Dimensions = BTreeMap<&'static str, Value>;

/// Destination for summary metrics.
///
/// Implementations must not block and must not fail; metrics are best-effort.
pub trait MetricsSink: Send + Sync {
    fn record_duration(&self, name: &str, dimensions: &Dimensions, duration: Duration);

    fn record_value(&self, name: &str, dimensions: &Dimensions, value: f64);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_duration(&self, _name: &str, _dimensions: &Dimensions, _duration: Duration) {}

    fn record_value(&self, _name: &str, _dimensions: &Dimensions, _value: f64) {}
}

/// Running summary of recorded values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Identity of one summary: metric name plus its dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SummaryKey {
    pub name: String,
    pub dimensions: String,
}

impl fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.dimensions)
    }
}

/// In-memory summary aggregator.
///
/// Durations are recorded in milliseconds.
#[derive(Debug, Default)]
pub struct SummaryAggregator {
    metrics_url: Option<String>,
    summaries: Mutex<HashMap<SummaryKey, Summary>>,
}

impl SummaryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_endpoint(metrics_url: &str) -> Self {
        Self {
            metrics_url: Some(metrics_url.to_string()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    /// Metrics endpoint matching the configured logs endpoint, if known.
    pub fn metrics_url(&self) -> Option<&str> {
        self.metrics_url.as_deref()
    }

    /// Take all summaries recorded since the last harvest.
    pub fn harvest(&self) -> HashMap<SummaryKey, Summary> {
        let mut summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *summaries)
    }

    /// Harvest and log every summary, returning how many were reported.
    pub fn report(&self) -> usize {
        let summaries = self.harvest();
        for (key, summary) in &summaries {
            info!(
                metric = %key.name,
                dimensions = %key.dimensions,
                count = summary.count,
                sum = summary.sum,
                min = summary.min,
                max = summary.max,
                metrics_url = self.metrics_url().unwrap_or_default(),
                "Delivery metric summary"
            );
        }
        summaries.len()
    }

    /// Look up a single summary without resetting it.
    pub fn summary(&self, name: &str, dimensions: &Dimensions) -> Option<Summary> {
        let summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        summaries.get(&summary_key(name, dimensions)).copied()
    }

    fn record(&self, name: &str, dimensions: &Dimensions, value: f64) {
        let key = summary_key(name, dimensions);
        let mut summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        summaries
            .entry(key)
            .and_modify(|s| s.record(value))
            .or_insert_with(|| Summary::new(value));
    }
}

impl MetricsSink for SummaryAggregator {
    fn record_duration(&self, name: &str, dimensions: &Dimensions, duration: Duration) {
        self.record(name, dimensions, duration.as_secs_f64() * 1000.0);
    }

    fn record_value(&self, name: &str, dimensions: &Dimensions, value: f64) {
        self.record(name, dimensions, value);
    }
}

fn summary_key(name: &str, dimensions: &Dimensions) -> SummaryKey {
    // BTreeMap serializes with sorted keys, so equal dimension sets map to equal strings.
    let dimensions = serde_json::to_string(dimensions).unwrap_or_default();
    SummaryKey {
        name: name.to_string(),
        dimensions,
    }
}

/// Errors raised while selecting a metrics sink.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("no metrics endpoint can be inferred from the logs endpoint {0}")]
    UnknownEndpoint(String),
}

/// Pick the metrics sink for a client configuration.
///
/// Always returns a usable sink. When metrics are enabled but the logs
/// endpoint has no known metrics counterpart, the no-op sink is returned
/// together with an error for the caller to log.
pub fn new_sink(config: &ClientConfig) -> (Arc<dyn MetricsSink>, Option<MetricsError>) {
    match new_aggregator(config) {
        Ok(Some(aggregator)) => (aggregator, None),
        Ok(None) => (Arc::new(NoopMetrics), None),
        Err(e) => (Arc::new(NoopMetrics), Some(e)),
    }
}

/// The aggregator for a client configuration, or `None` when metrics are
/// disabled. Hosts keep this handle to report what was recorded.
pub fn new_aggregator(
    config: &ClientConfig,
) -> Result<Option<Arc<SummaryAggregator>>, MetricsError> {
    if !config.send_metrics {
        return Ok(None);
    }

    match metrics_url_for(&config.endpoint) {
        Some(url) => Ok(Some(Arc::new(SummaryAggregator::for_endpoint(url)))),
        None => Err(MetricsError::UnknownEndpoint(config.endpoint.clone())),
    }
}

fn metrics_url_for(logs_url: &str) -> Option<&'static str> {
    match logs_url {
        LOGS_US_PROD_URL => Some(METRICS_US_PROD_URL),
        LOGS_EU_PROD_URL => Some(METRICS_EU_PROD_URL),
        LOGS_STAGING_URL => Some(METRICS_STAGING_URL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;

    fn client_config(endpoint: &str, send_metrics: bool) -> ClientConfig {
        ClientConfig {
            endpoint: endpoint.to_string(),
            credential: Credential::LicenseKey("dummy".to_string()),
            timeout: Duration::from_secs(5),
            send_metrics,
        }
    }

    fn status_dims(code: u16) -> Dimensions {
        let mut dims = Dimensions::new();
        dims.insert("statusCode", Value::from(code));
        dims.insert("hasError", Value::from(false));
        dims
    }

    #[test]
    fn test_noop_when_disabled() {
        let (sink, err) = new_sink(&client_config("willBeIgnored", false));
        assert!(err.is_none());
        // Must accept anything silently
        sink.record_value(PAYLOAD_COUNT, &Dimensions::new(), 1.0);
        sink.record_duration(TOTAL_SEND_TIME, &Dimensions::new(), Duration::from_millis(3));
    }

    #[test]
    fn test_unknown_endpoint_with_metrics_enabled() {
        let (_sink, err) = new_sink(&client_config("invalidOnPurpose", true));
        let err = err.expect("expected an error for an unknown endpoint");
        assert!(err.to_string().contains("invalidOnPurpose"));
    }

    #[test]
    fn test_known_endpoint_with_metrics_enabled() {
        let (_sink, err) = new_sink(&client_config(LOGS_EU_PROD_URL, true));
        assert!(err.is_none());
        assert_eq!(metrics_url_for(LOGS_EU_PROD_URL), Some(METRICS_EU_PROD_URL));
    }

    #[test]
    fn test_aggregator_summarizes_per_dimensions() {
        let aggregator = SummaryAggregator::new();
        aggregator.record_value(PAYLOAD_SIZE, &status_dims(202), 100.0);
        aggregator.record_value(PAYLOAD_SIZE, &status_dims(202), 300.0);
        aggregator.record_value(PAYLOAD_SIZE, &status_dims(500), 50.0);

        let ok = aggregator.summary(PAYLOAD_SIZE, &status_dims(202)).unwrap();
        assert_eq!(ok.count, 2);
        assert_eq!(ok.sum, 400.0);
        assert_eq!(ok.min, 100.0);
        assert_eq!(ok.max, 300.0);

        let failed = aggregator.summary(PAYLOAD_SIZE, &status_dims(500)).unwrap();
        assert_eq!(failed.count, 1);
    }

    #[test]
    fn test_durations_recorded_in_millis() {
        let aggregator = SummaryAggregator::new();
        aggregator.record_duration(PACKAGING_TIME, &Dimensions::new(), Duration::from_millis(250));
        let summary = aggregator.summary(PACKAGING_TIME, &Dimensions::new()).unwrap();
        assert!((summary.sum - 250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregator_handle_follows_config() {
        assert!(new_aggregator(&client_config(LOGS_US_PROD_URL, false)).unwrap().is_none());

        let aggregator = new_aggregator(&client_config(LOGS_US_PROD_URL, true))
            .unwrap()
            .expect("metrics enabled");
        assert_eq!(aggregator.metrics_url(), Some(METRICS_US_PROD_URL));

        assert!(matches!(
            new_aggregator(&client_config("invalidOnPurpose", true)),
            Err(MetricsError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_report_drains_summaries() {
        let aggregator = SummaryAggregator::new();
        aggregator.record_value(PAYLOAD_SIZE, &status_dims(202), 10.0);
        aggregator.record_value(PAYLOAD_SIZE, &status_dims(500), 10.0);

        assert_eq!(aggregator.report(), 2);
        assert_eq!(aggregator.report(), 0);
    }

    #[test]
    fn test_harvest_resets() {
        let aggregator = SummaryAggregator::new();
        aggregator.record_value(PAYLOAD_COUNT, &Dimensions::new(), 2.0);
        assert_eq!(aggregator.harvest().len(), 1);
        assert!(aggregator.harvest().is_empty());
    }
}
