//! HTTP delivery of packaged payloads to the ingest endpoint.
//!
//! The client owns the transport built by [`crate::proxy`], attaches the
//! credential header, posts each payload and classifies the result:
//!
//! - 2xx: accepted
//! - transport failures (DNS, connect, TLS, timeouts) and 408, 429, 500, 502,
//!   503, 504, 599: retryable
//! - any other status: terminal
//!
//! A batch stops at its first failed payload. Nothing is remembered about the
//! payloads that already went through, so a caller that retries resends the
//! whole batch.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{ClientConfig, ProxyConfig};
use crate::metrics::{
    Dimensions, MetricsSink, NoopMetrics, PACKAGING_TIME, PAYLOAD_COUNT, PAYLOAD_SEND_TIME,
    PAYLOAD_SIZE, TOTAL_SEND_TIME,
};
use crate::packager::{Payload, PayloadPackager};
use crate::proxy::{build_transport, Transport, TransportError};
use crate::record::Record;

/// Status codes worth retrying.
const RETRYABLE_STATUS_CODES: [u16; 7] = [408, 429, 500, 502, 503, 504, 599];

/// Errors that can occur while creating a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("building HTTP transport: {0}")]
    Transport(#[from] TransportError),

    #[error("credential is not a valid header value")]
    InvalidCredential,
}

/// Why a payload was not accepted.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No HTTP response was received
    #[error("HTTP request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The endpoint answered with a non-2xx status
    #[error("received non-2XX HTTP status code: {0}")]
    Status(StatusCode),
}

impl DeliveryError {
    /// Whether resending the same data later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(_) => true,
            DeliveryError::Status(status) => is_status_retryable(*status),
        }
    }

    /// Status code used as a metric dimension; 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryError::Transport(_) => 0,
            DeliveryError::Status(status) => status.as_u16(),
        }
    }
}

/// Result of sending one payload.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Accepted(StatusCode),
    Retryable(DeliveryError),
    Terminal(DeliveryError),
}

impl DeliveryOutcome {
    fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            DeliveryOutcome::Accepted(status)
        } else {
            Self::from_error(DeliveryError::Status(status))
        }
    }

    fn from_error(error: DeliveryError) -> Self {
        if error.is_retryable() {
            DeliveryOutcome::Retryable(error)
        } else {
            DeliveryOutcome::Terminal(error)
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryOutcome::Accepted(status) => status.as_u16(),
            DeliveryOutcome::Retryable(e) | DeliveryOutcome::Terminal(e) => e.status_code(),
        }
    }

    /// Convert into a `Result`, keeping the failure cause.
    pub fn into_result(self) -> Result<StatusCode, DeliveryError> {
        match self {
            DeliveryOutcome::Accepted(status) => Ok(status),
            DeliveryOutcome::Retryable(e) | DeliveryOutcome::Terminal(e) => Err(e),
        }
    }
}

/// Check whether a status code is in the retryable set.
pub fn is_status_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status.as_u16())
}

/// Summary of a fully delivered batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records delivered
    pub records: usize,

    /// Payloads (HTTP requests) used
    pub payloads: usize,

    /// Records dropped during packaging
    pub dropped_records: usize,
}

/// Outcome of packaging and delivering one batch.
pub type FlushResult = Result<FlushReport, DeliveryError>;

/// HTTP client delivering payloads to the ingest endpoint.
///
/// The underlying connection pool is reused across sends.
pub struct DeliveryClient {
    transport: Transport,
    endpoint: String,
    auth_header: (HeaderName, HeaderValue),
    packager: PayloadPackager,
    metrics: Arc<dyn MetricsSink>,
}

impl DeliveryClient {
    /// Create a client without metrics reporting.
    pub fn new(config: &ClientConfig, proxy: &ProxyConfig) -> Result<Self, ClientError> {
        Self::with_metrics(config, proxy, Arc::new(NoopMetrics))
    }

    /// Create a client reporting to the given metrics sink.
    pub fn with_metrics(
        config: &ClientConfig,
        proxy: &ProxyConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        let transport = build_transport(proxy, &config.endpoint, config.timeout)?;

        let mut key = HeaderValue::from_str(config.credential.key())
            .map_err(|_| ClientError::InvalidCredential)?;
        key.set_sensitive(true);
        let name = HeaderName::from_bytes(config.credential.header_name().as_bytes())
            .map_err(|_| ClientError::InvalidCredential)?;
        let auth_header = (name, key);

        Ok(Self {
            transport,
            endpoint: config.endpoint.clone(),
            auth_header,
            packager: PayloadPackager::new(),
            metrics,
        })
    }

    /// Replace the packager, e.g. to lower the payload ceiling.
    pub fn with_packager(mut self, packager: PayloadPackager) -> Self {
        self.packager = packager;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn packager(&self) -> &PayloadPackager {
        &self.packager
    }

    /// Current proxy fallback dialer mode, if the fallback is active.
    pub fn dialer_state(&self) -> Option<crate::proxy::DialerState> {
        self.transport.dialer_state()
    }

    /// Package a batch and deliver every payload in order.
    ///
    /// Records dropped by the packager are reported in the returned
    /// [`FlushReport`]; they are never retried.
    pub async fn send_records(&self, records: &[Record]) -> FlushResult {
        let packaging_start = Instant::now();
        let packaged = self.packager.package(records);
        self.metrics
            .record_duration(PACKAGING_TIME, &Dimensions::new(), packaging_start.elapsed());

        if packaged.dropped_records > 0 {
            warn!(
                dropped = packaged.dropped_records,
                total = records.len(),
                "Some records could not be packaged and were discarded"
            );
        }

        let payloads = self.send_batch(&packaged.payloads).await?;
        Ok(FlushReport {
            records: packaged.record_count(),
            payloads,
            dropped_records: packaged.dropped_records,
        })
    }

    /// Send payloads in order, stopping at the first one not accepted.
    ///
    /// Returns the number of payloads sent. On failure,
    /// [`DeliveryError::is_retryable`] tells whether the caller should resend
    /// the whole batch later.
    pub async fn send_batch(&self, payloads: &[Payload]) -> Result<usize, DeliveryError> {
        let batch_start = Instant::now();

        for (index, payload) in payloads.iter().enumerate() {
            let send_start = Instant::now();
            let outcome = self.send(payload).await;
            let send_time = send_start.elapsed();

            let dimensions = payload_dimensions(&outcome);
            self.metrics
                .record_duration(PAYLOAD_SEND_TIME, &dimensions, send_time);
            self.metrics
                .record_value(PAYLOAD_SIZE, &dimensions, payload.len() as f64);

            match outcome {
                DeliveryOutcome::Accepted(status) => {
                    debug!(
                        payload = index,
                        status = status.as_u16(),
                        bytes = payload.len(),
                        records = payload.record_count(),
                        elapsed_ms = send_time.as_millis() as u64,
                        "Payload accepted"
                    );
                }
                DeliveryOutcome::Retryable(e) => {
                    warn!(
                        error = %e,
                        payload = index,
                        payloads = payloads.len(),
                        "Retryable error sending payload"
                    );
                    return Err(e);
                }
                DeliveryOutcome::Terminal(e) => {
                    error!(
                        error = %e,
                        payload = index,
                        payloads = payloads.len(),
                        "Non-retryable error sending payload"
                    );
                    return Err(e);
                }
            }
        }

        self.metrics
            .record_duration(TOTAL_SEND_TIME, &Dimensions::new(), batch_start.elapsed());
        self.metrics
            .record_value(PAYLOAD_COUNT, &Dimensions::new(), payloads.len() as f64);

        Ok(payloads.len())
    }

    /// POST a single payload and classify the outcome.
    pub async fn send(&self, payload: &Payload) -> DeliveryOutcome {
        let (auth_name, auth_value) = &self.auth_header;
        let result = self
            .transport
            .execute(|client| {
                client
                    .post(&self.endpoint)
                    .header(auth_name.clone(), auth_value.clone())
                    .header(CONTENT_ENCODING, "gzip")
                    .header(CONTENT_TYPE, "application/json")
                    .body(payload.data().clone())
            })
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                // Drain the body so the connection can go back to the pool
                if let Err(e) = response.bytes().await {
                    debug!(error = %e, "Failed to drain response body");
                }
                DeliveryOutcome::from_status(status)
            }
            Err(e) => DeliveryOutcome::from_error(DeliveryError::Transport(e)),
        }
    }
}

fn payload_dimensions(outcome: &DeliveryOutcome) -> Dimensions {
    let mut dimensions = Dimensions::new();
    dimensions.insert("statusCode", Value::from(outcome.status_code()));
    dimensions.insert("hasError", Value::from(!outcome.is_accepted()));
    dimensions
}
