//! Log Forwarder Library
//!
//! This library provides the batch delivery engine that forwards structured
//! log records to a remote ingest endpoint:
//!
//! - **record**: Log records and their remapping before delivery
//! - **buffer**: Count and time based batching of records
//! - **packager**: JSON + gzip encoding split under the payload size ceiling
//! - **client**: Authenticated HTTP delivery and failure classification
//! - **proxy**: Proxy resolution, CA bundles and the fallback TLS dialer
//! - **metrics**: Summary metrics about packaging and delivery
//! - **retry**: Host-side re-delivery with exponential backoff
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use log_forwarder::buffer::BatchAccumulator;
//! use log_forwarder::client::DeliveryClient;
//! use log_forwarder::config::PluginConfig;
//! use log_forwarder::record::Record;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PluginConfig::from_env().expect("Failed to load config");
//!     let client = DeliveryClient::new(&config.client, &config.proxy)
//!         .expect("Failed to create client");
//!     let mut accumulator = BatchAccumulator::new(config.buffer, Arc::new(client));
//!
//!     let record = Record::new().with("message", "hello");
//!     if let Some(flush) = accumulator.add(record) {
//!         if let Err(e) = flush.await {
//!             eprintln!("retry later: {}", e.is_retryable());
//!         }
//!     }
//!
//!     // Drain on shutdown
//!     if !accumulator.is_empty() {
//!         accumulator.flush().await.ok();
//!     }
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod metrics;
pub mod packager;
pub mod proxy;
pub mod record;
pub mod retry;

pub use buffer::{BatchAccumulator, BufferConfig, PendingFlush};
pub use client::{
    ClientError, DeliveryClient, DeliveryError, DeliveryOutcome, FlushReport, FlushResult,
};
pub use config::{ClientConfig, ConfigError, Credential, PluginConfig, ProxyConfig};
pub use metrics::{MetricsSink, NoopMetrics, SummaryAggregator};
pub use packager::{Packaged, Payload, PayloadPackager, MAX_PACKET_SIZE};
pub use proxy::{DialerState, ProxyResolver, Transport, TransportError};
pub use record::Record;
pub use retry::{deliver_with_retry, RetryPolicy};
