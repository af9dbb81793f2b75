//! Configuration module for the log forwarder.
//!
//! This module provides environment-based configuration: the ingest endpoint
//! and its credential, flush thresholds, proxy/TLS settings and metrics
//! reporting.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::buffer::BufferConfig;
use crate::packager::MAX_PACKET_SIZE;

/// Default ingest endpoint
const DEFAULT_ENDPOINT: &str = "https://log-api.newrelic.com/log/v1";

/// Default HTTP request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of records per flush
const DEFAULT_MAX_RECORDS: usize = 1024;

/// Default maximum age of pending records, in milliseconds
const DEFAULT_MAX_TIME_BETWEEN_FLUSHES_MS: u64 = 5000;

/// Default number of re-delivery attempts for retryable failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Credential used to authenticate against the ingest endpoint.
///
/// The two kinds are mutually exclusive; each maps to its own header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Insert (API) key, sent as `X-Insert-Key`
    ApiKey(String),

    /// License key, sent as `X-License-Key`
    LicenseKey(String),
}

impl Credential {
    /// Header name carrying this credential.
    pub fn header_name(&self) -> &'static str {
        match self {
            Credential::ApiKey(_) => "X-Insert-Key",
            Credential::LicenseKey(_) => "X-License-Key",
        }
    }

    /// The raw key.
    pub fn key(&self) -> &str {
        match self {
            Credential::ApiKey(key) | Credential::LicenseKey(key) => key,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credential::LicenseKey(_) => f.write_str("LicenseKey(<redacted>)"),
        }
    }
}

/// Settings for the delivery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ingest endpoint URL
    pub endpoint: String,

    /// Credential sent with every request
    pub credential: Credential,

    /// HTTP request timeout
    pub timeout: Duration,

    /// Whether delivery metrics are aggregated
    pub send_metrics: bool,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, credential: Credential) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            send_metrics: false,
        }
    }
}

/// Proxy and TLS settings used to build the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Skip `HTTPS_PROXY`/`HTTP_PROXY` discovery
    pub ignore_system_proxy: bool,

    /// Explicit proxy URL; takes precedence over the environment
    pub proxy: Option<String>,

    /// PEM file with extra root certificates
    pub ca_bundle_file: Option<PathBuf>,

    /// Directory of `*.pem` files with extra root certificates
    pub ca_bundle_dir: Option<PathBuf>,

    /// Validate the certificate of an HTTPS proxy. Disabling this enables the fallback dialer.
    pub validate_certs: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ignore_system_proxy: false,
            proxy: None,
            ca_bundle_file: None,
            ca_bundle_dir: None,
            validate_certs: true,
        }
    }
}

/// Complete forwarder configuration.
///
/// All settings can be configured via environment variables:
/// - `LOG_FORWARDER_ENDPOINT`: ingest URL (default: https://log-api.newrelic.com/log/v1)
/// - `LOG_FORWARDER_API_KEY` / `LOG_FORWARDER_LICENSE_KEY`: exactly one is required
/// - `LOG_FORWARDER_TIMEOUT_SECS`: request timeout (default: 5)
/// - `LOG_FORWARDER_MAX_RECORDS`: records per flush (default: 1024)
/// - `LOG_FORWARDER_MAX_TIME_BETWEEN_FLUSHES_MS`: max age of pending records (default: 5000)
/// - `LOG_FORWARDER_MAX_PAYLOAD_SIZE`: compressed payload ceiling (default: 1000000, larger values are clamped)
/// - `LOG_FORWARDER_MAX_RETRIES`: re-delivery attempts (default: 3)
/// - `LOG_FORWARDER_PROXY`, `LOG_FORWARDER_IGNORE_SYSTEM_PROXY`,
///   `LOG_FORWARDER_CA_BUNDLE_FILE`, `LOG_FORWARDER_CA_BUNDLE_DIR`,
///   `LOG_FORWARDER_VALIDATE_PROXY_CERTS`: transport settings
/// - `LOG_FORWARDER_SEND_METRICS`: aggregate delivery metrics (default: false)
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub client: ClientConfig,
    pub proxy: ProxyConfig,
    pub buffer: BufferConfig,

    /// Maximum number of re-delivery attempts for retryable failures
    pub max_retries: u32,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl PluginConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - neither or both of the API key and license key are set
    /// - a numeric variable is not a valid number or is out of bounds
    /// - a boolean variable is not `true` or `false`
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = non_empty_var("LOG_FORWARDER_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let credential = Self::parse_credential()?;

        let timeout = Duration::from_secs(parse_number(
            "LOG_FORWARDER_TIMEOUT_SECS",
            DEFAULT_TIMEOUT_SECS,
            1,
            3600,
        )?);

        let max_records = parse_number(
            "LOG_FORWARDER_MAX_RECORDS",
            DEFAULT_MAX_RECORDS,
            1,
            usize::MAX,
        )?;

        let max_time_between_flushes = Duration::from_millis(parse_number(
            "LOG_FORWARDER_MAX_TIME_BETWEEN_FLUSHES_MS",
            DEFAULT_MAX_TIME_BETWEEN_FLUSHES_MS,
            0,
            u64::MAX,
        )?);

        // The endpoint rejects anything larger, so bigger values are clamped
        let max_payload_size = parse_number(
            "LOG_FORWARDER_MAX_PAYLOAD_SIZE",
            MAX_PACKET_SIZE,
            1,
            usize::MAX,
        )?
        .min(MAX_PACKET_SIZE);

        let max_retries = parse_number("LOG_FORWARDER_MAX_RETRIES", DEFAULT_MAX_RETRIES, 0, 100)?;

        let proxy = ProxyConfig {
            ignore_system_proxy: parse_bool("LOG_FORWARDER_IGNORE_SYSTEM_PROXY", false)?,
            proxy: non_empty_var("LOG_FORWARDER_PROXY"),
            ca_bundle_file: non_empty_var("LOG_FORWARDER_CA_BUNDLE_FILE").map(PathBuf::from),
            ca_bundle_dir: non_empty_var("LOG_FORWARDER_CA_BUNDLE_DIR").map(PathBuf::from),
            validate_certs: parse_bool("LOG_FORWARDER_VALIDATE_PROXY_CERTS", true)?,
        };

        let send_metrics = parse_bool("LOG_FORWARDER_SEND_METRICS", false)?;

        Ok(Self {
            client: ClientConfig {
                endpoint,
                credential,
                timeout,
                send_metrics,
            },
            proxy,
            buffer: BufferConfig::new(max_records, max_time_between_flushes)
                .with_max_payload_size(max_payload_size),
            max_retries,
        })
    }

    /// Exactly one of the API key and the license key must be set.
    fn parse_credential() -> Result<Credential, ConfigError> {
        let api_key = non_empty_var("LOG_FORWARDER_API_KEY");
        let license_key = non_empty_var("LOG_FORWARDER_LICENSE_KEY");

        match (api_key, license_key) {
            (Some(key), None) => Ok(Credential::ApiKey(key)),
            (None, Some(key)) => Ok(Credential::LicenseKey(key)),
            (None, None) => Err(ConfigError {
                message: "either an API key or a license key must be specified".to_string(),
                env_var: None,
            }),
            (Some(_), Some(_)) => Err(ConfigError {
                message: "only one of API key or license key can be specified".to_string(),
                env_var: None,
            }),
        }
    }
}

fn non_empty_var(env_var: &str) -> Option<String> {
    env::var(env_var).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a numeric variable, falling back to `default` when unset.
fn parse_number<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(value) = non_empty_var(env_var) else {
        return Ok(default);
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(env_var) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::for_var(
                env_var,
                format!(
                    "invalid value for {}: {}. Valid values: true, false.",
                    env_var, value
                ),
            )),
        },
    }
}
