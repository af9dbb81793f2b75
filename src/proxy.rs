//! Proxy resolution and HTTP transport construction.
//!
//! [`ProxyResolver`] decides which proxy, if any, a request goes through:
//! an explicitly configured proxy wins, then `HTTPS_PROXY`/`HTTP_PROXY` from
//! the environment unless system proxies are ignored.
//!
//! [`build_transport`] wires the resolver into pooled `reqwest` clients and,
//! only when the proxy is `https` and proxy certificate validation was
//! explicitly disabled, adds the legacy fallback dialer. The fallback is a
//! small state machine ([`DialerState`]) that starts `Unknown` and pins one of
//! three connection modes. The mode is chosen by a TLS handshake with the
//! proxy itself before the first request, so failures further down the line
//! (e.g. the ingest endpoint's certificate inside the tunnel) never pick a mode:
//!
//! 1. the normal TLS handshake works: pin `Secure`
//! 2. the proxy certificate is signed by an unknown authority: retry with
//!    verification disabled and pin `InsecureSkipVerify`
//! 3. the proxy does not speak TLS at all: retry in plaintext and pin
//!    `PlaintextFallback`
//!
//! Any other handshake error leaves the state `Unknown`; the request then goes
//! out on the secure client and its error is returned unchanged.
//!
//! **WARNING**: modes 2 and 3 give up on authenticating the proxy. They exist
//! for proxies with self-signed certificates or plaintext listeners and are
//! never used unless the user opted out of proxy certificate validation.

use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Certificate, Client, ClientBuilder, Proxy, RequestBuilder, Response, Url};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProxyConfig;

/// TCP keep-alive interval for pooled connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(600);

/// How long idle pooled connections are kept.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle connections kept per host.
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Upper bound for establishing a connection, TLS handshake included.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors raised while building the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid proxy URL {url}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    #[error("can't parse the destination URL {url}: {reason}")]
    InvalidDestination { url: String, reason: String },

    #[error("can't read certificates from {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to configure TLS: {0}")]
    Tls(#[from] rustls::Error),
}

/// Decides which proxy a request goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyResolver {
    /// User-defined proxy, used for every request
    Explicit(Url),

    /// Proxy from `HTTPS_PROXY` / `HTTP_PROXY`, honoring `NO_PROXY`
    Environment,

    /// No proxy
    Direct,
}

impl ProxyResolver {
    /// Pick the resolution strategy.
    ///
    /// An explicit proxy takes precedence; otherwise the environment is used
    /// unless `ignore_system_proxy` is set.
    pub fn new(ignore_system_proxy: bool, explicit_proxy: Option<&str>) -> Result<Self, TransportError> {
        match explicit_proxy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(proxy) => Ok(ProxyResolver::Explicit(parse_proxy_url(proxy)?)),
            None if !ignore_system_proxy => Ok(ProxyResolver::Environment),
            None => Ok(ProxyResolver::Direct),
        }
    }

    /// Proxy to use for a request to `target`, or `None` for a direct connection.
    pub fn resolve(&self, target: &Url) -> Result<Option<Url>, TransportError> {
        match self {
            ProxyResolver::Explicit(url) => Ok(Some(url.clone())),
            ProxyResolver::Direct => Ok(None),
            ProxyResolver::Environment => proxy_from_environment(target),
        }
    }

    fn into_reqwest_proxy(self) -> Option<Proxy> {
        match self {
            ProxyResolver::Direct => None,
            resolver => Some(Proxy::custom(move |url| match resolver.resolve(url) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(error = %e, "Ignoring unusable proxy setting");
                    None
                }
            })),
        }
    }
}

/// Environment lookup, in the style of curl and Go's `ProxyFromEnvironment`.
fn proxy_from_environment(target: &Url) -> Result<Option<Url>, TransportError> {
    let value = match target.scheme() {
        "https" => env_any(&["HTTPS_PROXY", "https_proxy"]),
        "http" => env_any(&["HTTP_PROXY", "http_proxy"]),
        _ => None,
    };
    let Some(value) = value else {
        return Ok(None);
    };

    let host = target.host_str().unwrap_or_default();
    let no_proxy = env_any(&["NO_PROXY", "no_proxy"]).unwrap_or_default();
    if bypasses_proxy(host, &no_proxy) {
        return Ok(None);
    }

    parse_proxy_url(&value).map(Some)
}

fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

/// Whether a destination host skips the proxy: loopback hosts always do,
/// otherwise `NO_PROXY` entries are matched as exact hosts or domain suffixes.
fn bypasses_proxy(host: &str, no_proxy: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_loopback() {
            return true;
        }
    }

    no_proxy
        .split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let domain = entry.trim_start_matches('.');
            host == domain || host.ends_with(&format!(".{}", domain))
        })
}

/// Parse a proxy URL. A value without a scheme is treated as an `http` proxy.
fn parse_proxy_url(value: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidProxyUrl {
        url: value.to_string(),
        reason,
    };

    match Url::parse(value) {
        Ok(url) if url.has_host() => Ok(url),
        Ok(_) | Err(_) if !value.contains("://") => Url::parse(&format!("http://{}", value))
            .map_err(|e| invalid(e.to_string()))
            .and_then(|url| {
                if url.has_host() {
                    Ok(url)
                } else {
                    Err(invalid("missing host".to_string()))
                }
            }),
        Ok(_) => Err(invalid("missing host".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Connection mode selected by the fallback dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    /// No connection attempted yet
    Unknown,

    /// Normal, fully verified TLS
    Secure,

    /// TLS without certificate verification
    InsecureSkipVerify,

    /// The proxy is reached without TLS
    PlaintextFallback,
}

/// Classification of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFailure {
    /// Certificate signed by an unknown authority
    UnknownAuthority,

    /// The peer answered with something that is not a TLS record
    RecordHeader,

    Other,
}

impl DialerState {
    /// State after a successful attempt.
    pub fn on_success(self) -> Self {
        match self {
            DialerState::Unknown => DialerState::Secure,
            pinned => pinned,
        }
    }

    /// State to pin and retry with after a failed attempt, or `None` when the
    /// error must be returned as-is.
    pub fn on_failure(self, failure: DialFailure) -> Option<Self> {
        match (self, failure) {
            (DialerState::Unknown, DialFailure::UnknownAuthority) => {
                Some(DialerState::InsecureSkipVerify)
            }
            (DialerState::Unknown, DialFailure::RecordHeader) => Some(DialerState::PlaintextFallback),
            _ => None,
        }
    }
}

/// Find the TLS failure behind a request error, if any.
pub fn classify_dial_error(err: &(dyn StdError + 'static)) -> DialFailure {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return classify_tls_error(tls);
        }
        // io::Error::source skips a custom payload, and payloads nest
        // (hyper wraps the rustls io::Error in another io::Error)
        current = match e.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => e.source(),
        };
    }
    DialFailure::Other
}

fn classify_tls_error(err: &rustls::Error) -> DialFailure {
    match err {
        rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer) => {
            DialFailure::UnknownAuthority
        }
        rustls::Error::InvalidMessage(_) => DialFailure::RecordHeader,
        _ => DialFailure::Other,
    }
}

struct Fallback {
    state: Mutex<DialerState>,
    probe: ProxyProbe,
    insecure: Client,
    plaintext: Client,
}

impl Fallback {
    fn state(&self) -> DialerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pin(&self, state: DialerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Pick the connection mode with a handshake against the proxy and pin it.
    ///
    /// Returns `Unknown` when the handshake failed for any other reason.
    async fn select_mode(&self) -> DialerState {
        debug!(proxy = %self.probe.host, "Dialing proxy with the usual, secured configuration");
        let probe = self.probe.clone();
        let handshake = tokio::task::spawn_blocking(move || probe.handshake())
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));

        let state = DialerState::Unknown;
        let next = match handshake {
            Ok(()) => {
                debug!("Secured proxy configuration worked, defaulting to it");
                state.on_success()
            }
            Err(err) => match state.on_failure(classify_dial_error(&err)) {
                Some(next) => {
                    warn!(
                        error = %err,
                        mode = ?next,
                        "Secured proxy configuration failed, switching to fallback"
                    );
                    next
                }
                None => {
                    debug!(error = %err, "Proxy handshake failed, mode left undecided");
                    return state;
                }
            },
        };
        self.pin(next);
        next
    }
}

/// TLS handshake against the proxy host itself, outside of any request.
#[derive(Clone)]
struct ProxyProbe {
    host: String,
    port: u16,
    tls: Arc<rustls::ClientConfig>,
    timeout: Duration,
}

impl ProxyProbe {
    fn new(proxy_url: &Url, tls: Arc<rustls::ClientConfig>, timeout: Duration) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidProxyUrl {
            url: redact_proxy(proxy_url),
            reason: reason.to_string(),
        };
        let host = proxy_url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| invalid("missing host"))?;
        let port = proxy_url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self {
            host,
            port,
            tls,
            timeout,
        })
    }

    /// Blocking; run it off the async runtime.
    fn handshake(&self) -> io::Result<()> {
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "proxy host did not resolve"))?;

        let mut socket = TcpStream::connect_timeout(&addr, self.timeout)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;

        let mut conn = rustls::ClientConnection::new(Arc::clone(&self.tls), server_name)
            .map_err(io::Error::other)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut socket)?;
        }
        Ok(())
    }
}

/// Pooled HTTP transport with the proxy/TLS policy applied.
pub struct Transport {
    secure: Client,
    fallback: Option<Fallback>,
}

impl Transport {
    /// Send a request built by `build` on the client for the current mode.
    ///
    /// While the fallback mode is undecided, the proxy is probed first.
    pub async fn execute<F>(&self, build: F) -> Result<Response, reqwest::Error>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let Some(fallback) = &self.fallback else {
            return build(&self.secure).send().await;
        };

        let state = match fallback.state() {
            DialerState::Unknown => fallback.select_mode().await,
            pinned => pinned,
        };
        match state {
            DialerState::Unknown | DialerState::Secure => build(&self.secure).send().await,
            DialerState::InsecureSkipVerify => build(&fallback.insecure).send().await,
            DialerState::PlaintextFallback => build(&fallback.plaintext).send().await,
        }
    }

    /// Current fallback dialer mode, or `None` when the fallback is not in use.
    pub fn dialer_state(&self) -> Option<DialerState> {
        self.fallback.as_ref().map(Fallback::state)
    }
}

/// Build the transport used to reach `destination`.
pub fn build_transport(
    config: &ProxyConfig,
    destination: &str,
    timeout: Duration,
) -> Result<Transport, TransportError> {
    let resolver = ProxyResolver::new(config.ignore_system_proxy, config.proxy.as_deref())?;
    let destination_url = Url::parse(destination).map_err(|e| TransportError::InvalidDestination {
        url: destination.to_string(),
        reason: e.to_string(),
    })?;
    let extra_roots =
        load_ca_bundle(config.ca_bundle_file.as_deref(), config.ca_bundle_dir.as_deref())?;
    let roots = extra_roots
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>, _>>()?;

    let proxy_url = resolver.resolve(&destination_url)?;
    debug!(
        destination = %destination_url,
        proxy = ?proxy_url.as_ref().map(redact_proxy),
        "Resolved proxy for destination"
    );

    let mut builder = client_builder(timeout, &roots);
    if let Some(proxy) = resolver.into_reqwest_proxy() {
        builder = builder.proxy(proxy);
    }
    let secure = builder.build()?;

    let fallback = match proxy_url {
        Some(url) if url.scheme() == "https" && !config.validate_certs => {
            warn!(
                proxy = %redact_proxy(&url),
                "Proxy certificate validation is disabled, enabling fallback dialer"
            );
            let probe = ProxyProbe::new(&url, probe_tls_config(&extra_roots)?, timeout)?;
            Some(fallback_clients(url, probe, timeout, &roots)?)
        }
        _ => None,
    };

    Ok(Transport { secure, fallback })
}

fn fallback_clients(
    proxy_url: Url,
    probe: ProxyProbe,
    timeout: Duration,
    roots: &[Certificate],
) -> Result<Fallback, TransportError> {
    let mut plain_url = proxy_url.clone();
    plain_url
        .set_scheme("http")
        .map_err(|_| TransportError::InvalidProxyUrl {
            url: redact_proxy(&proxy_url),
            reason: "can't downgrade proxy scheme".to_string(),
        })?;

    let insecure = client_builder(timeout, roots)
        .proxy(Proxy::all(proxy_url)?)
        .danger_accept_invalid_certs(true)
        .build()?;
    let plaintext = client_builder(timeout, roots)
        .proxy(Proxy::all(plain_url)?)
        .build()?;

    Ok(Fallback {
        state: Mutex::new(DialerState::Unknown),
        probe,
        insecure,
        plaintext,
    })
}

fn client_builder(timeout: Duration, roots: &[Certificate]) -> ClientBuilder {
    let mut builder = Client::builder()
        .no_proxy()
        .timeout(timeout)
        .connect_timeout(HANDSHAKE_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT);
    for cert in roots {
        builder = builder.add_root_certificate(cert.clone());
    }
    builder
}

/// TLS settings for the proxy handshake: the same native roots the HTTP
/// clients trust, plus the configured CA bundles.
fn probe_tls_config(
    extra_roots: &[CertificateDer<'static>],
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        debug!(error = %e, "Failed to load a native root certificate");
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) =
        roots.add_parsable_certificates(native.certs.into_iter().chain(extra_roots.iter().cloned()));
    debug!(added, ignored, "Loaded root certificates for proxy handshake");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Proxy URL without credentials, for logging.
fn redact_proxy(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.to_string()
}

/// Load extra root certificates from a PEM bundle file and/or every `*.pem`
/// file in a directory.
///
/// Unreadable files are errors. Files without usable certificates are
/// skipped with a warning.
pub fn load_ca_bundle(
    file: Option<&Path>,
    dir: Option<&Path>,
) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut paths = Vec::new();
    if let Some(file) = file {
        paths.push(file.to_path_buf());
    }
    if let Some(dir) = dir {
        let entries = std::fs::read_dir(dir).map_err(|source| TransportError::CaBundle {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut pem_files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "pem"))
            .collect();
        pem_files.sort();
        paths.extend(pem_files);
    }

    let mut certificates = Vec::new();
    for path in paths {
        let pem = std::fs::read(&path).map_err(|source| TransportError::CaBundle {
            path: path.clone(),
            source,
        })?;
        match CertificateDer::pem_slice_iter(&pem).collect::<Result<Vec<_>, _>>() {
            Ok(certs) if !certs.is_empty() => {
                debug!(path = %path.display(), count = certs.len(), "Loaded CA certificates");
                certificates.extend(certs);
            }
            Ok(_) => warn!(path = %path.display(), "No certificates found, skipping"),
            Err(e) => warn!(path = %path.display(), error = ?e, "Certificates could not be appended"),
        }
    }
    Ok(certificates)
}
