// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking HTTP transport used to fetch image bytes.
//!
//! Downloads stream the response body into a caller-supplied sink and can
//! resume at a byte offset through a `Range` request. A server that answers
//! a ranged request with a full body (or refuses the range) is reported as
//! [`HttpError::RangeNotSupported`] so the caller can restart from zero.

use std::io::Read;
use std::ops::ControlFlow;
use std::time::Duration;

use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;

/// Size of the chunks handed to the sink.
const READ_CHUNK: usize = 64 * 1024;

/// Options governing how the HTTP client is constructed.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Whether plaintext (HTTP) URLs are allowed.
    pub allow_plaintext: bool,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
    pub connect_timeout: Duration,
    /// Whole-request timeout; `None` lets large images stream for as long as they need.
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            allow_plaintext: false,
            accept_invalid_certs: false,
            connect_timeout: Duration::from_secs(30),
            timeout: None,
            user_agent: format!("ota-storage/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Transport error taxonomy.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The server did not honour a request to resume at an offset.
    #[error("server does not support resuming at an offset (status {0})")]
    RangeNotSupported(u16),
    #[error("unexpected redirect: status {0}")]
    Redirect(u16),
    /// 4xx other than a refused range.
    #[error("request rejected: status {0}")]
    Client(u16),
    /// 5xx; the caller may retry later.
    #[error("transient server error: status {0}")]
    Retryable(u16),
    #[error("insecure url requires explicit opt-in: {0}")]
    InsecureUrl(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Transport-level issue (DNS, TLS, socket, etc.).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("error while reading the response body: {0}")]
    Body(#[from] std::io::Error),
    #[error("FIPS configuration error: {0}")]
    FipsConfig(String),
}

/// How a transfer ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The server sent the whole (remaining) body.
    Completed,
    /// The sink asked to stop early.
    Stopped,
}

/// Byte source for image downloads.
pub trait Transport {
    /// Streams the body of `url` starting at `offset` into `sink`.
    ///
    /// The sink returns [`ControlFlow::Break`] to stop the transfer.
    fn download(
        &self,
        url: &str,
        offset: u64,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<TransferOutcome, HttpError>;
}

/// [`Transport`] backed by a reusable blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    headers: HeaderMap,
    allow_plaintext: bool,
}

impl HttpClient {
    pub fn new(options: HttpClientOptions) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&options.user_agent)
                .map_err(|_| HttpError::InvalidUrl(options.user_agent.clone()))?,
        );
        let builder = create_client_builder()
            .map_err(|e| HttpError::FipsConfig(e.to_string()))?
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .danger_accept_invalid_hostnames(options.accept_invalid_certs)
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout);
        let client = builder.build().map_err(HttpError::Transport)?;
        Ok(Self {
            client,
            headers,
            allow_plaintext: options.allow_plaintext,
        })
    }
}

impl Transport for HttpClient {
    fn download(
        &self,
        url: &str,
        offset: u64,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<TransferOutcome, HttpError> {
        if !self.allow_plaintext && url.starts_with("http://") {
            return Err(HttpError::InsecureUrl(url.to_string()));
        }
        let mut headers = self.headers.clone();
        if offset > 0 {
            let range = HeaderValue::from_str(&format!("bytes={offset}-"))
                .map_err(|_| HttpError::InvalidUrl(url.to_string()))?;
            headers.insert(RANGE, range);
        }
        tracing::debug!(
            method = "GET",
            url = %url,
            offset,
            headers = ?redact_headers(&headers),
            "image HTTP request"
        );

        let mut response = self.client.get(url).headers(headers).send()?;
        let status = response.status();
        let content_length = response
            .content_length()
            .map_or_else(|| "unknown".to_string(), |len| len.to_string());
        tracing::debug!(
            url = %url,
            status = %status,
            content_length = %content_length,
            "image HTTP response"
        );

        if offset > 0
            && (status == StatusCode::OK || status == StatusCode::RANGE_NOT_SATISFIABLE)
        {
            return Err(HttpError::RangeNotSupported(status.as_u16()));
        }
        classify_status(status)?;

        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => return Ok(TransferOutcome::Completed),
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(HttpError::Body(err)),
            };
            if sink(&buffer[..read]).is_break() {
                return Ok(TransferOutcome::Stopped);
            }
        }
    }
}

/// Maps HTTP status codes to the transport error taxonomy.
fn classify_status(status: StatusCode) -> Result<(), HttpError> {
    if status.is_redirection() {
        // redirects are followed by the client; one surfacing here was not
        return Err(HttpError::Redirect(status.as_u16()));
    }
    if status.is_client_error() {
        return Err(HttpError::Client(status.as_u16()));
    }
    if status.is_server_error() {
        return Err(HttpError::Retryable(status.as_u16()));
    }
    Ok(())
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "proxy-authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}

/// Client builder using reqwest's default rustls configuration.
#[cfg(not(feature = "fips"))]
fn create_client_builder() -> Result<ClientBuilder, Box<dyn std::error::Error>> {
    Ok(Client::builder().use_rustls_tls())
}

/// Client builder restricted to a FIPS-compliant rustls configuration with native roots.
#[cfg(feature = "fips")]
fn create_client_builder() -> Result<ClientBuilder, Box<dyn std::error::Error>> {
    // The process must install a FIPS provider (e.g. rustls::crypto::default_fips_provider())
    // before the first client is built.
    let provider =
        rustls::crypto::CryptoProvider::get_default().ok_or("No crypto provider configured")?;
    if !provider.fips() {
        return Err("Crypto provider is not FIPS-compliant".into());
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => tracing::debug!("Failed to parse certificate: {:?}", err),
        }
    }
    if valid_count == 0 {
        return Err("No valid certificates found in native root store".into());
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|_| "Failed to set protocol versions")?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    if !config.fips() {
        return Err("The final TLS configuration is not FIPS-compliant".into());
    }
    tracing::debug!("image client configured with FIPS");
    Ok(Client::builder().use_preconfigured_tls(config))
}
