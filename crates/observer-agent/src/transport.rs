//! HTTP delivery of metrics to the server.
//!
//! Every request body goes through the same framing: JSON, then the
//! `HashSHA256` signature over that JSON, then optional RSA encryption, then
//! gzip. Connection failures and `500` answers are retried with a bounded
//! backoff; everything else is terminal for the request.

use observer_common::compress::gzip;
use observer_common::crypto::{CryptoError, Encryptor};
use observer_common::sign::{SignError, Signer, SIGNATURE_HEADER};
use observer_common::types::Metric;
use observer_common::REAL_IP_HEADER;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("encode payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("encrypt payload: {0}")]
    Encrypt(#[from] CryptoError),

    #[error("sign payload: {0}")]
    Sign(#[from] SignError),

    #[error("compress payload: {0}")]
    Compress(#[source] std::io::Error),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<TransportError>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("response signature does not match")]
    BadResponseSignature,
}

impl TransportError {
    /// Connection failures and `500` are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(e) => e.is_connect(),
            TransportError::Status { status, .. } => *status == StatusCode::INTERNAL_SERVER_ERROR,
            _ => false,
        }
    }
}

/// Bounded exponential backoff between attempts of one request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.min_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `host:port` or a full base URL.
    pub address: String,
    pub key: Option<String>,
    /// RSA public key (PEM) used to encrypt request bodies.
    pub crypto_key: Option<PathBuf>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransportConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            key: None,
            crypto_key: None,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// A framed request body ready to be sent, possibly more than once.
struct Frame {
    body: Vec<u8>,
    signature: Option<String>,
}

/// Shared HTTP client for one server.
pub struct Transport {
    client: reqwest::Client,
    base_url: String,
    signer: Option<Signer>,
    encryptor: Option<Encryptor>,
    retry: RetryPolicy,
    /// Sent as `X-Real-IP`; the address this host uses to reach the server.
    real_ip: Option<IpAddr>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(TransportError::Request)?;
        let encryptor = config
            .crypto_key
            .as_ref()
            .map(Encryptor::from_pem_file)
            .transpose()?;
        let base_url = base_url(&config.address);
        let real_ip = outbound_ip(&base_url);
        if real_ip.is_none() {
            tracing::warn!(server = %base_url, "Cannot determine local address, sending without X-Real-IP");
        }
        Ok(Self {
            client,
            base_url,
            signer: config.key.as_deref().map(Signer::new),
            encryptor,
            retry: config.retry,
            real_ip,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn real_ip(&self) -> Option<IpAddr> {
        self.real_ip
    }

    /// POST `/update` with one metric; returns what the server stored.
    pub async fn send_metric(
        &self,
        metric: &Metric,
        cancel: &CancellationToken,
    ) -> Result<Metric, TransportError> {
        self.post("/update", metric, cancel).await
    }

    /// POST `/updates` with the whole batch; returns what the server stored.
    pub async fn send_batch(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>, TransportError> {
        self.post("/updates", metrics, cancel).await
    }

    fn frame<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Frame, TransportError> {
        let json = serde_json::to_vec(payload).map_err(TransportError::Serialize)?;
        let signature = self
            .signer
            .as_ref()
            .map(|signer| signer.sign(&json))
            .transpose()?;
        let body = match &self.encryptor {
            Some(encryptor) => encryptor.encrypt(&json)?,
            None => json,
        };
        let body = gzip(&body).map_err(TransportError::Compress)?;
        Ok(Frame { body, signature })
    }

    async fn post<T, R>(
        &self,
        path: &str,
        payload: &T,
        cancel: &CancellationToken,
    ) -> Result<R, TransportError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let frame = self.frame(payload)?;
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                outcome = self.attempt(&url, &frame) => outcome,
            };

            let err = match outcome {
                Ok(body) => return serde_json::from_slice(&body).map_err(TransportError::Decode),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.retry.max_attempts {
                tracing::warn!(url = %url, attempts = attempt, error = %err, "Giving up on request");
                return Err(TransportError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let wait = self.retry.backoff(attempt);
            tracing::debug!(url = %url, attempt, error = %err, retry_in = ?wait, "Request failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn attempt(&self, url: &str, frame: &Frame) -> Result<Vec<u8>, TransportError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(frame.body.clone());
        if let Some(signature) = &frame.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }

        let response = request.send().await.map_err(TransportError::Request)?;
        let status = response.status();
        let signature = response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(TransportError::Request)?;

        if !status.is_success() {
            let mut text = String::from_utf8_lossy(&body).trim().to_string();
            if text.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                text.truncate(cut);
            }
            return Err(TransportError::Status { status, body: text });
        }

        if let (Some(signer), Some(signature)) = (&self.signer, signature) {
            signer
                .verify(&body, &signature)
                .map_err(|_| TransportError::BadResponseSignature)?;
        }
        Ok(body.to_vec())
    }
}

/// Local address of the interface that routes to the server.
///
/// Connecting a UDP socket sends nothing; it only selects the route.
fn outbound_ip(base_url: &str) -> Option<IpAddr> {
    let (scheme, rest) = base_url.split_once("://").unwrap_or(("http", base_url));
    let authority = rest.split('/').next().filter(|a| !a.is_empty())?;
    let default_port = if scheme == "https" { 443 } else { 80 };
    let target = authority
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .or_else(|| (authority, default_port).to_socket_addrs().ok()?.next())?;

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}
