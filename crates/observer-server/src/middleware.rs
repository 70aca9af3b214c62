use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use observer_common::sign::SIGNATURE_HEADER;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::api::error_response;
use crate::logging::{is_json_content, trace_id_of, MAX_BODY_BYTES};
use crate::state::AppState;

pub use observer_common::REAL_IP_HEADER;

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum SubnetParseError {
    #[error("expected <address>/<prefix>")]
    Format,
    #[error("invalid network address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("invalid prefix length '{0}'")]
    Prefix(String),
}

impl TrustedSubnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for TrustedSubnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.trim().split_once('/').ok_or(SubnetParseError::Format)?;
        let network: IpAddr = addr.parse()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= max)
            .ok_or_else(|| SubnetParseError::Prefix(prefix.to_string()))?;
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for TrustedSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Rejects requests from outside the trusted subnet with 403.
///
/// Passes everything through when no subnet is configured.
pub async fn trusted_subnet(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(subnet) = state.config.trusted_subnet else {
        return next.run(req).await;
    };
    let trace_id = trace_id_of(&req);

    let real_ip = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    match real_ip {
        Some(ip) if subnet.contains(ip) => next.run(req).await,
        Some(ip) => {
            tracing::warn!(trace_id = %trace_id, ip = %ip, subnet = %subnet, "Request rejected: untrusted address");
            error_response(StatusCode::FORBIDDEN, &trace_id, "forbidden", "address not in trusted subnet")
        }
        None => {
            tracing::warn!(trace_id = %trace_id, "Request rejected: missing or invalid X-Real-IP");
            error_response(StatusCode::FORBIDDEN, &trace_id, "forbidden", "missing or invalid X-Real-IP header")
        }
    }
}

/// Decrypts and verifies request bodies, and signs JSON responses.
///
/// With a private key configured every non-empty body is decrypted first.
/// With a secret configured, a `HashSHA256` header is checked against the
/// plaintext; a request without the header is let through unverified.
pub async fn payload_integrity(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let trace_id = trace_id_of(&req);
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .map(|v| v.to_str().map(str::to_string));

    let needs_body = state.decryptor.is_some() || (state.signer.is_some() && signature.is_some());
    let req = if needs_body {
        let (mut parts, body) = req.into_parts();
        let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, error = %e, "Unreadable request body");
                return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", "unreadable request body");
            }
        };

        let plain = match &state.decryptor {
            Some(decryptor) if !bytes.is_empty() => match decryptor.decrypt(&bytes) {
                Ok(plain) => Bytes::from(plain),
                Err(e) => {
                    tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: cannot decrypt body");
                    return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", "cannot decrypt payload");
                }
            },
            _ => bytes,
        };

        if let (Some(signer), Some(signature)) = (&state.signer, &signature) {
            let verified = match signature {
                Ok(sig) => signer.verify(&plain, sig).is_ok(),
                Err(_) => false,
            };
            if !verified {
                tracing::warn!(trace_id = %trace_id, "Request rejected: signature mismatch");
                return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_signature", "signature mismatch");
            }
        }

        parts.headers.remove(header::CONTENT_LENGTH);
        Request::from_parts(parts, Body::from(plain))
    } else {
        req
    };

    let response = next.run(req).await;
    sign_response(&state, response, &trace_id).await
}

async fn sign_response(state: &AppState, response: Response, trace_id: &str) -> Response {
    let Some(signer) = &state.signer else {
        return response;
    };
    if !is_json_content(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Failed to buffer response for signing");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, trace_id, "internal_error", "internal error");
        }
    };
    match signer.sign(&bytes).map(|sig| HeaderValue::from_str(&sig)) {
        Ok(Ok(value)) => {
            parts.headers.insert(SIGNATURE_HEADER, value);
        }
        _ => tracing::error!(trace_id = %trace_id, "Failed to sign response"),
    }
    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(raw: &str) -> TrustedSubnet {
        raw.parse().unwrap()
    }

    #[test]
    fn ipv4_membership() {
        let net = subnet("192.168.1.0/24");
        assert!(net.contains("192.168.1.77".parse().unwrap()));
        assert!(!net.contains("192.168.2.1".parse().unwrap()));
        assert!(subnet("0.0.0.0/0").contains("8.8.8.8".parse().unwrap()));
        assert!(subnet("10.1.2.3/32").contains("10.1.2.3".parse().unwrap()));
        assert!(!subnet("10.1.2.3/32").contains("10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn ipv6_and_mapped_addresses() {
        let net = subnet("fd00::/8");
        assert!(net.contains("fd12:3456::1".parse().unwrap()));
        assert!(!net.contains("fe80::1".parse().unwrap()));
        assert!(!net.contains("10.0.0.1".parse().unwrap()));
        assert!(subnet("10.0.0.0/8").contains("::ffff:10.2.3.4".parse().unwrap()));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!("10.0.0.0".parse::<TrustedSubnet>(), Err(SubnetParseError::Format)));
        assert!(matches!("10.0.0/8".parse::<TrustedSubnet>(), Err(SubnetParseError::Address(_))));
        assert!(matches!("10.0.0.0/33".parse::<TrustedSubnet>(), Err(SubnetParseError::Prefix(_))));
        assert!("::/129".parse::<TrustedSubnet>().is_err());
        assert_eq!(subnet(" 10.0.0.0/8 ").to_string(), "10.0.0.0/8");
    }
}
