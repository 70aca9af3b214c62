//! HMAC-SHA256 body signatures carried in the `HashSHA256` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded body signature.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing key rejected: {0}")]
    Key(String),
    #[error("signature is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("signature does not match body")]
    Mismatch,
}

/// Signs and verifies bodies with a shared secret.
///
/// # Examples
///
/// ```
/// use observer_common::sign::Signer;
///
/// let signer = Signer::new("secret");
/// let sig = signer.sign(b"[]").unwrap();
/// assert_eq!(sig.len(), 64);
/// assert!(signer.verify(b"[]", &sig).is_ok());
/// assert!(signer.verify(b"[{}]", &sig).is_err());
/// ```
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, SignError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SignError::Key(e.to_string()))
    }

    /// Returns the lowercase hex HMAC of `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String, SignError> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `signature` against `body` in constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<(), SignError> {
        let expected = hex::decode(signature.trim())?;
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| SignError::Mismatch)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("key", &"<redacted>").finish()
    }
}
