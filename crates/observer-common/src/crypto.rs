//! Chunked RSA-OAEP(SHA-512) payload encryption.
//!
//! Plaintext is split into blocks small enough for one OAEP operation each,
//! the ciphertext blocks are concatenated and the whole result is base64
//! encoded. The agent holds the public key, the server the private key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use std::path::{Path, PathBuf};

/// SHA-512 digest length in bytes.
const DIGEST_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("cannot read key file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse RSA key: {0}")]
    Key(String),
    #[error("{bits}-bit RSA key is too small for OAEP with SHA-512")]
    KeyTooSmall { bits: usize },
    #[error("encryption failed: {0}")]
    Encrypt(rsa::Error),
    #[error("decryption failed: {0}")]
    Decrypt(rsa::Error),
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext length {len} is not a multiple of the {block}-byte key size")]
    Truncated { len: usize, block: usize },
}

fn read_pem(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|source| CryptoError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Agent-side encryptor.
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
    step: usize,
}

impl Encryptor {
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    /// Parses an SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        Self::new(key)
    }

    pub fn new(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let size = key.size();
        let step = size
            .checked_sub(2 * DIGEST_LEN + 2)
            .filter(|step| *step > 0)
            .ok_or(CryptoError::KeyTooSmall { bits: size * 8 })?;
        Ok(Self { key, step })
    }

    /// Encrypts `plaintext` and returns base64 text as bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::thread_rng();
        let blocks = plaintext.len().div_ceil(self.step);
        let mut sealed = Vec::with_capacity(blocks * self.key.size());
        for chunk in plaintext.chunks(self.step) {
            let block = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha512>(), chunk)
                .map_err(CryptoError::Encrypt)?;
            sealed.extend_from_slice(&block);
        }
        Ok(STANDARD.encode(sealed).into_bytes())
    }
}

/// Server-side decryptor.
#[derive(Debug, Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    /// Parses a PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        if key.size() < 2 * DIGEST_LEN + 3 {
            return Err(CryptoError::KeyTooSmall {
                bits: key.size() * 8,
            });
        }
        Ok(Self { key })
    }

    /// Reverses [`Encryptor::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sealed = STANDARD.decode(ciphertext.trim_ascii())?;
        let block = self.key.size();
        if sealed.len() % block != 0 {
            return Err(CryptoError::Truncated {
                len: sealed.len(),
                block,
            });
        }
        let mut plain = Vec::with_capacity(sealed.len());
        for chunk in sealed.chunks(block) {
            let opened = self
                .key
                .decrypt(Oaep::new::<Sha512>(), chunk)
                .map_err(CryptoError::Decrypt)?;
            plain.extend_from_slice(&opened);
        }
        Ok(plain)
    }
}
