//! Asymmetric key material for a node and its peers
//!
//! Each node holds one long-lived RSA key pair, immutable after startup.
//! Agents present their own public key during authentication; the node
//! encrypts to it from then on.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// RSA modulus size for generated node keys
const GENERATED_KEY_BITS: usize = 2048;

/// The node's long-lived RSA key pair
pub struct NodeKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    fingerprint: String,
}

impl NodeKeyPair {
    /// Load a key pair from a PKCS#8 PEM private key
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| ProtocolError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// Generate a fresh key pair
    ///
    /// Used by tests and by deployments that have not provisioned a durable
    /// identity yet; generation takes noticeable CPU time.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, GENERATED_KEY_BITS)
            .map_err(|e| ProtocolError::CryptoError(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        let fingerprint = fingerprint_of(&public);
        Self {
            private,
            public,
            fingerprint,
        }
    }

    /// The private half
    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The public half
    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// base64 SHA-256 fingerprint of the public key (SPKI DER)
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// PEM encoding of the public key for announcements
    pub fn public_key_pem(&self) -> Result<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::CryptoError(e.to_string()))
    }
}

impl std::fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// A peer's public key, parsed from the PEM it presented at authentication
#[derive(Clone)]
pub struct PeerPublicKey {
    key: RsaPublicKey,
    fingerprint: String,
}

impl PeerPublicKey {
    /// Parse an SPKI PEM public key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        let fingerprint = fingerprint_of(&key);
        Ok(Self { key, fingerprint })
    }

    /// The parsed key
    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }

    /// base64 SHA-256 fingerprint of the key
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPublicKey")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn fingerprint_of(key: &RsaPublicKey) -> String {
    match key.to_public_key_der() {
        Ok(der) => B64.encode(Sha256::digest(der.as_bytes())),
        // DER encoding of a parsed key cannot fail in practice
        Err(_) => String::new(),
    }
}
