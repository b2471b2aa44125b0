//! Transport wrappings applied to serialized envelopes
//!
//! Three formats travel on the wire:
//!
//! * `PlainText` — the envelope JSON itself.
//! * `SignOnly` — a compact JWS (RS256) over the envelope JSON, produced
//!   with the sender's private key.
//! * `Encrypt` — a compact JWE (RSA-OAEP-256 + A256CBC-HS512) of the
//!   envelope JSON, encrypted to the recipient's public key.
//!
//! Opening is strict: bytes in the wrong format for the expected wrapping
//! fail with [`ProtocolError::MalformedEnvelope`], while signature and
//! decryption failures collapse into the uniform
//! [`ProtocolError::InvalidConnectionStateForAuthentication`] so the error
//! surface leaks nothing about which check failed.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::envelope::{AgentAuthRequest, Envelope};
use crate::error::{ProtocolError, Result};
use crate::keys::{NodeKeyPair, PeerPublicKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Transport formats for a serialized envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapping {
    PlainText,
    SignOnly,
    Encrypt,
}

const JWS_HEADER: &str = r#"{"alg":"RS256","encrypted":"false","version":"1"}"#;
const JWE_HEADER: &str =
    r#"{"alg":"RSA-OAEP-256","enc":"A256CBC-HS512","encrypted":"true","version":"1"}"#;

/// Content-encryption key length for A256CBC-HS512 (MAC half + AES half)
const CEK_LEN: usize = 64;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

#[derive(Deserialize)]
struct WireHeader {
    #[serde(default)]
    encrypted: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Seal an envelope as plain UTF-8 JSON
pub fn seal_plain(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(envelope.to_json()?.into_bytes())
}

/// Seal an envelope as a compact JWS signed with the node's private key
pub fn seal_signed(envelope: &Envelope, keys: &NodeKeyPair) -> Result<Vec<u8>> {
    let header = URL_SAFE_NO_PAD.encode(JWS_HEADER);
    let payload = URL_SAFE_NO_PAD.encode(envelope.to_json()?);
    let signing_input = format!("{header}.{payload}");

    let signing_key = SigningKey::<Sha256>::new(keys.private().clone());
    let signature = signing_key.sign(signing_input.as_bytes());
    let encoded_sig = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{encoded_sig}").into_bytes())
}

/// Seal an envelope as a compact JWE encrypted to the recipient's key
pub fn seal_encrypted(envelope: &Envelope, recipient: &PeerPublicKey) -> Result<Vec<u8>> {
    seal_encrypted_to(envelope, recipient.key())
}

/// Seal to a raw RSA public key; used when the recipient is the node itself
pub fn seal_encrypted_to(envelope: &Envelope, recipient: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;

    let mut cek = [0u8; CEK_LEN];
    rng.fill_bytes(&mut cek);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let encrypted_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &cek)
        .map_err(|e| ProtocolError::CryptoError(e.to_string()))?;

    let header = URL_SAFE_NO_PAD.encode(JWE_HEADER);
    let aad = header.as_bytes();

    let cipher = Aes256CbcEnc::new_from_slices(&cek[32..], &iv)
        .map_err(|e| ProtocolError::CryptoError(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(envelope.to_json()?.as_bytes());

    let tag = cbc_hmac_tag(&cek[..32], aad, &iv, &ciphertext)?;

    Ok(format!(
        "{header}.{}.{}.{}.{}",
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(&ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    )
    .into_bytes())
}

/// Open a plain-text envelope
pub fn open_plain(bytes: &[u8]) -> Result<Envelope> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedEnvelope("frame is not UTF-8".into()))?;
    Envelope::from_json(raw)
}

/// Open a signed envelope, verifying against a known sender key
pub fn open_signed(bytes: &[u8], sender: &PeerPublicKey) -> Result<Envelope> {
    let (signing_input, payload, signature) = split_jws(bytes)?;
    verify_rs256(sender.key(), signing_input.as_bytes(), &signature)?;
    Envelope::from_json(&payload)
}

/// Open a signed envelope whose verification key travels inside it
///
/// The agent `auth` message is signed by a key the node has never seen; the
/// payload carries the matching public key, so verification is a
/// proof-of-possession over the embedded key rather than a trust decision.
pub fn open_signed_embedded(bytes: &[u8]) -> Result<Envelope> {
    let (signing_input, payload, signature) = split_jws(bytes)?;
    let envelope = Envelope::from_json(&payload)?;

    let auth: AgentAuthRequest = envelope
        .parse_payload()
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
    let key = PeerPublicKey::from_pem(&auth.public_key)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)?;

    verify_rs256(key.key(), signing_input.as_bytes(), &signature)?;
    Ok(envelope)
}

/// Open an encrypted envelope with the node's private key
pub fn open_encrypted(bytes: &[u8], keys: &NodeKeyPair) -> Result<Envelope> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedEnvelope("frame is not UTF-8".into()))?;
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 5 {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "expected a 5-part JWE, got {} parts",
            parts.len()
        )));
    }
    check_header(parts[0], true)?;

    let encrypted_key = decode_part(parts[1])?;
    let iv = decode_part(parts[2])?;
    let ciphertext = decode_part(parts[3])?;
    let tag = decode_part(parts[4])?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(ProtocolError::MalformedEnvelope(
            "bad IV or tag length".into(),
        ));
    }

    let cek = decrypt_cek(keys.private(), &encrypted_key)?;
    let expected = cbc_hmac_tag(&cek[..32], parts[0].as_bytes(), &iv, &ciphertext)?;
    if expected.as_slice().ct_eq(tag.as_slice()).unwrap_u8() != 1 {
        return Err(ProtocolError::InvalidConnectionStateForAuthentication);
    }

    let cipher = Aes256CbcDec::new_from_slices(&cek[32..], &iv)
        .map_err(|e| ProtocolError::CryptoError(e.to_string()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)?;

    let raw = String::from_utf8(plaintext)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)?;
    Envelope::from_json(&raw)
}

fn split_jws(bytes: &[u8]) -> Result<(String, String, Vec<u8>)> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedEnvelope("frame is not UTF-8".into()))?;
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 3 {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "expected a 3-part JWS, got {} parts",
            parts.len()
        )));
    }
    check_header(parts[0], false)?;

    let payload = decode_part(parts[1])?;
    let payload = String::from_utf8(payload)
        .map_err(|_| ProtocolError::MalformedEnvelope("JWS payload is not UTF-8".into()))?;
    let signature = decode_part(parts[2])?;
    let signing_input = format!("{}.{}", parts[0], parts[1]);
    Ok((signing_input, payload, signature))
}

fn check_header(encoded: &str, expect_encrypted: bool) -> Result<()> {
    let raw = decode_part(encoded)?;
    let header: WireHeader = serde_json::from_slice(&raw)
        .map_err(|_| ProtocolError::MalformedEnvelope("unreadable wrapping header".into()))?;
    let encrypted = header.encrypted.as_deref() == Some("true");
    if encrypted != expect_encrypted {
        return Err(ProtocolError::MalformedEnvelope(
            "wrapping header does not match expected format".into(),
        ));
    }
    if header.version.as_deref() != Some("1") {
        return Err(ProtocolError::MalformedEnvelope(
            "unsupported wrapping version".into(),
        ));
    }
    Ok(())
}

fn decode_part(part: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| ProtocolError::MalformedEnvelope("invalid base64 segment".into()))
}

fn verify_rs256(key: &RsaPublicKey, signing_input: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)?;
    verifying_key
        .verify(signing_input, &signature)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)
}

fn decrypt_cek(key: &RsaPrivateKey, encrypted_key: &[u8]) -> Result<[u8; CEK_LEN]> {
    let cek = key
        .decrypt(Oaep::new::<Sha256>(), encrypted_key)
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)?;
    cek.try_into()
        .map_err(|_| ProtocolError::InvalidConnectionStateForAuthentication)
}

/// RFC 7518 §5.2.5 tag: first half of HMAC-SHA-512 over AAD || IV || C || AL
fn cbc_hmac_tag(mac_key: &[u8], aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<[u8; TAG_LEN]> {
    let mut mac = HmacSha512::new_from_slice(mac_key)
        .map_err(|e| ProtocolError::CryptoError(e.to_string()))?;
    mac.update(aad);
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(&((aad.len() as u64) * 8).to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use std::sync::OnceLock;

    fn test_keys() -> &'static NodeKeyPair {
        static KEYS: OnceLock<NodeKeyPair> = OnceLock::new();
        KEYS.get_or_init(|| NodeKeyPair::generate().unwrap())
    }

    fn sample() -> Envelope {
        Envelope::new(MessageType::Command)
            .from_id("P1")
            .to_id("A1")
            .with_raw_payload("{\"command\":\"status\"}")
    }

    #[test]
    fn plain_round_trip() {
        let env = sample();
        let bytes = seal_plain(&env).unwrap();
        assert_eq!(open_plain(&bytes).unwrap(), env);
    }

    #[test]
    fn signed_round_trip() {
        let keys = test_keys();
        let env = sample();
        let bytes = seal_signed(&env, keys).unwrap();
        let peer = PeerPublicKey::from_pem(&keys.public_key_pem().unwrap()).unwrap();
        assert_eq!(open_signed(&bytes, &peer).unwrap(), env);
    }

    #[test]
    fn encrypted_round_trip() {
        let keys = test_keys();
        let env = sample();
        let peer = PeerPublicKey::from_pem(&keys.public_key_pem().unwrap()).unwrap();
        let bytes = seal_encrypted(&env, &peer).unwrap();
        assert_eq!(open_encrypted(&bytes, keys).unwrap(), env);
    }

    #[test]
    fn plain_bytes_fail_strict_encrypted_open() {
        let keys = test_keys();
        let bytes = seal_plain(&sample()).unwrap();
        assert!(matches!(
            open_encrypted(&bytes, keys),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn encrypted_bytes_fail_strict_plain_open() {
        let keys = test_keys();
        let peer = PeerPublicKey::from_pem(&keys.public_key_pem().unwrap()).unwrap();
        let bytes = seal_encrypted(&sample(), &peer).unwrap();
        assert!(matches!(
            open_plain(&bytes),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn signed_bytes_fail_strict_encrypted_open() {
        let keys = test_keys();
        let bytes = seal_signed(&sample(), keys).unwrap();
        assert!(matches!(
            open_encrypted(&bytes, keys),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn tampered_signature_is_uniform_error() {
        let keys = test_keys();
        let mut bytes = seal_signed(&sample(), keys).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0x01;
        let peer = PeerPublicKey::from_pem(&keys.public_key_pem().unwrap()).unwrap();
        assert!(matches!(
            open_signed(&bytes, &peer),
            Err(ProtocolError::InvalidConnectionStateForAuthentication)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_uniform_error() {
        let keys = test_keys();
        let peer = PeerPublicKey::from_pem(&keys.public_key_pem().unwrap()).unwrap();
        let bytes = seal_encrypted(&sample(), &peer).unwrap();
        let raw = String::from_utf8(bytes).unwrap();
        let mut parts: Vec<String> = raw.split('.').map(String::from).collect();
        let mut ct = URL_SAFE_NO_PAD.decode(&parts[3]).unwrap();
        ct[0] ^= 0x01;
        parts[3] = URL_SAFE_NO_PAD.encode(ct);
        let tampered = parts.join(".").into_bytes();
        assert!(matches!(
            open_encrypted(&tampered, keys),
            Err(ProtocolError::InvalidConnectionStateForAuthentication)
        ));
    }

    #[test]
    fn embedded_key_auth_round_trip() {
        let agent_keys = test_keys();
        let env = Envelope::new(MessageType::Auth)
            .from_id("A1")
            .with_payload(&AgentAuthRequest {
                token: "tok".into(),
                public_key: agent_keys.public_key_pem().unwrap(),
                client_version: Some("1.0".into()),
                protocol_version: Some(1),
                metadata: None,
            })
            .unwrap();
        let bytes = seal_signed(&env, agent_keys).unwrap();
        let opened = open_signed_embedded(&bytes).unwrap();
        assert_eq!(opened, env);
    }

    #[test]
    fn embedded_key_mismatch_is_uniform_error() {
        // Signed with one key, but the payload advertises a different one
        let signer = NodeKeyPair::generate().unwrap();
        let other = test_keys();
        let env = Envelope::new(MessageType::Auth)
            .from_id("A1")
            .with_payload(&AgentAuthRequest {
                token: "tok".into(),
                public_key: other.public_key_pem().unwrap(),
                client_version: None,
                protocol_version: Some(1),
                metadata: None,
            })
            .unwrap();
        let bytes = seal_signed(&env, &signer).unwrap();
        assert!(matches!(
            open_signed_embedded(&bytes),
            Err(ProtocolError::InvalidConnectionStateForAuthentication)
        ));
    }
}
