//! Nonce generation and Ed25519 signature verification.
//!
//! Wire formats: public keys and signatures travel as standard base64 over
//! the raw Ed25519 bytes (32-byte key, 64-byte signature); nonces are
//! 64-char lowercase hex derived from 32 random bytes. The signed message
//! is the raw nonce string with no framing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// Number of random bytes behind a nonce; hex-encodes to 64 chars.
pub const NONCE_BYTES: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("public key is not valid base64")]
    InvalidPublicKeyEncoding,
    #[error("public key must be {PUBLIC_KEY_LENGTH} bytes, got {0}")]
    InvalidPublicKeyLength(usize),
    #[error("public key bytes do not form a valid Ed25519 point")]
    InvalidPublicKey,
    #[error("signature is not valid base64")]
    InvalidSignatureEncoding,
    #[error("signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    InvalidSignatureLength(usize),
}

/// Generates a fresh challenge: 32 bytes from the OS CSPRNG, lowercase hex.
pub fn generate_nonce() -> Result<String, rand::Error> {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Verifies an Ed25519 signature over `message`.
///
/// Returns `Ok(true)` iff the decoded signature verifies under the decoded
/// public key. Malformed inputs return a typed error rather than `false`
/// so callers can distinguish garbage from a genuine verification failure;
/// the HTTP layer collapses both into the same 403.
pub fn verify_signature(
    pub_key_b64: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<bool, SignatureError> {
    let key_bytes = BASE64
        .decode(pub_key_b64)
        .map_err(|_| SignatureError::InvalidPublicKeyEncoding)?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKeyLength(key_bytes.len()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| SignatureError::InvalidSignatureEncoding)?;
    let sig_bytes: [u8; SIGNATURE_LENGTH] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureLength(sig_bytes.len()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// Constant-time string equality for secret material (nonces, verified
/// emails). Length is not secret here; only the content comparison needs
/// to be branch-free.
pub fn constant_time_equals(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = BASE64.encode(signing_key.verifying_key().as_bytes());
        (signing_key, public_b64)
    }

    #[test]
    fn nonce_is_64_lowercase_hex() {
        let nonce = generate_nonce().unwrap();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn nonce_hex_round_trips() {
        let nonce = generate_nonce().unwrap();
        let bytes = hex::decode(&nonce).unwrap();
        assert_eq!(bytes.len(), NONCE_BYTES);
        assert_eq!(hex::encode(bytes), nonce);
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce().unwrap(), generate_nonce().unwrap());
    }

    #[test]
    fn valid_signature_verifies() {
        let (signing_key, public_b64) = test_keypair();
        let nonce = "ab".repeat(32);
        let signature = BASE64.encode(signing_key.sign(nonce.as_bytes()).to_bytes());

        assert_eq!(verify_signature(&public_b64, nonce.as_bytes(), &signature), Ok(true));
    }

    #[test]
    fn signature_over_different_message_fails() {
        let (signing_key, public_b64) = test_keypair();
        let signature = BASE64.encode(signing_key.sign(b"something else").to_bytes());

        assert_eq!(
            verify_signature(&public_b64, b"the actual nonce", &signature),
            Ok(false)
        );
    }

    #[test]
    fn signature_from_wrong_key_fails() {
        let (_, public_b64) = test_keypair();
        let other_key = SigningKey::from_bytes(&[9u8; 32]);
        let nonce = "cd".repeat(32);
        let signature = BASE64.encode(other_key.sign(nonce.as_bytes()).to_bytes());

        assert_eq!(verify_signature(&public_b64, nonce.as_bytes(), &signature), Ok(false));
    }

    #[test]
    fn bad_base64_public_key_is_typed_error() {
        let err = verify_signature("not base64!!", b"msg", "c2ln").unwrap_err();
        assert_eq!(err, SignatureError::InvalidPublicKeyEncoding);
    }

    #[test]
    fn short_public_key_is_typed_error() {
        let short = BASE64.encode([1u8; 16]);
        let err = verify_signature(&short, b"msg", "c2ln").unwrap_err();
        assert_eq!(err, SignatureError::InvalidPublicKeyLength(16));
    }

    #[test]
    fn bad_base64_signature_is_typed_error() {
        let (_, public_b64) = test_keypair();
        let err = verify_signature(&public_b64, b"msg", "!!!").unwrap_err();
        assert_eq!(err, SignatureError::InvalidSignatureEncoding);
    }

    #[test]
    fn short_signature_is_typed_error() {
        let (_, public_b64) = test_keypair();
        let short = BASE64.encode([1u8; 32]);
        let err = verify_signature(&public_b64, b"msg", &short).unwrap_err();
        assert_eq!(err, SignatureError::InvalidSignatureLength(32));
    }

    #[test]
    fn constant_time_equals_matches() {
        assert!(constant_time_equals("alice@example.com", "alice@example.com"));
        assert!(!constant_time_equals("alice@example.com", "bob@example.com"));
        assert!(!constant_time_equals("short", "longer value"));
    }
}
