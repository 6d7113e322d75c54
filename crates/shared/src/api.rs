//! Shared API request/response types used by the server and its clients.

use garde::Validate;
use serde::{Deserialize, Serialize};

/// Max username length. Usernames are display handles, not routing keys.
const MAX_USERNAME_LEN: usize = 64;
/// Ed25519 public key is 32 bytes; standard base64 of that is 44 chars.
/// Generous bound to tolerate clients that send unpadded encodings.
const MAX_PUBLIC_KEY_LEN: usize = 128;
/// Ed25519 signature is 64 bytes; standard base64 of that is 88 chars.
const MAX_SIGNATURE_LEN: usize = 128;

/// Complete a registration. The nonce must have been obtained from
/// `POST /register/init` and the signature is the client's Ed25519
/// signature over the raw nonce bytes.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RegisterPayload {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 1, max = MAX_USERNAME_LEN))]
    pub username: String,
    /// Ed25519 public key, standard base64 encoded.
    #[garde(length(min = 1, max = MAX_PUBLIC_KEY_LEN))]
    pub public_key: String,
    /// 64-char lowercase hex challenge from `/register/init`.
    #[garde(length(min = 64, max = 64), pattern(r"^[0-9a-f]+$"))]
    pub nonce: String,
    /// Ed25519 signature over the raw nonce bytes, standard base64 encoded.
    #[garde(length(min = 1, max = MAX_SIGNATURE_LEN))]
    pub signature: String,
}

/// Returned by `POST /register/init`: the challenge the client must sign
/// and embed in the verification email's recipient address.
#[derive(Debug, Serialize, Deserialize)]
pub struct NonceResponse {
    pub nonce: String,
}

/// Generic success envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}
