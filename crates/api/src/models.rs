use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered identity. Email is the primary key; the public key is the
/// client's Ed25519 verifying key, stored in the base64 form it arrived in.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub username: String,
    pub public_key: String,
}
