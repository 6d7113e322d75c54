//! Email-rendezvous registration.
//!
//! Flow:
//! 1. Client requests a nonce via POST /register/init
//! 2. Client POSTs /register with (email, username, public key, nonce,
//!    signature over the nonce) and the request suspends
//! 3. Client sends an email from that address to
//!    `<prefix>+<nonce>@<domain>`; the SMTP listener cross-checks the
//!    sender against the pending registration and fires the registry
//! 4. The suspended request wakes, re-checks the verified email, verifies
//!    the signature on the crypto pool, and inserts the user on the DB
//!    pool
//!
//! Security notes:
//! - The verified email is read back from the TTL store after the wake,
//!   never trusted from the notification itself
//! - The bare-nonce entry is deleted on first use (single-use proof)
//! - Failure responses are generic to avoid account enumeration
//! - Every exit path tears down the registry entry and the expected-email
//!   entry; a dropped request (client disconnect) cleans up the same way

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router, debug_handler,
    extract::{State, rejection::JsonRejection},
    response::IntoResponse,
    routing::post,
};
use garde::Validate;
use shared::api::{NonceResponse, RegisterPayload, StatusResponse};
use tokio::sync::oneshot;

use crate::crypto;
use crate::error::AppError;
use crate::models::User;
use crate::repos::UserRepoError;
use crate::smtp::verify::expected_key;
use crate::state::AppState;
use crate::stores::{MemoryTtlStore, VerificationRegistry};
use crate::utils::{hash_email, hash_username};
use crate::workers::run_with_timeout;

/// Soft deadline for signature verification inside the crypto pool task.
const CRYPTO_SOFT_DEADLINE: Duration = Duration::from_secs(5);
/// Hard cap the handler waits for the crypto result.
const CRYPTO_HARD_DEADLINE: Duration = Duration::from_secs(6);
/// Soft deadline for the user insert inside the DB pool task.
const DB_SOFT_DEADLINE: Duration = Duration::from_secs(3);
/// Hard cap the handler waits for the DB result.
const DB_HARD_DEADLINE: Duration = Duration::from_secs(4);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register/init", post(register_init))
        .route("/register", post(register))
}

/// Stateless: hands the client a fresh challenge. Nothing is stored until
/// the client comes back with `POST /register`.
#[debug_handler]
async fn register_init() -> Result<impl IntoResponse, AppError> {
    let nonce = crypto::generate_nonce()?;
    Ok(Json(NonceResponse { nonce }))
}

/// Removes the registry entry and the expected-email entry when the
/// handler exits, whether it returns, errors, or is dropped because the
/// client went away mid-wait.
struct RendezvousGuard {
    registry: Arc<VerificationRegistry>,
    ttl: MemoryTtlStore,
    nonce: String,
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        self.registry.delete(&self.nonce);
        self.ttl.delete(&expected_key(&self.nonce));
    }
}

#[debug_handler]
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterPayload>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(mut req) =
        payload.map_err(|_| AppError::BadRequest("Invalid JSON".to_string()))?;

    // Normalize before validating: identities compare lowercased and
    // trimmed everywhere else in the system.
    req.email = req.email.trim().to_lowercase();
    req.username = req.username.trim().to_lowercase().replace(' ', "");
    req.public_key = req.public_key.replace(['\r', '\n'], "");
    req.signature = req.signature.trim().to_string();
    req.nonce = req.nonce.trim().to_string();

    let email_hash = hash_email(&req.email);
    let username_hash = hash_username(&req.username);
    let nonce_hash = hash_email(&req.nonce);

    if let Err(err) = req.validate() {
        tracing::warn!(email = %email_hash, username = %username_hash, "registration failed: validation");
        return Err(AppError::BadRequest(err.to_string()));
    }

    // Record which sender address may redeem this nonce, then arm the
    // rendezvous. Order matters: the SMTP processor must be able to see
    // the expected email from the moment a wake-up is possible.
    state
        .ttl
        .set_with_value(&expected_key(&req.nonce), &req.email, state.config.registration_ttl())
        .map_err(|err| {
            tracing::error!(email = %email_hash, error = %err, "registration failed: could not store expected email");
            AppError::Capacity("Registration initialization failed")
        })?;

    let mut wait_rx = state.registry.register(&req.nonce);
    let _cleanup = RendezvousGuard {
        registry: Arc::clone(&state.registry),
        ttl: state.ttl.clone(),
        nonce: req.nonce.clone(),
    };

    tracing::debug!(email = %email_hash, nonce = %nonce_hash, "registration waiting for smtp verification");

    // Suspend until the SMTP side fires or the window closes. A client
    // disconnect drops this future here; the guard above still runs.
    tokio::select! {
        _ = wait_rx.recv() => {
            // Fired (or closed by a concurrent replacement); the TTL
            // store below is the source of truth either way.
            tracing::debug!(email = %email_hash, nonce = %nonce_hash, "registration wake-up received");
        }
        _ = tokio::time::sleep(state.config.registration_ttl()) => {
            tracing::warn!(email = %email_hash, nonce = %nonce_hash, "registration timeout");
            return Err(AppError::Timeout(
                "Registration timeout - email verification not received",
            ));
        }
    }

    // The SMTP processor wrote the verified sender before notifying; read
    // it back and insist it matches what this request claims.
    let Some(verified_email) = state.ttl.get(&req.nonce) else {
        tracing::warn!(email = %email_hash, nonce = %nonce_hash, "registration failed: verification expired");
        return Err(AppError::AuthFailure("Verification expired"));
    };

    if !crypto::constant_time_equals(&verified_email, &req.email) {
        tracing::warn!(
            verified = %hash_email(&verified_email),
            claimed = %email_hash,
            nonce = %nonce_hash,
            "registration failed: email mismatch"
        );
        return Err(AppError::AuthFailure("Email verification mismatch"));
    }

    // Single-use proof.
    state.ttl.delete(&req.nonce);

    if state.users.exists(&req.email).await? {
        tracing::warn!(email = %email_hash, "registration failed: user exists");
        return Err(AppError::Conflict("User already registered"));
    }

    // Signature check on the crypto pool. The waiter gives up at the hard
    // cap and treats it as an invalid signature; the task itself is
    // abandoned, not cancelled.
    let (sig_tx, sig_rx) = oneshot::channel();
    {
        let public_key = req.public_key.clone();
        let nonce = req.nonce.clone();
        let signature = req.signature.clone();
        state
            .workers
            .submit_crypto(async move {
                let completed = run_with_timeout(CRYPTO_SOFT_DEADLINE, async move {
                    let _ = sig_tx.send(crypto::verify_signature(
                        &public_key,
                        nonce.as_bytes(),
                        &signature,
                    ));
                })
                .await;
                if !completed {
                    tracing::warn!("signature verification exceeded soft deadline");
                }
            })
            .map_err(|err| {
                tracing::error!(email = %email_hash, error = %err, "registration failed: crypto pool unavailable");
                AppError::Capacity("Registration failed")
            })?;
    }

    match tokio::time::timeout(CRYPTO_HARD_DEADLINE, sig_rx).await {
        Ok(Ok(Ok(true))) => {}
        Ok(Ok(Ok(false))) => {
            tracing::warn!(email = %email_hash, "registration failed: invalid signature");
            return Err(AppError::AuthFailure("Invalid signature"));
        }
        Ok(Ok(Err(err))) => {
            tracing::warn!(email = %email_hash, error = %err, "registration failed: signature error");
            return Err(AppError::AuthFailure("Invalid signature"));
        }
        Ok(Err(_)) | Err(_) => {
            tracing::error!(email = %email_hash, "registration failed: signature verification timed out");
            return Err(AppError::AuthFailure("Invalid signature"));
        }
    }

    // Durable insert on the DB pool, same waiter pattern. The unique
    // constraint resolves the race where two requests for one email both
    // got past the exists check.
    let (db_tx, db_rx) = oneshot::channel();
    {
        let users = Arc::clone(&state.users);
        let user = User {
            email: req.email.clone(),
            username: req.username.clone(),
            public_key: req.public_key.clone(),
        };
        state
            .workers
            .submit_db(async move {
                let completed = run_with_timeout(DB_SOFT_DEADLINE, async move {
                    let _ = db_tx.send(users.add_user(user).await);
                })
                .await;
                if !completed {
                    tracing::warn!("user insert exceeded soft deadline");
                }
            })
            .map_err(|err| {
                tracing::error!(email = %email_hash, error = %err, "registration failed: db pool unavailable");
                AppError::Capacity("Registration failed")
            })?;
    }

    match tokio::time::timeout(DB_HARD_DEADLINE, db_rx).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(UserRepoError::UserExists))) => {
            tracing::warn!(email = %email_hash, "registration failed: user exists");
            return Err(AppError::Conflict("User already registered"));
        }
        Ok(Ok(Err(err))) => {
            tracing::error!(email = %email_hash, username = %username_hash, "registration failed: database error");
            return Err(AppError::Internal(err.into()));
        }
        Ok(Err(_)) | Err(_) => {
            tracing::error!(email = %email_hash, "registration failed: user insert timed out");
            return Err(AppError::Internal(anyhow::anyhow!("user insert timed out")));
        }
    }

    tracing::info!(email = %email_hash, username = %username_hash, "registration completed");
    Ok(Json(StatusResponse { status: "ok".to_string() }))
}
