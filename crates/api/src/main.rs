mod config;
mod crypto;
mod error;
mod handlers;
mod models;
mod repos;
mod smtp;
mod state;
mod stores;
#[cfg(test)]
mod test_utils;
mod utils;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, http};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::{Config, VerifyMode},
    repos::SqliteUserRepo,
    smtp::{
        MailAuthDkimVerifier, MailAuthSpfVerifier, NonceProcessor, SmtpConfig, SmtpServer,
    },
    state::AppState,
    stores::{MemoryTtlStore, SlidingWindowLimiter, VerificationRegistry},
    workers::{WorkManager, WorkManagerConfig},
};

/// Sender-address rate limit on the SMTP side: 10 attempts per 5 minutes.
const SMTP_RATE_LIMIT_MAX: usize = 10;
const SMTP_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = envy::prefixed("VOUCH_")
        .from_env::<Config>()
        .context("loading configuration from environment")?;
    let verify_mode = config.verify_mode()?;

    // Set up tracing: JSON in production, human-readable otherwise
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }

    let database = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true),
        )
        .await
        .context("opening sqlite database")?;
    restrict_database_permissions(&config.database_path);

    let users = Arc::new(
        SqliteUserRepo::new(database.clone())
            .await
            .context("initializing users table")?,
    );

    let ttl = MemoryTtlStore::new();
    let registry = Arc::new(VerificationRegistry::new());
    let workers = Arc::new(WorkManager::new(WorkManagerConfig {
        db_workers: config.db_workers,
        crypto_workers: config.crypto_workers,
        smtp_workers: config.smtp_workers,
        queue_size: config.worker_queue_size,
    }));

    // Verification SMTP listener on its own task.
    let (smtp_shutdown_tx, smtp_shutdown_rx) = watch::channel(false);
    {
        let processor = NonceProcessor {
            ttl: ttl.clone(),
            registry: Arc::clone(&registry),
            rate_limiter: SlidingWindowLimiter::new(SMTP_RATE_LIMIT_MAX, SMTP_RATE_LIMIT_WINDOW),
            verified_ttl: config.registration_ttl(),
        };
        let smtp_server = SmtpServer::new(
            SmtpConfig {
                domain: config.smtp_domain.clone(),
                recipient_prefix: config.smtp_recipient_prefix.clone(),
                max_recipients: config.smtp_max_recipients,
                max_message_bytes: config.smtp_max_message_bytes,
                spf_enabled: config.smtp_spf_enabled,
                dkim_enabled: config.smtp_dkim_enabled,
                verify_mode,
            },
            processor,
            Arc::clone(&workers),
            Arc::new(MailAuthSpfVerifier::new(&config.smtp_domain)?),
            Arc::new(MailAuthDkimVerifier::new()?),
        );
        let smtp_listener = TcpListener::bind(&config.smtp_listen_addr)
            .await
            .with_context(|| format!("binding smtp listener on {}", config.smtp_listen_addr))?;
        if verify_mode == VerifyMode::Unrestricted {
            tracing::warn!("smtp sender-identity checks are disabled (verify mode: unrestricted)");
        }
        tokio::spawn(smtp_server.serve(smtp_listener, smtp_shutdown_rx));
    }

    let state = AppState {
        config: config.clone(),
        database,
        users,
        ttl: ttl.clone(),
        registry,
        workers: Arc::clone(&workers),
    };

    // Request ID header name
    let x_request_id = http::HeaderName::from_static("x-request-id");

    let app = Router::new()
        .merge(handlers::health::router())
        .merge(handlers::register::router())
        .with_state(state)
        // Request ID: generate UUID, include in logs, return in response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &http::Request<axum::body::Body>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            },
        ))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(RequestBodyLimitLayer::new(config.max_request_body_bytes()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop ingress first, then drain the pools.
    let _ = smtp_shutdown_tx.send(true);
    workers.close().await;
    ttl.shutdown();

    tracing::info!("shutdown complete");

    Ok(())
}

/// Best-effort tightening of the database file to owner read/write only.
fn restrict_database_permissions(path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) =
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::warn!(path, error = %err, "failed to restrict database file permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("received SIGTERM, shutting down..."),
    }
}
