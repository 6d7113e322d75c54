use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{
    config::Config,
    repos::UserRepo,
    stores::{MemoryTtlStore, VerificationRegistry},
    workers::WorkManager,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub database: SqlitePool,
    pub users: Arc<dyn UserRepo>,
    pub ttl: MemoryTtlStore,
    pub registry: Arc<VerificationRegistry>,
    pub workers: Arc<WorkManager>,
}
