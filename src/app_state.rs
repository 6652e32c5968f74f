use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{queue::JobQueue, session::SessionStore, storage::ObjectStorage};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ObjectStorage>,
    pub queue: Arc<JobQueue>,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: ObjectStorage,
        queue: JobQueue,
        sessions: Arc<SessionStore>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            queue: Arc::new(queue),
            sessions,
            config: Arc::new(config),
        }
    }
}
