use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::services::alerts::AlertManager;
use crate::services::fanout::RealtimeFanout;
use crate::services::readings::{IngestStats, ReadingStore};
use crate::services::thresholds::ThresholdCatalog;

#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub db: PgPool,
    pub stats: Arc<IngestStats>,
    pub store: Arc<ReadingStore>,
    pub alerts: Arc<AlertManager>,
    pub thresholds: Arc<ThresholdCatalog>,
    pub fanout: Arc<RealtimeFanout>,
    /// Fires when the process is shutting down; long-lived connections
    /// (websocket sessions) watch it and close.
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
