//! Shared application state for the API server

use crate::panel::TrafficAnalysisPanel;
use crate::preferences::PreferenceStore;
use crate::reporting::NoticeLog;
use crate::service::ExperimentService;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Maximum number of concurrently open panel sessions
pub const MAX_SESSIONS: usize = 32;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Experiment service shared by all sessions
    pub service: Arc<dyn ExperimentService>,
    /// Default-application persistence shared by all sessions
    pub preferences: Arc<dyn PreferenceStore>,
    /// Open panel sessions
    pub sessions: Arc<RwLock<HashMap<Uuid, PanelSession>>>,
}

impl AppState {
    /// Creates a new application state
    pub fn new(service: Arc<dyn ExperimentService>, preferences: Arc<dyn PreferenceStore>) -> Self {
        AppState {
            service,
            preferences,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Looks up a session; the panel is returned so the lock is not held
    /// while the panel fetches.
    pub async fn session(&self, id: Uuid) -> Option<PanelSession> {
        self.sessions.read().await.get(&id).cloned()
    }
}

/// One open panel and the notices it raised.
#[derive(Clone)]
pub struct PanelSession {
    pub id: Uuid,
    pub panel: Arc<TrafficAnalysisPanel>,
    pub notices: Arc<NoticeLog>,
    pub created_at: DateTime<Utc>,
}
