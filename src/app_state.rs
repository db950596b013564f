use std::sync::Arc;

use crate::broker::QueueBroker;
use crate::db::store::StateStore;
use crate::profiles::ProfileRegistry;
use crate::services::vision::OllamaClient;

/// Shared state for the health/metrics/admin routes.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub broker: Arc<dyn QueueBroker>,
    pub profiles: Arc<ProfileRegistry>,
    pub model: Arc<OllamaClient>,
}

impl AppState {
    pub fn new(
        store: StateStore,
        broker: Arc<dyn QueueBroker>,
        profiles: Arc<ProfileRegistry>,
        model: Arc<OllamaClient>,
    ) -> Self {
        Self {
            store,
            broker,
            profiles,
            model,
        }
    }
}
