use crate::{
    config::MonitorConfig, monitor::MonitorHandle, store::MetricsStore, trigger::TriggerManager,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MonitorConfig>,
    pub store: Arc<dyn MetricsStore>,
    pub triggers: TriggerManager,
    /// Absent when the API is served without a running loop.
    pub monitor: Option<MonitorHandle>,
}

impl AppState {
    pub fn new(
        config: Arc<MonitorConfig>,
        store: Arc<dyn MetricsStore>,
        monitor: Option<MonitorHandle>,
    ) -> Self {
        let triggers = TriggerManager::new(Arc::clone(&store), config.triggers.clone());
        Self {
            config,
            store,
            triggers,
            monitor,
        }
    }
}
