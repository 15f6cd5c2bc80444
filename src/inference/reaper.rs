//! Inactivity reaper
//!
//! Checked at the top of every generation call, not on a timer: an idle model
//! stays resident until the next request arrives.

use std::time::Duration;

use crate::inference::manager::ModelManager;
use crate::storage::settings::Settings;

#[derive(Debug, Clone)]
pub struct InactivityReaper {
    enabled: bool,
    timeout: Duration,
}

impl InactivityReaper {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self { enabled, timeout }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.unload_unused_models, settings.model_timeout())
    }

    /// Unload the active model if it has been idle past the timeout.
    /// Returns true if a model was unloaded.
    pub async fn check(&self, manager: &ModelManager) -> bool {
        if !self.enabled {
            return false;
        }

        match manager.unload_if_idle(self.timeout).await {
            Some(model_id) => {
                tracing::info!(
                    "Unloading model {} due to inactivity ({}s timeout)",
                    model_id,
                    self.timeout.as_secs()
                );
                true
            }
            None => false,
        }
    }
}
