//! Shared application state for the HTTP layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::inference::{GenerationEngine, ModelManager};
use crate::storage::settings::Settings;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GenerationEngine>,
    pub settings: Arc<Settings>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
    requests: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(engine: Arc<GenerationEngine>, settings: Settings) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            started_at: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        self.engine.manager()
    }

    /// Count a request and return the new total
    pub fn record_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}
