pub mod config;
pub mod generate;
pub mod limiter;
pub mod rpm;
pub mod sink;
pub mod storage;
pub mod web;
pub mod worker;

use std::sync::Arc;

use rpm::ModelRpmService;
use storage::task::TaskStore;

/// Shared state handed to the HTTP layer.
pub struct AppContext {
    pub store: Arc<dyn TaskStore>,
    pub rpm: Arc<ModelRpmService>,
}
