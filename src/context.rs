use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::CallTracker;
use crate::core::engine::{QueryEngine, create_engine};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub engine: Arc<dyn QueryEngine>,
    pub tracker: CallTracker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let engine = create_engine(config.max_block_size);
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: AppConfig, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            tracker: CallTracker::new(),
        }
    }
}
