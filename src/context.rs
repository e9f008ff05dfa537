use crate::config::AppConfig;
use crate::core::{DedupIndex, FsOps};
use std::sync::Arc;

/// Everything a backup component needs, passed explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub fs: Arc<dyn FsOps>,
    pub index: Arc<dyn DedupIndex>,
}

impl AppContext {
    pub fn new(config: AppConfig, fs: Arc<dyn FsOps>, index: Arc<dyn DedupIndex>) -> Self {
        Self {
            config: Arc::new(config),
            fs,
            index,
        }
    }
}
