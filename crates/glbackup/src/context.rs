use std::sync::Arc;

use crate::api::MetadataSource;
use crate::config::Config;
use crate::engine::Pool;
use crate::process::ChildRegistry;

/// Everything a worker needs, shared read-only across threads.
#[derive(Clone)]
pub struct Context {
    pub cfg: Arc<Config>,
    pub api: Arc<dyn MetadataSource>,
    pub registry: ChildRegistry,
}

impl Context {
    pub fn new(cfg: Config, api: Arc<dyn MetadataSource>, registry: ChildRegistry) -> Self {
        Self {
            cfg: Arc::new(cfg),
            api,
            registry,
        }
    }

    pub fn pool(&self) -> Pool {
        Pool::new(
            self.cfg.workers,
            self.cfg.poll_interval,
            self.registry.clone(),
        )
    }
}
