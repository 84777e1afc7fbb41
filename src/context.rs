use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::sink::{BundleFactory, ContainerFactory};
use crate::core::volume::{SystemVolumes, VolumeInfo};

/// Configuration plus the external collaborators a job needs.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub volumes: Arc<dyn VolumeInfo>,
    pub containers: Arc<dyn ContainerFactory>,
}

impl EngineContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            volumes: Arc::new(SystemVolumes),
            containers: Arc::new(BundleFactory),
        }
    }

    pub fn with_volumes(mut self, volumes: Arc<dyn VolumeInfo>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_containers(mut self, containers: Arc<dyn ContainerFactory>) -> Self {
        self.containers = containers;
        self
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
