use std::sync::Arc;
use std::time::Instant;

use crate::core::config::{AppConfig, AppPaths, ConfigService};
use crate::pipeline::RagPipeline;

#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub pipeline: Arc<RagPipeline>,
    pub started_at: Instant,
}

impl AppState {
    /// Loads configuration and builds the pipeline from it.
    pub fn initialize(paths: Arc<AppPaths>) -> anyhow::Result<Arc<Self>> {
        let config = ConfigService::new(paths.clone()).load()?;
        Self::with_config(paths, config)
    }

    pub fn with_config(paths: Arc<AppPaths>, config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let pipeline = RagPipeline::from_config(config)?;
        Ok(Self::with_pipeline(paths, pipeline))
    }

    pub fn with_pipeline(paths: Arc<AppPaths>, pipeline: RagPipeline) -> Arc<Self> {
        Arc::new(AppState {
            paths,
            pipeline: Arc::new(pipeline),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        self.pipeline.config()
    }
}
