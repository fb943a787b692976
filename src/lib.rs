pub mod utils;
pub mod stats;
pub mod models;
pub mod db;
pub mod remote;
pub mod pipeline;
pub mod matcher;
pub mod profiles;
pub mod label;
pub mod export;
pub mod jobs;
pub mod api;

use parking_lot::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::matcher::ProfileLibrary;
use crate::pipeline::batch::{BatchPipeline, PipelineSettings};
use crate::pipeline::encode::FaceEncoder;
use crate::remote::ContentStore;
use crate::utils::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub started_at: std::time::Instant,
    pub config: Config,
    pub pool: db::DbPool,
    pub stats: Arc<stats::Stats>,
    pub content: Arc<dyn ContentStore>,
    pub encoder: FaceEncoder,
    // Enrollment swaps the snapshot; runs already in flight keep the old one
    pub library: Arc<RwLock<Arc<ProfileLibrary>>>,
    pub indexer_busy: Arc<AtomicBool>,
    pub caption_font: Option<rusttype::Font<'static>>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: db::DbPool,
        content: Arc<dyn ContentStore>,
        encoder: FaceEncoder,
        library: ProfileLibrary,
    ) -> Self {
        let caption_font = label::load_caption_font(config.label_font.as_deref());
        Self {
            started_at: std::time::Instant::now(),
            config,
            pool,
            stats: Arc::new(stats::Stats::new()),
            content,
            encoder,
            library: Arc::new(RwLock::new(Arc::new(library))),
            indexer_busy: Arc::new(AtomicBool::new(false)),
            caption_font,
        }
    }

    pub fn library_snapshot(&self) -> Arc<ProfileLibrary> {
        self.library.read().clone()
    }

    pub fn replace_library(&self, library: ProfileLibrary) {
        *self.library.write() = Arc::new(library);
    }

    /// A pipeline bound to the current profile snapshot.
    pub fn pipeline(&self) -> BatchPipeline {
        BatchPipeline::new(
            self.pool.clone(),
            self.content.clone(),
            self.encoder.clone(),
            self.library_snapshot(),
            PipelineSettings::from_config(&self.config),
            self.stats.clone(),
        )
    }
}
