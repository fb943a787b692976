//! The end-to-end run: index, acquire one image at a time, and every
//! `batch_size` images encode, match and commit.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, DbPool};
use crate::matcher::{MatchStrategy, ProfileLibrary};
use crate::pipeline::acquire::{self, AcquireOutcome, AcquireSettings, AcquiredImage};
use crate::pipeline::catalog::{self, CatalogSummary};
use crate::pipeline::encode::FaceEncoder;
use crate::pipeline::Stage;
use crate::remote::ContentStore;
use crate::stats::Stats;
use crate::utils::config::Config;

pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub batch_size: usize,
    pub max_size: u32,
    pub tolerance: f32,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            work_dir: cfg.work_dir.clone(),
            batch_size: cfg.batch_size.max(1),
            max_size: cfg.max_image_size,
            tolerance: cfg.match_tolerance,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogSummary>,
    pub acquired: usize,
    /// Images taken from an earlier acquire-only run instead of fetched again
    pub reused: usize,
    pub skipped: usize,
    pub processed: usize,
    /// Images whose encoding failed; left unprocessed for the next run
    pub failed: usize,
    pub faces: usize,
}

pub struct BatchPipeline {
    pool: DbPool,
    content: Arc<dyn ContentStore>,
    encoder: FaceEncoder,
    library: Arc<ProfileLibrary>,
    settings: PipelineSettings,
    stats: Arc<Stats>,
}

/// First occurrence of each name, in order.
fn dedup_names(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for n in names {
        if !out.contains(&n) {
            out.push(n);
        }
    }
    out
}

/// Remove the regular files directly under `dir`. Subdirectories are left alone.
async fn clear_work_dir(dir: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Failed to remove {:?}: {}", entry.path(), e);
            }
        }
    }
    Ok(())
}

impl BatchPipeline {
    pub fn new(
        pool: DbPool,
        content: Arc<dyn ContentStore>,
        encoder: FaceEncoder,
        library: Arc<ProfileLibrary>,
        settings: PipelineSettings,
        stats: Arc<Stats>,
    ) -> Self {
        Self { pool, content, encoder, library, settings, stats }
    }

    fn enter(&self, stage: Stage) {
        debug!(stage = stage.as_str(), "pipeline stage");
    }

    /// Index `location`, then process everything still pending.
    pub async fn run(&self, location: &str) -> Result<RunSummary> {
        self.enter(Stage::Indexing);
        let indexed = catalog::index_catalog(&self.pool, self.content.as_ref(), location).await?;
        self.stats.inc_indexed(indexed.indexed as u64);
        let mut summary = self.process(location).await?;
        summary.catalog = Some(indexed);
        Ok(summary)
    }

    /// Process every catalog entry that is neither processed nor skipped.
    pub async fn process(&self, location: &str) -> Result<RunSummary> {
        self.stats.start_run();
        let result = self.process_pending(location).await;
        self.stats.finish_run();
        if let Ok(s) = &result {
            info!(
                "Run finished: {} acquired ({} reused), {} skipped, {} processed, {} failed, {} faces",
                s.acquired, s.reused, s.skipped, s.processed, s.failed, s.faces
            );
        }
        result
    }

    async fn process_pending(&self, location: &str) -> Result<RunSummary> {
        let report = db::with_conn(&self.pool, db::query::check_consistency).await?;
        if !report.is_consistent() {
            let repaired = db::with_conn(&self.pool, db::writer::repair_consistency).await?;
            warn!(
                "Identity mappings out of step ({} forward, {} inverse missing); repaired {} rows",
                report.missing_forward.len(),
                report.missing_inverse.len(),
                repaired
            );
        }
        let pending = db::with_conn(&self.pool, db::query::pending_for_processing).await?;
        info!("Processing {} pending images in batches of {}", pending.len(), self.settings.batch_size);
        let acquire_settings = AcquireSettings {
            folder: self.settings.work_dir.clone(),
            max_size: self.settings.max_size,
        };
        let mut summary = RunSummary::default();
        let mut batch: Vec<AcquiredImage> = Vec::with_capacity(self.settings.batch_size);

        self.enter(Stage::Acquiring);
        for (hash, path) in pending {
            let (h, scratch) = (hash.clone(), self.settings.work_dir.clone());
            let reusable = db::with_conn(&self.pool, move |conn| {
                Ok(db::query::downloaded_path(conn, &h)?
                    .and_then(|p| acquire::existing_copy(&h, Path::new(&p), &scratch)))
            })
            .await?;
            if let Some(img) = reusable {
                debug!("Using acquired copy of {} at {:?}", hash, img.local_path);
                summary.reused += 1;
                batch.push(img);
            } else {
                let outcome = match acquire::acquire_image(self.content.as_ref(), location, &hash, &path, &acquire_settings)
                    .await
                {
                    Ok(o) => o,
                    Err(e) => {
                        warn!("Acquire aborted for {}: {:#}", hash, e);
                        continue;
                    }
                };
                let h = hash.clone();
                let recorded = outcome.clone();
                db::with_conn(&self.pool, move |conn| acquire::record_outcome(conn, &h, &recorded)).await?;
                match outcome {
                    AcquireOutcome::Acquired(img) => {
                        summary.acquired += 1;
                        self.stats.inc_acquired(1);
                        batch.push(img);
                    }
                    AcquireOutcome::Skipped(reason) => {
                        debug!("Skipped {}: {}", hash, reason);
                        summary.skipped += 1;
                        self.stats.inc_skipped(1);
                    }
                }
            }
            if batch.len() >= self.settings.batch_size {
                self.flush(&mut batch, &mut summary).await?;
                self.enter(Stage::Acquiring);
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &mut summary).await?;
        }
        self.enter(Stage::Done);
        Ok(summary)
    }

    /// Encode, match and commit one batch, then mark it processed and empty
    /// the work directory. Reused copies live outside it and survive. Images that failed to encode are neither processed
    /// nor skipped.
    async fn flush(&self, batch: &mut Vec<AcquiredImage>, summary: &mut RunSummary) -> Result<()> {
        self.enter(Stage::Encoding);
        let paths: Vec<PathBuf> = batch.iter().map(|img| img.local_path.clone()).collect();
        let encoder = self.encoder.clone();
        let results = tokio::task::spawn_blocking(move || encoder.encode_files(&paths)).await?;

        let strategy = MatchStrategy::DistanceThreshold { tolerance: self.settings.tolerance };
        let mut commits: Vec<(String, Vec<String>, usize)> = Vec::new();
        for (img, result) in batch.iter().zip(results) {
            match result {
                Ok(faces) => {
                    let names = faces
                        .iter()
                        .map(|f| self.library.best_match(&f.embedding, strategy).name)
                        .collect();
                    commits.push((img.hash.clone(), dedup_names(names), faces.len()));
                }
                Err(e) => {
                    warn!("Encoding failed for {}, retrying next run: {:#}", img.hash, e);
                    summary.failed += 1;
                    self.stats.inc_encode_failures(1);
                }
            }
        }

        self.enter(Stage::Committing);
        let processed = commits.len();
        let faces: usize = commits.iter().map(|(_, _, n)| *n).sum();
        db::with_conn(&self.pool, move |conn| {
            for (hash, names, _) in &commits {
                db::writer::record_image_faces(conn, hash, names)?;
            }
            let done: Vec<(String, usize)> = commits.into_iter().map(|(h, _, n)| (h, n)).collect();
            db::writer::mark_processed(conn, &done)
        })
        .await?;
        summary.processed += processed;
        summary.faces += faces;
        self.stats.inc_processed(processed as u64);
        self.stats.inc_faces(faces as u64);
        self.stats.inc_batches(1);
        info!("Committed batch: {} processed, {} faces", processed, faces);

        clear_work_dir(&self.settings.work_dir).await?;
        batch.clear();
        Ok(())
    }
}
