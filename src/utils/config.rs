use std::env;
use std::path::PathBuf;

use crate::matcher::DEFAULT_MATCH_TOLERANCE;
use crate::pipeline::acquire::DEFAULT_MAX_IMAGE_SIZE;
use crate::pipeline::batch::DEFAULT_BATCH_SIZE;

/// Which content-store adapter the server talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Rclone,
    Local,
}

/// Face detector model variant. `Auto` picks `Accurate` when the host has
/// enough memory and the model file is present, `Fast` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorVariant {
    Accurate,
    Fast,
    Auto,
}

impl DetectorVariant {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "accurate" | "10g" => DetectorVariant::Accurate,
            "fast" | "500m" => DetectorVariant::Fast,
            _ => DetectorVariant::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub port: u16,
    pub remote_location: String,
    pub store_backend: StoreBackend,
    pub local_root: PathBuf,
    pub rclone_bin: String,
    /// Scratch space for a pipeline run; emptied after every batch.
    pub work_dir: PathBuf,
    /// Default destination of acquire-only runs. Kept apart from `work_dir`.
    pub acquire_dir: PathBuf,
    pub batch_size: usize,
    pub max_image_size: u32,
    pub match_tolerance: f32,
    pub detector: DetectorVariant,
    pub models_dir: PathBuf,
    pub model_auto_download: bool,
    /// TrueType font for name captions on labeled images
    pub label_font: Option<PathBuf>,
}

fn flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let data = PathBuf::from(env::var("FACEATLAS_DATA").unwrap_or_else(|_| "/faceatlas-data".to_string()));
        let port = env::var("FACEATLAS_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9171);
        let remote_location = env::var("FACEATLAS_REMOTE").unwrap_or_else(|_| "photos:".to_string());
        let store_backend = match env::var("FACEATLAS_STORE").ok().as_deref() {
            Some("local") => StoreBackend::Local,
            _ => StoreBackend::Rclone,
        };
        let local_root = PathBuf::from(env::var("FACEATLAS_LOCAL_ROOT").unwrap_or_else(|_| "/photos".to_string()));
        let rclone_bin = env::var("FACEATLAS_RCLONE_BIN").unwrap_or_else(|_| "rclone".to_string());
        let work_dir = env::var("FACEATLAS_WORK_DIR").map(PathBuf::from).unwrap_or_else(|_| data.join("work"));
        let acquire_dir = env::var("FACEATLAS_ACQUIRE_DIR").map(PathBuf::from).unwrap_or_else(|_| data.join("acquired"));
        let batch_size = env::var("FACEATLAS_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let max_image_size = env::var("FACEATLAS_MAX_IMAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &u32| *n > 0)
            .unwrap_or(DEFAULT_MAX_IMAGE_SIZE);
        let match_tolerance = env::var("FACEATLAS_MATCH_TOLERANCE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MATCH_TOLERANCE);
        let detector = env::var("FACEATLAS_DETECTOR")
            .map(|v| DetectorVariant::parse(&v))
            .unwrap_or(DetectorVariant::Auto);
        let models_dir = data.join("models");
        let model_auto_download = flag(env::var("FACEATLAS_MODEL_AUTO_DOWNLOAD").ok(), true);
        let label_font = env::var("FACEATLAS_LABEL_FONT").ok().map(PathBuf::from);
        Self {
            data,
            port,
            remote_location,
            store_backend,
            local_root,
            rclone_bin,
            work_dir,
            acquire_dir,
            batch_size,
            max_image_size,
            match_tolerance,
            detector,
            models_dir,
            model_auto_download,
            label_font,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data.join("db").join("faceatlas.db")
    }
}
