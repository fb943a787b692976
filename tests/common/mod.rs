#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use faceatlas::db::{self, DbPool};
use faceatlas::matcher::{Profile, ProfileLibrary};
use faceatlas::models::image::BoundingBox;
use faceatlas::pipeline::encode::{Detection, FaceEncoder, FaceModel};
use faceatlas::remote::{join_remote, ContentStore, RemoteEntry};
use faceatlas::utils::config::Config;
use faceatlas::AppState;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const LOCATION: &str = "mem:";

static LOGGING: Once = Once::new();

/// Route tracing output through the test harness; safe to call from every test.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(faceatlas::utils::logging::env_filter())
            .with_test_writer()
            .init();
    });
}

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];
/// Detection fails on this color
pub const MAGENTA: [u8; 3] = [255, 0, 255];

/// Create a temporary SQLite database and pool for testing
pub fn setup_test_db() -> (TempDir, DbPool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::create_pool(tmp.path().join("db").join("faceatlas.db"), 4).unwrap();
    (tmp, pool)
}

/// Solid-color JPEG
pub fn jpeg(w: u32, h: u32, color: [u8; 3]) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(color)));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(95)).unwrap();
    out
}

pub fn png(w: u32, h: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([10, 20, 30])));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png).unwrap();
    out
}

/// In-memory content store. Files are keyed by their full remote path.
#[derive(Default)]
pub struct MemoryStore {
    pub entries: Mutex<Vec<RemoteEntry>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<Vec<String>>,
    pub fail_listing: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// List an entry without backing bytes, so fetching it fails.
    pub fn add_listing(&self, path: &str, hash: &str, mime: &str) {
        let mut hashes = HashMap::new();
        if !hash.is_empty() {
            hashes.insert("MD5".to_string(), hash.to_string());
        }
        self.entries.lock().push(RemoteEntry {
            path: path.to_string(),
            mime_type: mime.to_string(),
            size: 0,
            hashes,
        });
    }

    pub fn add(&self, path: &str, hash: &str, mime: &str, bytes: Vec<u8>) {
        self.add_listing(path, hash, mime);
        self.files.lock().insert(join_remote(LOCATION, path), bytes);
    }

    pub fn add_jpeg(&self, path: &str, hash: &str, color: [u8; 3]) {
        self.add(path, hash, "image/jpeg", jpeg(64, 48, color));
    }

    pub fn has_file(&self, remote: &str) -> bool {
        self.files.lock().contains_key(remote)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn list(&self, _location: &str) -> Result<Vec<RemoteEntry>> {
        if *self.fail_listing.lock() {
            anyhow::bail!("listing unavailable");
        }
        Ok(self.entries.lock().clone())
    }

    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        let bytes = self
            .files
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("not found: {}", source))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let mut files = self.files.lock();
        let bytes = files.get(source).cloned().ok_or_else(|| anyhow::anyhow!("not found: {}", source))?;
        files.insert(dest.to_string(), bytes);
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        self.dirs.lock().push(dir.to_string());
        Ok(())
    }
}

/// One face covering the whole image, embedded as the unit vector of its
/// center color. Black images have no face; magenta ones fail detection.
pub struct ColorFaceModel;

fn center_color(image: &DynamicImage) -> [f32; 3] {
    let rgb = image.to_rgb8();
    let p = rgb.get_pixel(rgb.width() / 2, rgb.height() / 2);
    [p[0] as f32, p[1] as f32, p[2] as f32]
}

impl FaceModel for ColorFaceModel {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let [r, g, b] = center_color(image);
        if r > 200.0 && b > 200.0 && g < 60.0 {
            anyhow::bail!("detector rejected image");
        }
        if r + g + b < 60.0 {
            return Ok(vec![]);
        }
        Ok(vec![Detection {
            bbox: BoundingBox { top: 0, right: image.width() - 1, bottom: image.height() - 1, left: 0 },
            confidence: 0.99,
        }])
    }

    fn embed(&self, image: &DynamicImage, _bbox: &BoundingBox) -> Result<Vec<f32>> {
        let c = center_color(image);
        let norm = (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt();
        Ok(c.iter().map(|v| v / norm).collect())
    }
}

pub fn color_encoder() -> FaceEncoder {
    FaceEncoder::new(Arc::new(ColorFaceModel))
}

/// Alice is red, Bob is green.
pub fn alice_and_bob() -> ProfileLibrary {
    ProfileLibrary::new(vec![
        Profile { name: "Alice".into(), references: vec![vec![1.0, 0.0, 0.0]] },
        Profile { name: "Bob".into(), references: vec![vec![0.0, 1.0, 0.0]] },
    ])
}

pub fn test_config(data: &Path) -> Config {
    let mut cfg = Config::from_env();
    cfg.data = data.to_path_buf();
    cfg.work_dir = data.join("work");
    cfg.acquire_dir = data.join("acquired");
    cfg.models_dir = data.join("models");
    cfg.remote_location = LOCATION.to_string();
    cfg.batch_size = 2;
    cfg.max_image_size = 1024;
    cfg.match_tolerance = 1.0;
    cfg
}

pub fn create_test_app_state(data: &Path, pool: DbPool, store: Arc<MemoryStore>) -> Arc<AppState> {
    Arc::new(AppState::new(test_config(data), pool, store, color_encoder(), alice_and_bob()))
}

/// Helper to make HTTP requests to test server
pub struct TestClient {
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestClient {
    pub fn new(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(&format!("{}{}", self.base_url, path)).send().await
    }

    pub async fn post(&self, path: &str, json: &serde_json::Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .json(json)
            .send()
            .await
    }

    pub async fn post_bytes(&self, path: &str, body: Vec<u8>) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await
    }

    pub async fn post_raw(&self, path: &str, content_type: &str, body: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .header("content-type", content_type)
            .body(body.to_string())
            .send()
            .await
    }

    pub async fn post_empty(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.post(&format!("{}{}", self.base_url, path)).send().await
    }

    pub async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.delete(&format!("{}{}", self.base_url, path)).send().await
    }

    /// Poll a job until it reaches done or failed.
    pub async fn wait_for_job(&self, id: i64) -> serde_json::Value {
        for _ in 0..300 {
            let job: serde_json::Value = self.get(&format!("/jobs/{}", id)).await.unwrap().json().await.unwrap();
            if job["status"] == "done" || job["status"] == "failed" {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job {} never finished", id);
    }
}

/// Serve the router on an ephemeral port.
pub async fn spawn_server(state: Arc<AppState>) -> TestClient {
    init_test_logging();
    let app = faceatlas::api::routes::router(state);
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestClient::new(port)
}
