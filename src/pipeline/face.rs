//! SCRFD detection and ArcFace embedding through ONNX Runtime.

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::image::BoundingBox;
use crate::pipeline::encode::{Detection, FaceModel};
use crate::utils::config::{Config, DetectorVariant};

const SCRFD_FAST_FILE: &str = "scrfd_500m_bnkps.onnx";
const SCRFD_ACCURATE_FILE: &str = "scrfd_10g_bnkps.onnx";
const ARCFACE_FILE: &str = "w600k_r50.onnx";

const SCRFD_FAST_URL_HF: &str = "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";
const SCRFD_FAST_URL_GH: &str = "https://github.com/deepinsight/insightface/releases/download/v0.7/scrfd_500m_bnkps.onnx";
const ARCFACE_URL: &str = "https://huggingface.co/maze/faceX/resolve/e010b5098c3685fd00b22dd2aec6f37320e3d850/w600k_r50.onnx";

const DETECT_SIZE: u32 = 640;
const EMBED_SIZE: u32 = 112;
const STRIDES: [u32; 3] = [8, 16, 32];
// Below this much RAM `Auto` picks the fast detector
const ACCURATE_MIN_MEMORY: u64 = 8 * 1024 * 1024 * 1024;
const MIN_FACE_PX: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

pub struct OnnxFaceModel {
    models_dir: PathBuf,
    variant: DetectorVariant,
    auto_download: bool,
    confidence_threshold: f32,
    nms_iou_threshold: f32,
    detector: Option<Mutex<Session>>,
    recognizer: Option<Mutex<Session>>,
    loaded_variant: Option<DetectorVariant>,
}

impl OnnxFaceModel {
    pub fn new(config: &Config) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            variant: config.detector,
            auto_download: config.model_auto_download,
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.4,
            detector: None,
            recognizer: None,
            loaded_variant: None,
        }
    }

    pub fn loaded_variant(&self) -> Option<DetectorVariant> {
        self.loaded_variant
    }

    pub async fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.models_dir).context("Failed to create models directory")?;
        if self.auto_download {
            if let Err(e) = self.download_models().await {
                warn!("Face model auto-download failed: {:#}", e);
            }
        } else {
            info!("Face model auto-download disabled.");
        }
        self.load_models()
    }

    fn resolve_variant(&self) -> DetectorVariant {
        match self.variant {
            DetectorVariant::Auto => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                let total = sys.total_memory();
                let accurate_present = self.models_dir.join(SCRFD_ACCURATE_FILE).exists();
                if total >= ACCURATE_MIN_MEMORY && accurate_present {
                    DetectorVariant::Accurate
                } else {
                    debug!("Auto detector: {} bytes RAM, accurate model present: {}", total, accurate_present);
                    DetectorVariant::Fast
                }
            }
            v => v,
        }
    }

    async fn download_models(&self) -> Result<()> {
        let fast_path = self.models_dir.join(SCRFD_FAST_FILE);
        let arcface_path = self.models_dir.join(ARCFACE_FILE);
        let client = create_http_client()?;

        // The accurate detector has no stable public mirror; it must be placed by hand
        if !fast_path.exists() {
            info!("Downloading SCRFD face detection model...");
            if let Err(e) = download_file(&client, SCRFD_FAST_URL_HF, &fast_path).await {
                warn!("Failed to download from Hugging Face: {}. Trying GitHub...", e);
                download_file(&client, SCRFD_FAST_URL_GH, &fast_path).await?;
            }
        }
        if !arcface_path.exists() {
            info!("Downloading ArcFace recognition model ({})...", ARCFACE_FILE);
            download_file(&client, ARCFACE_URL, &arcface_path).await?;
        }
        Ok(())
    }

    fn load_models(&mut self) -> Result<()> {
        let arcface_path = self.models_dir.join(ARCFACE_FILE);
        let recognizer = Session::builder()?
            .commit_from_file(&arcface_path)
            .with_context(|| format!("Failed to create ArcFace session from {:?}", arcface_path))?;

        let wanted = self.resolve_variant();
        let (detector, loaded) = match wanted {
            DetectorVariant::Accurate => match load_session(&self.models_dir.join(SCRFD_ACCURATE_FILE)) {
                Ok(s) => (s, DetectorVariant::Accurate),
                Err(e) => {
                    warn!("Accurate detector unavailable ({:#}); falling back to fast detector", e);
                    (load_session(&self.models_dir.join(SCRFD_FAST_FILE))?, DetectorVariant::Fast)
                }
            },
            _ => (load_session(&self.models_dir.join(SCRFD_FAST_FILE))?, DetectorVariant::Fast),
        };

        self.detector = Some(Mutex::new(detector));
        self.recognizer = Some(Mutex::new(recognizer));
        self.loaded_variant = Some(loaded);
        info!("Face models loaded: detector={:?} recognizer={:?}", loaded, arcface_path);
        Ok(())
    }

    /// Letterbox into the detector square (top-left aligned), BGR, [-1, 1].
    fn preprocess_detect(image: &DynamicImage, out: &mut Vec<f32>) -> f32 {
        let (ow, oh) = (image.width() as f32, image.height() as f32);
        let scale = DETECT_SIZE as f32 / ow.max(oh);
        let nw = ((ow * scale) as u32).max(1);
        let nh = ((oh * scale) as u32).max(1);
        let resized = image.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
        let mut padded = DynamicImage::new_rgb8(DETECT_SIZE, DETECT_SIZE);
        image::imageops::overlay(&mut padded, &resized, 0, 0);
        let rgb = padded.to_rgb8();
        for c in [2usize, 1, 0] {
            for p in rgb.pixels() {
                out.push((p[c] as f32 - 127.5) / 128.0);
            }
        }
        scale
    }

    /// Per-stride (scores, boxes) for the whole batch, flattened.
    fn run_detector(&self, data: Vec<f32>, n: usize) -> Result<Vec<(Vec<f32>, Vec<f32>)>> {
        let mut session = self.detector.as_ref().context("Detection model not loaded")?.lock();
        let input_name = session.inputs[0].name.clone();
        let shape = vec![n as i64, 3, DETECT_SIZE as i64, DETECT_SIZE as i64];
        let input = Value::from_array((shape, data)).context("Failed to create SCRFD input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("SCRFD inference failed")?;
        let keys: Vec<String> = outputs.keys().map(|k| k.to_string()).collect();

        let mut per_stride = Vec::with_capacity(STRIDES.len());
        for (k, stride) in STRIDES.iter().enumerate() {
            // Named outputs first; otherwise insightface order: scores x3, boxes x3, keypoints x3
            let named = (outputs.get(&format!("score_{}", stride)), outputs.get(&format!("bbox_{}", stride)));
            let (sv, bv) = match named {
                (Some(sv), Some(bv)) => (sv, bv),
                _ => match (keys.get(k), keys.get(k + STRIDES.len())) {
                    (Some(sk), Some(bk)) => (
                        outputs.get(sk.as_str()).context("missing score output")?,
                        outputs.get(bk.as_str()).context("missing bbox output")?,
                    ),
                    _ => anyhow::bail!("SCRFD outputs not recognized: {:?}", keys),
                },
            };
            let (_, scores) = sv.try_extract_tensor::<f32>()?;
            let (_, boxes) = bv.try_extract_tensor::<f32>()?;
            per_stride.push((scores.to_vec(), boxes.to_vec()));
        }
        Ok(per_stride)
    }

    fn to_detections(&self, raw: Vec<RawBox>) -> Vec<Detection> {
        let keep = nms(&raw, self.nms_iou_threshold);
        keep.into_iter()
            .map(|i| {
                let b = raw[i];
                Detection {
                    bbox: BoundingBox {
                        top: b.y1.floor() as u32,
                        right: b.x2.ceil() as u32,
                        bottom: b.y2.ceil() as u32,
                        left: b.x1.floor() as u32,
                    },
                    confidence: b.confidence,
                }
            })
            .collect()
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        Ok(self.detect_batch(&[image])?.into_iter().next().unwrap_or_default())
    }

    fn detect_batch(&self, images: &[&DynamicImage]) -> Result<Vec<Vec<Detection>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let n = images.len();
        let mut data = Vec::with_capacity(n * 3 * (DETECT_SIZE * DETECT_SIZE) as usize);
        let scales: Vec<f32> = images.iter().map(|img| Self::preprocess_detect(img, &mut data)).collect();
        let per_stride = self.run_detector(data, n)?;

        let mut out = Vec::with_capacity(n);
        for (i, img) in images.iter().enumerate() {
            let mut raw = Vec::new();
            for ((scores, boxes), stride) in per_stride.iter().zip(STRIDES) {
                if scores.len() % n != 0 || boxes.len() % n != 0 {
                    anyhow::bail!("SCRFD stride {} output not divisible by batch size {}", stride, n);
                }
                let (s_len, b_len) = (scores.len() / n, boxes.len() / n);
                decode_stride(
                    &scores[i * s_len..(i + 1) * s_len],
                    &boxes[i * b_len..(i + 1) * b_len],
                    stride,
                    scales[i],
                    (img.width() as f32, img.height() as f32),
                    self.confidence_threshold,
                    &mut raw,
                );
            }
            out.push(self.to_detections(raw));
        }
        Ok(out)
    }

    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<f32>> {
        let crop = image.crop_imm(bbox.left, bbox.top, bbox.width().max(1), bbox.height().max(1));
        let rgb = crop
            .resize_exact(EMBED_SIZE, EMBED_SIZE, image::imageops::FilterType::Triangle)
            .to_rgb8();
        let mut data = Vec::with_capacity(3 * (EMBED_SIZE * EMBED_SIZE) as usize);
        for c in 0..3 {
            for p in rgb.pixels() {
                data.push((p[c] as f32 - 127.5) / 128.0);
            }
        }

        let mut session = self.recognizer.as_ref().context("Recognition model not loaded")?.lock();
        let input_name = session.inputs[0].name.clone();
        let shape = vec![1i64, 3, EMBED_SIZE as i64, EMBED_SIZE as i64];
        let input = Value::from_array((shape, data)).context("Failed to create ArcFace input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("ArcFace inference failed")?;
        let key = outputs
            .keys()
            .find(|k| matches!(*k, "output" | "embedding" | "fc1" | "features"))
            .or_else(|| outputs.keys().next())
            .map(|k| k.to_string())
            .context("ArcFace produced no outputs")?;
        let value = outputs.get(key.as_str()).context("ArcFace output vanished")?;
        let (_, slice) = value.try_extract_tensor::<f32>()?;
        let mut v = slice.to_vec();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            anyhow::bail!("ArcFace embedding has zero norm");
        }
        for x in &mut v {
            *x /= norm;
        }
        Ok(v)
    }
}

fn load_session(path: &Path) -> Result<Session> {
    if !path.exists() {
        anyhow::bail!("model file missing: {:?}", path);
    }
    Session::builder()?
        .commit_from_file(path)
        .with_context(|| format!("Failed to create SCRFD session from {:?}", path))
}

fn create_http_client() -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}

async fn download_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download model from {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }
    let bytes = response.bytes().await.context("Failed to read response body")?;
    // ONNX files are never this small; an HTML error page usually is
    if bytes.len() < 1024 {
        anyhow::bail!("Downloaded file is suspiciously small ({} bytes)", bytes.len());
    }
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("Failed to write file: {:?}", tmp))?;
    tokio::fs::rename(&tmp, path).await?;
    info!("Downloaded model to {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Turn one stride's anchor grid into boxes in original-image pixels.
/// `boxes` holds (left, top, right, bottom) distances in stride units.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    scale: f32,
    (img_w, img_h): (f32, f32),
    threshold: f32,
    out: &mut Vec<RawBox>,
) {
    let side = (DETECT_SIZE / stride) as usize;
    let points = side * side;
    if points == 0 || scores.len() % points != 0 || boxes.len() < scores.len() * 4 {
        warn!("SCRFD stride {}: unexpected output sizes ({} scores, {} boxes)", stride, scores.len(), boxes.len());
        return;
    }
    let anchors = scores.len() / points;
    let s = stride as f32;
    for (idx, &conf) in scores.iter().enumerate() {
        if conf < threshold {
            continue;
        }
        let point = idx / anchors;
        let cx = (point % side) as f32 * s;
        let cy = (point / side) as f32 * s;
        let b = &boxes[idx * 4..idx * 4 + 4];
        let x1 = ((cx - b[0] * s) / scale).clamp(0.0, img_w);
        let y1 = ((cy - b[1] * s) / scale).clamp(0.0, img_h);
        let x2 = ((cx + b[2] * s) / scale).clamp(0.0, img_w);
        let y2 = ((cy + b[3] * s) / scale).clamp(0.0, img_h);
        if x2 - x1 < MIN_FACE_PX || y2 - y1 < MIN_FACE_PX {
            continue;
        }
        out.push(RawBox { x1, y1, x2, y2, confidence: conf });
    }
}

fn nms(boxes: &[RawBox], iou_threshold: f32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..boxes.len()).collect();
    indices.sort_by(|&a, &b| {
        boxes[b]
            .confidence
            .partial_cmp(&boxes[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for i in 0..indices.len() {
        let ia = indices[i];
        if suppressed[ia] {
            continue;
        }
        keep.push(ia);
        for &ib in indices.iter().skip(i + 1) {
            if !suppressed[ib] && iou(&boxes[ia], &boxes[ib]) > iou_threshold {
                suppressed[ib] = true;
            }
        }
    }
    keep
}

fn iou(a: &RawBox, b: &RawBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let intersection = (x2 - x1) * (y2 - y1);
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}
