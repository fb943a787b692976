use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::image::{BoundingBox, FaceObservation};

/// A detected face before embedding.
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Detector plus embedder. Implemented by the ONNX backend and by synthetic
/// models in tests.
pub trait FaceModel: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;

    /// One call for several images of identical geometry. The default runs
    /// them one after another.
    fn detect_batch(&self, images: &[&DynamicImage]) -> Result<Vec<Vec<Detection>>> {
        images.iter().map(|img| self.detect(img)).collect()
    }

    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<f32>>;
}

/// Stand-in used when face recognition is compiled out or the models failed
/// to load. Every call fails, so nothing is ever marked processed.
pub struct UnavailableModel {
    pub reason: String,
}

impl FaceModel for UnavailableModel {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>> {
        anyhow::bail!("face model unavailable: {}", self.reason)
    }

    fn embed(&self, _image: &DynamicImage, _bbox: &BoundingBox) -> Result<Vec<f32>> {
        anyhow::bail!("face model unavailable: {}", self.reason)
    }
}

#[derive(Clone)]
pub struct FaceEncoder {
    model: Arc<dyn FaceModel>,
}

/// True when every image has the same width and height.
pub fn uniform_geometry(images: &[&DynamicImage]) -> bool {
    match images.first() {
        Some(first) => images
            .iter()
            .all(|img| img.width() == first.width() && img.height() == first.height()),
        None => true,
    }
}

impl FaceEncoder {
    pub fn new(model: Arc<dyn FaceModel>) -> Self {
        Self { model }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(Arc::new(UnavailableModel { reason: reason.into() }))
    }

    fn observe(&self, image: &DynamicImage, detections: Vec<Detection>) -> Result<Vec<FaceObservation>> {
        detections
            .into_iter()
            .map(|d| {
                let embedding = self.model.embed(image, &d.bbox)?;
                Ok(FaceObservation { bbox: d.bbox, embedding, confidence: d.confidence })
            })
            .collect()
    }

    pub fn encode_image(&self, image: &DynamicImage) -> Result<Vec<FaceObservation>> {
        let detections = self.model.detect(image)?;
        self.observe(image, detections)
    }

    /// Detect for a whole batch. A single vectorized call is tried when the
    /// geometry is uniform; otherwise, or if that call fails, each image is
    /// detected on its own so one bad image cannot sink the rest.
    fn detect_all(&self, images: &[&DynamicImage]) -> Vec<Result<Vec<Detection>>> {
        if images.len() > 1 && uniform_geometry(images) {
            match self.model.detect_batch(images) {
                Ok(batch) if batch.len() == images.len() => {
                    return batch.into_iter().map(Ok).collect();
                }
                Ok(batch) => warn!(
                    "Batched detection returned {} results for {} images, falling back",
                    batch.len(),
                    images.len()
                ),
                Err(e) => warn!("Batched detection failed, falling back to per-image: {:#}", e),
            }
        } else if images.len() > 1 {
            debug!("Irregular batch geometry, detecting {} images one by one", images.len());
        }
        images.iter().map(|img| self.model.detect(img)).collect()
    }

    /// Encode images already in memory. Results are positional.
    pub fn encode_images(&self, images: &[&DynamicImage]) -> Vec<Result<Vec<FaceObservation>>> {
        self.detect_all(images)
            .into_iter()
            .zip(images)
            .map(|(detected, img)| detected.and_then(|d| self.observe(img, d)))
            .collect()
    }

    /// Load and encode a batch of local files. Results are positional; a file
    /// that cannot be decoded only fails its own slot.
    pub fn encode_files(&self, paths: &[PathBuf]) -> Vec<Result<Vec<FaceObservation>>> {
        let loaded: Vec<Result<DynamicImage>> = paths
            .iter()
            .map(|p| image::open(p).with_context(|| format!("opening {}", p.display())))
            .collect();
        let images: Vec<&DynamicImage> = loaded.iter().filter_map(|r| r.as_ref().ok()).collect();
        let mut encoded = self.encode_images(&images).into_iter();

        let mut out = Vec::with_capacity(paths.len());
        for l in loaded {
            match l {
                Ok(_) => out.push(encoded.next().unwrap_or_else(|| Err(anyhow::anyhow!("missing encoding result")))),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }
}
