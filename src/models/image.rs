use serde::{Deserialize, Serialize};

/// Identity name stored when no profile is close enough to a detected face.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// The only media type the pipeline indexes and accepts after sniffing.
pub const EXPECTED_MIME: &str = "image/jpeg";

/// Face rectangle in pixels of the acquired (bounded) image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 { self.right.saturating_sub(self.left) }
    pub fn height(&self) -> u32 { self.bottom.saturating_sub(self.top) }
}

#[derive(Clone, Debug)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Indexed,
    Downloaded,
    Skipped,
    Processed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageRecord {
    pub hash: String,
    pub path: Option<String>,
    pub state: ImageState,
    pub skip_reason: Option<String>,
    pub identities: Vec<String>,
}
