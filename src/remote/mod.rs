//! Content-store adapters. The pipeline only ever talks to [`ContentStore`];
//! `rclone` is the production backend and `local` serves a plain directory.

pub mod local;
pub mod rclone;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub use local::LocalStore;
pub use rclone::RcloneStore;

/// One file from a recursive listing. Field names follow `rclone lsjson`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteEntry {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "MimeType", default)]
    pub mime_type: String,
    #[serde(rename = "Size", default)]
    pub size: i64,
    #[serde(rename = "Hashes", default)]
    pub hashes: HashMap<String, String>,
}

impl RemoteEntry {
    /// The hash used as the image key: MD5 when the backend reports it,
    /// otherwise SHA-256, otherwise SHA-1.
    pub fn content_hash(&self) -> Option<String> {
        for wanted in ["md5", "sha256", "sha-256", "sha1"] {
            let found = self
                .hashes
                .iter()
                .find(|(k, v)| k.eq_ignore_ascii_case(wanted) && !v.is_empty());
            if let Some((_, v)) = found {
                return Some(v.to_lowercase());
            }
        }
        None
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Recursive listing of every file under `location`. Paths are relative to it.
    async fn list(&self, location: &str) -> Result<Vec<RemoteEntry>>;
    /// Copy one remote file to a local path.
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()>;
    /// Server-side copy between two remote paths.
    async fn copy(&self, source: &str, dest: &str) -> Result<()>;
    async fn mkdir(&self, dir: &str) -> Result<()>;
}

/// Join a listing-relative path onto a remote location. Handles both
/// `remote:` roots and `remote:/dir` style locations.
pub fn join_remote(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if base.is_empty() {
        rel.to_string()
    } else if base.ends_with('/') || base.ends_with(':') {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}
