use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{ContentStore, RemoteEntry};
use crate::pipeline::hash::content_hash;

/// A directory on local disk presented as a content store. Locations and
/// paths are relative to `root`; hashes are SHA-256 computed on listing.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a store path under the root. Rejects `..` components and
    /// strips an optional `local:` prefix.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.strip_prefix("local:").unwrap_or(rel).trim_start_matches('/');
        let rel_path = Path::new(rel);
        if rel_path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            anyhow::bail!("path escapes store root: {}", rel);
        }
        Ok(self.root.join(rel_path))
    }

    fn list_blocking(base: PathBuf) -> Result<Vec<RemoteEntry>> {
        if !base.is_dir() {
            anyhow::bail!("{} is not a directory", base.display());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&base) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let mime_type = mime_guess::from_path(entry.path())
                .first_raw()
                .unwrap_or("application/octet-stream")
                .to_string();
            let mut hashes = HashMap::new();
            match content_hash(entry.path()) {
                Ok(h) => {
                    hashes.insert("sha256".to_string(), h);
                }
                Err(e) => tracing::debug!("hash error for {:?}: {:?}", entry.path(), e),
            }
            let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
            out.push(RemoteEntry { path: rel, mime_type, size, hashes });
        }
        Ok(out)
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn list(&self, location: &str) -> Result<Vec<RemoteEntry>> {
        let base = self.resolve(location)?;
        tokio::task::spawn_blocking(move || Self::list_blocking(base)).await?
    }

    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        let src = self.resolve(source)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest)
            .await
            .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
        Ok(())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let src = self.resolve(source)?;
        let dst = self.resolve(dest)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(dir)?).await?;
        Ok(())
    }
}
