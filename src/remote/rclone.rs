use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use super::{ContentStore, RemoteEntry};
use crate::utils::exec::{exec_capture, stderr_preview};

/// Drives the `rclone` binary as a subprocess.
#[derive(Clone, Debug)]
pub struct RcloneStore {
    bin: String,
}

impl RcloneStore {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Returns `None` when the binary cannot be found on PATH.
    pub fn locate(bin: &str) -> Option<Self> {
        which::which(bin).ok().map(|p| Self::new(p.to_string_lossy().into_owned()))
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("rclone {}", args.join(" "));
        let (code, stdout, stderr) = exec_capture(&self.bin, args).await?;
        if code != 0 {
            anyhow::bail!("rclone {} exited with {} (stderr: {})", args[0], code, stderr_preview(&stderr));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ContentStore for RcloneStore {
    async fn list(&self, location: &str) -> Result<Vec<RemoteEntry>> {
        let out = self
            .run(&["lsjson", location, "--files-only", "--hash", "--no-modtime", "--recursive"])
            .await?;
        let entries: Vec<RemoteEntry> =
            serde_json::from_slice(&out).with_context(|| format!("parsing lsjson output for {}", location))?;
        Ok(entries)
    }

    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run(&["copyto", source, dest.as_ref()]).await?;
        Ok(())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        self.run(&["copyto", source, dest]).await?;
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        self.run(&["mkdir", dir]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let store = RcloneStore::new("/nonexistent/rclone-binary");
        assert!(store.list("remote:").await.is_err());
    }

    #[test]
    fn test_locate_unknown_binary() {
        assert!(RcloneStore::locate("surely-not-a-real-rclone-binary").is_none());
    }
}
