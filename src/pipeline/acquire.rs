use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use rusqlite::Connection;
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{self, DbPool};
use crate::models::image::EXPECTED_MIME;
use crate::remote::{join_remote, ContentStore};
use crate::stats::Stats;

pub const DEFAULT_MAX_IMAGE_SIZE: u32 = 1024;

/// Why an image was permanently set aside. The display string is what the
/// store records.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SkipReason {
    #[error("unable to download")]
    Download,
    /// The content type detected from the bytes
    #[error("{0}")]
    WrongType(String),
    #[error("resize error")]
    Resize,
}

#[derive(Clone, Debug)]
pub struct AcquireSettings {
    pub folder: PathBuf,
    pub max_size: u32,
}

#[derive(Clone, Debug)]
pub struct AcquiredImage {
    pub hash: String,
    pub local_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub enum AcquireOutcome {
    Acquired(AcquiredImage),
    Skipped(SkipReason),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AcquireSummary {
    pub attempted: usize,
    pub acquired: usize,
    pub skipped: usize,
}

fn format_mime(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Ico => "image/x-icon",
        ImageFormat::Avif => "image/avif",
        _ => "application/octet-stream",
    }
}

/// Content type from the leading bytes, ignoring whatever the store claimed.
pub fn sniff_mime(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "application/x-empty".to_string();
    }
    // HEIC is common in phone uploads and not known to the image crate
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && matches!(&bytes[8..12], b"heic" | b"heix" | b"mif1") {
        return "image/heic".to_string();
    }
    if let Ok(format) = image::guess_format(bytes) {
        return format_mime(format).to_string();
    }
    if std::str::from_utf8(bytes).is_ok() {
        return "text/plain".to_string();
    }
    "application/octet-stream".to_string()
}

/// Decode and re-encode as JPEG no larger than `max` on either side. Aspect
/// ratio is preserved and smaller images are never enlarged.
pub fn bound_image(bytes: &[u8], max: u32) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory(bytes).context("decoding image")?;
    let img = if img.width() > max || img.height() > max {
        img.thumbnail(max, max)
    } else {
        img
    };
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(90))
        .context("encoding jpeg")?;
    Ok((out, rgb.width(), rgb.height()))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Fetch one image, validate it and write `<folder>/<hash>.jpg`.
///
/// Every expected failure is an outcome, not an error. `Err` is reserved for
/// local I/O problems with the working folder itself.
pub async fn acquire_image(
    content: &dyn ContentStore,
    location: &str,
    hash: &str,
    path: &str,
    settings: &AcquireSettings,
) -> Result<AcquireOutcome> {
    tokio::fs::create_dir_all(&settings.folder)
        .await
        .with_context(|| format!("creating {}", settings.folder.display()))?;
    let raw = settings.folder.join(hash);
    let source = join_remote(location, path);

    if let Err(e) = content.fetch(&source, &raw).await {
        warn!("Download failed for {} ({}): {:#}", hash, source, e);
        discard(&raw).await;
        return Ok(AcquireOutcome::Skipped(SkipReason::Download));
    }
    let bytes = match tokio::fs::read(&raw).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Fetched file for {} unreadable: {}", hash, e);
            discard(&raw).await;
            return Ok(AcquireOutcome::Skipped(SkipReason::Download));
        }
    };

    let mime = sniff_mime(&bytes);
    if mime != EXPECTED_MIME {
        info!("Skipping {} ({}): content is {}", hash, path, mime);
        discard(&raw).await;
        return Ok(AcquireOutcome::Skipped(SkipReason::WrongType(mime)));
    }

    let max = settings.max_size;
    let bounded = tokio::task::spawn_blocking(move || bound_image(&bytes, max)).await;
    let (jpeg, width, height) = match bounded {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            warn!("Resize failed for {}: {:#}", hash, e);
            discard(&raw).await;
            return Ok(AcquireOutcome::Skipped(SkipReason::Resize));
        }
        Err(e) => {
            warn!("Resize task failed for {}: {}", hash, e);
            discard(&raw).await;
            return Ok(AcquireOutcome::Skipped(SkipReason::Resize));
        }
    };

    let local_path = settings.folder.join(format!("{}.jpg", hash));
    tokio::fs::write(&local_path, &jpeg)
        .await
        .with_context(|| format!("writing {}", local_path.display()))?;
    discard(&raw).await;
    Ok(AcquireOutcome::Acquired(AcquiredImage { hash: hash.to_string(), local_path, width, height }))
}

/// The normalized copy an acquire-only run left at `local_path`, if it is
/// still readable and does not live under the pipeline's `scratch` folder.
pub fn existing_copy(hash: &str, local_path: &Path, scratch: &Path) -> Option<AcquiredImage> {
    if local_path.starts_with(scratch) {
        return None;
    }
    let (width, height) = image::image_dimensions(local_path).ok()?;
    Some(AcquiredImage { hash: hash.to_string(), local_path: local_path.to_path_buf(), width, height })
}

pub fn record_outcome(conn: &Connection, hash: &str, outcome: &AcquireOutcome) -> Result<()> {
    match outcome {
        AcquireOutcome::Acquired(img) => {
            db::writer::mark_downloaded(conn, hash, &img.local_path.to_string_lossy())
        }
        AcquireOutcome::Skipped(reason) => db::writer::mark_skipped(conn, hash, &reason.to_string()),
    }
}

/// Acquire every catalog entry that is neither downloaded nor skipped,
/// recording each outcome as soon as it is known.
pub async fn acquire_unresolved(
    pool: &DbPool,
    content: &dyn ContentStore,
    location: &str,
    settings: &AcquireSettings,
    stats: Option<&Stats>,
) -> Result<AcquireSummary> {
    let unresolved = db::with_conn(pool, db::query::unresolved_for_acquire).await?;
    info!("Acquiring {} unresolved images", unresolved.len());
    let mut summary = AcquireSummary::default();
    for (hash, path) in unresolved {
        summary.attempted += 1;
        let outcome = match acquire_image(content, location, &hash, &path, settings).await {
            Ok(o) => o,
            Err(e) => {
                warn!("Acquire aborted for {}: {:#}", hash, e);
                continue;
            }
        };
        match &outcome {
            AcquireOutcome::Acquired(_) => {
                summary.acquired += 1;
                if let Some(s) = stats { s.inc_acquired(1); }
            }
            AcquireOutcome::Skipped(_) => {
                summary.skipped += 1;
                if let Some(s) = stats { s.inc_skipped(1); }
            }
        }
        let h = hash.clone();
        db::with_conn(pool, move |conn| record_outcome(conn, &h, &outcome)).await?;
    }
    info!(
        "Acquire finished: {} attempted, {} acquired, {} skipped",
        summary.attempted, summary.acquired, summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn jpeg(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 30, 30])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(85)).unwrap();
        out
    }

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&jpeg(4, 4)), "image/jpeg");
        assert_eq!(sniff_mime(b""), "application/x-empty");
        assert_eq!(sniff_mime(b"hello world"), "text/plain");
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]), "image/png");
        assert_eq!(sniff_mime(b"\0\0\0\x18ftypheic\0\0\0\0"), "image/heic");
        assert_eq!(sniff_mime(&[0xff, 0xfe, 0x00, 0x81]), "application/octet-stream");
    }

    #[test]
    fn test_bound_image_shrinks_preserving_aspect() {
        let (out, w, h) = bound_image(&jpeg(400, 200), 100).unwrap();
        assert_eq!((w, h), (100, 50));
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn test_bound_image_never_enlarges() {
        let (_, w, h) = bound_image(&jpeg(30, 20), 1024).unwrap();
        assert_eq!((w, h), (30, 20));
    }

    #[test]
    fn test_bound_image_rejects_garbage() {
        let mut bytes = jpeg(8, 8);
        bytes.truncate(20);
        assert!(bound_image(&bytes, 100).is_err());
    }

    #[test]
    fn test_existing_copy_outside_scratch_only() {
        let tmp = tempfile::tempdir().unwrap();
        let (kept, scratch) = (tmp.path().join("acquired"), tmp.path().join("work"));
        std::fs::create_dir_all(&kept).unwrap();
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(kept.join("abc.jpg"), jpeg(12, 9)).unwrap();
        std::fs::write(scratch.join("abc.jpg"), jpeg(12, 9)).unwrap();

        let img = existing_copy("abc", &kept.join("abc.jpg"), &scratch).unwrap();
        assert_eq!((img.width, img.height), (12, 9));
        assert!(existing_copy("abc", &scratch.join("abc.jpg"), &scratch).is_none());
        assert!(existing_copy("abc", &kept.join("gone.jpg"), &scratch).is_none());
    }

    #[test]
    fn test_skip_reason_strings() {
        assert_eq!(SkipReason::Download.to_string(), "unable to download");
        assert_eq!(SkipReason::Resize.to_string(), "resize error");
        assert_eq!(SkipReason::WrongType("image/png".into()).to_string(), "image/png");
    }
}
