use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{self, DbPool};
use crate::models::image::EXPECTED_MIME;
use crate::remote::{ContentStore, RemoteEntry};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub listed: usize,
    pub indexed: usize,
    /// JPEGs the store reported without a hash. Retried on the next index.
    pub missing_hash: usize,
    pub other_type: usize,
}

/// Pick the JPEG entries out of a listing as (hash, path) pairs.
pub fn select_images(entries: &[RemoteEntry]) -> (Vec<(String, String)>, CatalogSummary) {
    let mut summary = CatalogSummary { listed: entries.len(), ..Default::default() };
    let mut selected = Vec::new();
    for entry in entries {
        if !entry.mime_type.eq_ignore_ascii_case(EXPECTED_MIME) {
            summary.other_type += 1;
            continue;
        }
        let Some(hash) = entry.content_hash() else {
            debug!("no hash reported for {}", entry.path);
            summary.missing_hash += 1;
            continue;
        };
        selected.push((hash, entry.path.clone()));
        summary.indexed += 1;
        if summary.indexed % 100 == 0 {
            info!("Indexed {} images", summary.indexed);
        }
    }
    (selected, summary)
}

/// List `location` and record every JPEG's hash and path. Nothing is written
/// unless the listing succeeds; the write itself is a single transaction.
pub async fn index_catalog(pool: &DbPool, content: &dyn ContentStore, location: &str) -> Result<CatalogSummary> {
    info!("Listing {}", location);
    let entries = content
        .list(location)
        .await
        .with_context(|| format!("listing {}", location))?;
    let (selected, summary) = select_images(&entries);
    db::with_conn(pool, move |conn| db::writer::upsert_catalog_entries(conn, &selected)).await?;
    info!(
        "Catalog indexed: {} listed, {} images, {} without hash, {} other types",
        summary.listed, summary.indexed, summary.missing_hash, summary.other_type
    );
    Ok(summary)
}
