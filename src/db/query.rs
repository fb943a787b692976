use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::matcher::Profile;
use crate::models::image::{ImageRecord, ImageState};
use crate::models::job::{JobKind, JobRecord, JobStatus};

pub type CatalogEntry = (String, String);

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StoreTotals {
    pub indexed: i64,
    pub downloaded: i64,
    pub skipped: i64,
    pub processed: i64,
    pub identities: i64,
    pub mappings: i64,
}

/// Pairs present on one side of the image/identity mapping but not the other.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConsistencyReport {
    /// (hash, identity) in images_to_faces without the inverse row
    pub missing_inverse: Vec<(String, String)>,
    /// (identity, hash) in faces_to_images without the forward row
    pub missing_forward: Vec<(String, String)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_inverse.is_empty() && self.missing_forward.is_empty()
    }
}

fn collect_strings(conn: &Connection, sql: &str, arg: Option<&str>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match arg {
        Some(a) => stmt.query_map(params![a], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(rows)
}

fn collect_entries(conn: &Connection, sql: &str) -> Result<Vec<CatalogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = Vec::new();
    for r in rows { out.push(r?); }
    Ok(out)
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
    Ok(n)
}

pub fn catalog_path(conn: &Connection, hash: &str) -> Result<Option<String>> {
    let path = conn
        .query_row("SELECT path FROM images_index WHERE hash = ?1", params![hash], |r| r.get(0))
        .optional()?;
    Ok(path)
}

pub fn catalog(conn: &Connection) -> Result<Vec<CatalogEntry>> {
    collect_entries(conn, "SELECT hash, path FROM images_index ORDER BY path, hash")
}

pub fn store_totals(conn: &Connection) -> Result<StoreTotals> {
    Ok(StoreTotals {
        indexed: count(conn, "SELECT COUNT(*) FROM images_index")?,
        downloaded: count(conn, "SELECT COUNT(*) FROM downloaded_images")?,
        skipped: count(conn, "SELECT COUNT(*) FROM skipped_images")?,
        processed: count(conn, "SELECT COUNT(*) FROM processed_images")?,
        identities: count(conn, "SELECT COUNT(DISTINCT identity) FROM faces_to_images")?,
        mappings: count(conn, "SELECT COUNT(*) FROM images_to_faces")?,
    })
}

/// Catalog entries neither downloaded nor skipped.
pub fn unresolved_for_acquire(conn: &Connection) -> Result<Vec<CatalogEntry>> {
    collect_entries(
        conn,
        "SELECT c.hash, c.path FROM images_index c
         WHERE NOT EXISTS (SELECT 1 FROM downloaded_images d WHERE d.hash = c.hash)
           AND NOT EXISTS (SELECT 1 FROM skipped_images s WHERE s.hash = c.hash)
         ORDER BY c.path, c.hash",
    )
}

/// Catalog entries neither processed nor skipped. Downloaded but unprocessed
/// images are included so a crashed run resumes them.
pub fn pending_for_processing(conn: &Connection) -> Result<Vec<CatalogEntry>> {
    collect_entries(
        conn,
        "SELECT c.hash, c.path FROM images_index c
         WHERE NOT EXISTS (SELECT 1 FROM processed_images p WHERE p.hash = c.hash)
           AND NOT EXISTS (SELECT 1 FROM skipped_images s WHERE s.hash = c.hash)
         ORDER BY c.path, c.hash",
    )
}

pub fn skip_reason(conn: &Connection, hash: &str) -> Result<Option<String>> {
    let reason = conn
        .query_row("SELECT reason FROM skipped_images WHERE hash = ?1", params![hash], |r| r.get(0))
        .optional()?;
    Ok(reason)
}

pub fn is_downloaded(conn: &Connection, hash: &str) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM downloaded_images WHERE hash = ?1", params![hash], |r| r.get(0))?;
    Ok(n > 0)
}

pub fn downloaded_path(conn: &Connection, hash: &str) -> Result<Option<String>> {
    let path = conn
        .query_row("SELECT local_path FROM downloaded_images WHERE hash = ?1", params![hash], |r| r.get(0))
        .optional()?;
    Ok(path)
}

pub fn is_processed(conn: &Connection, hash: &str) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM processed_images WHERE hash = ?1", params![hash], |r| r.get(0))?;
    Ok(n > 0)
}

pub fn downloaded_hashes(conn: &Connection) -> Result<Vec<String>> {
    collect_strings(conn, "SELECT hash FROM downloaded_images ORDER BY hash", None)
}

pub fn skipped_hashes(conn: &Connection) -> Result<Vec<String>> {
    collect_strings(conn, "SELECT hash FROM skipped_images ORDER BY hash", None)
}

/// Identities in an image, in the order they were first recorded.
pub fn faces_for_image(conn: &Connection, hash: &str) -> Result<Vec<String>> {
    collect_strings(conn, "SELECT identity FROM images_to_faces WHERE hash = ?1 ORDER BY seq", Some(hash))
}

/// Images containing an identity, in the order they were first recorded.
pub fn images_for_identity(conn: &Connection, name: &str) -> Result<Vec<String>> {
    collect_strings(conn, "SELECT hash FROM faces_to_images WHERE identity = ?1 ORDER BY seq", Some(name))
}

/// Every identity with at least one image, ordered by first appearance.
pub fn identity_names(conn: &Connection) -> Result<Vec<String>> {
    collect_strings(
        conn,
        "SELECT identity FROM faces_to_images GROUP BY identity ORDER BY MIN(seq)",
        None,
    )
}

pub fn check_consistency(conn: &Connection) -> Result<ConsistencyReport> {
    let missing_inverse = collect_entries(
        conn,
        "SELECT f.hash, f.identity FROM images_to_faces f
         WHERE NOT EXISTS (SELECT 1 FROM faces_to_images i WHERE i.identity = f.identity AND i.hash = f.hash)
         ORDER BY f.seq",
    )?;
    let missing_forward = collect_entries(
        conn,
        "SELECT i.identity, i.hash FROM faces_to_images i
         WHERE NOT EXISTS (SELECT 1 FROM images_to_faces f WHERE f.identity = i.identity AND f.hash = i.hash)
         ORDER BY i.seq",
    )?;
    Ok(ConsistencyReport { missing_inverse, missing_forward })
}

pub fn decode_embedding_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("Embedding blob length is not a multiple of 4");
    }
    let mut embedding = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        embedding.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(embedding)
}

/// Stored profiles in library order. Undecodable reference blobs are
/// dropped with a warning; a profile left with no references is omitted.
pub fn load_profiles(conn: &Connection) -> Result<Vec<Profile>> {
    let mut stmt = conn.prepare(
        "SELECT p.position, p.name, e.embedding_blob FROM profiles p
         LEFT JOIN profile_embeddings e ON e.profile_position = p.position
         ORDER BY p.position, e.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<Vec<u8>>>(2)?))
    })?;
    let mut profiles: Vec<(i64, Profile)> = Vec::new();
    for r in rows {
        let (position, name, blob) = r?;
        if profiles.last().map(|(p, _)| *p) != Some(position) {
            profiles.push((position, Profile { name: name.clone(), references: Vec::new() }));
        }
        let Some(blob) = blob else { continue };
        match decode_embedding_blob(&blob) {
            Ok(embedding) => {
                if let Some((_, profile)) = profiles.last_mut() {
                    profile.references.push(embedding);
                }
            }
            Err(e) => tracing::warn!("Failed to decode reference embedding for {}: {}", name, e),
        }
    }
    Ok(profiles
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| !p.references.is_empty())
        .collect())
}

pub fn get_job(conn: &Connection, id: i64) -> Result<Option<JobRecord>> {
    let row = conn
        .query_row(
            "SELECT id, kind, status, detail, created_at, updated_at FROM jobs WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, kind, status, detail, created_at, updated_at)) = row else {
        return Ok(None);
    };
    let kind = JobKind::parse(&kind).ok_or_else(|| anyhow::anyhow!("unknown job kind {}", kind))?;
    let status = JobStatus::parse(&status).ok_or_else(|| anyhow::anyhow!("unknown job status {}", status))?;
    Ok(Some(JobRecord { id, kind, status, detail, created_at, updated_at }))
}

/// Everything the store knows about one hash. `None` when the hash appears
/// nowhere.
pub fn image_record(conn: &Connection, hash: &str) -> Result<Option<ImageRecord>> {
    let path = catalog_path(conn, hash)?;
    let skip_reason = skip_reason(conn, hash)?;
    let processed = is_processed(conn, hash)?;
    let downloaded = is_downloaded(conn, hash)?;
    let identities = faces_for_image(conn, hash)?;
    let state = if processed {
        ImageState::Processed
    } else if skip_reason.is_some() {
        ImageState::Skipped
    } else if downloaded {
        ImageState::Downloaded
    } else if path.is_some() {
        ImageState::Indexed
    } else if !identities.is_empty() {
        ImageState::Processed
    } else {
        return Ok(None);
    };
    Ok(Some(ImageRecord { hash: hash.to_string(), path, state, skip_reason, identities }))
}
