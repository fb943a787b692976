use anyhow::Result;
use rusqlite::{params, Connection};

use crate::matcher::Profile;
use crate::models::job::{JobKind, JobStatus};

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Little-endian `f32` bytes, the storage format for every embedding blob.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Record hash -> path for a whole listing in one transaction. An existing
/// hash takes the newly seen path.
pub fn upsert_catalog_entries(conn: &Connection, entries: &[(String, String)]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = now_secs();
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO images_index (hash, path, indexed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(hash) DO UPDATE SET path = excluded.path, indexed_at = excluded.indexed_at",
        )?;
        for (hash, path) in entries {
            stmt.execute(params![hash, path, now])?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

pub fn set_catalog_path(conn: &Connection, hash: &str, path: &str) -> Result<()> {
    upsert_catalog_entries(conn, &[(hash.to_string(), path.to_string())])?;
    Ok(())
}

/// Marking downloaded clears any skip record for the same hash.
pub fn mark_downloaded(conn: &Connection, hash: &str, local_path: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM skipped_images WHERE hash = ?1", params![hash])?;
    tx.execute(
        "INSERT INTO downloaded_images (hash, local_path, downloaded_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(hash) DO UPDATE SET local_path = excluded.local_path, downloaded_at = excluded.downloaded_at",
        params![hash, local_path, now_secs()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Marking skipped clears any downloaded record for the same hash.
pub fn mark_skipped(conn: &Connection, hash: &str, reason: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM downloaded_images WHERE hash = ?1", params![hash])?;
    tx.execute(
        "INSERT INTO skipped_images (hash, reason, skipped_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(hash) DO UPDATE SET reason = excluded.reason, skipped_at = excluded.skipped_at",
        params![hash, reason, now_secs()],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn mark_processed(conn: &Connection, items: &[(String, usize)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let now = now_secs();
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO processed_images (hash, processed_at, face_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(hash) DO UPDATE SET processed_at = excluded.processed_at, face_count = excluded.face_count",
        )?;
        for (hash, faces) in items {
            stmt.execute(params![hash, now, *faces as i64])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Append each identity to the image's list and the image to each identity's
/// list. Both directions land in the same transaction; pairs already present
/// are left alone. Returns the number of new pairs.
pub fn record_image_faces(conn: &Connection, hash: &str, names: &[String]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut added = 0;
    {
        let mut forward = tx.prepare_cached("INSERT OR IGNORE INTO images_to_faces (hash, identity) VALUES (?1, ?2)")?;
        let mut inverse = tx.prepare_cached("INSERT OR IGNORE INTO faces_to_images (identity, hash) VALUES (?1, ?2)")?;
        for name in names {
            added += forward.execute(params![hash, name])?;
            inverse.execute(params![name, hash])?;
        }
    }
    tx.commit()?;
    Ok(added)
}

/// Fill in whichever side of the image/identity mapping is missing a pair.
/// Returns the number of rows written.
pub fn repair_consistency(conn: &Connection) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let to_inverse = tx.execute(
        "INSERT OR IGNORE INTO faces_to_images (identity, hash)
         SELECT f.identity, f.hash FROM images_to_faces f
         WHERE NOT EXISTS (SELECT 1 FROM faces_to_images i WHERE i.identity = f.identity AND i.hash = f.hash)
         ORDER BY f.seq",
        [],
    )?;
    let to_forward = tx.execute(
        "INSERT OR IGNORE INTO images_to_faces (hash, identity)
         SELECT i.hash, i.identity FROM faces_to_images i
         WHERE NOT EXISTS (SELECT 1 FROM images_to_faces f WHERE f.identity = i.identity AND f.hash = i.hash)
         ORDER BY i.seq",
        [],
    )?;
    tx.commit()?;
    Ok(to_inverse + to_forward)
}

pub fn clear_skip(conn: &Connection, hash: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM skipped_images WHERE hash = ?1", params![hash])?;
    Ok(n > 0)
}

/// Forget everything derived from an image so the next run processes it
/// again. The catalog entry stays. Returns the number of identity pairs removed.
pub fn reset_image(conn: &Connection, hash: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute("DELETE FROM images_to_faces WHERE hash = ?1", params![hash])?;
    tx.execute("DELETE FROM faces_to_images WHERE hash = ?1", params![hash])?;
    tx.execute("DELETE FROM processed_images WHERE hash = ?1", params![hash])?;
    tx.execute("DELETE FROM downloaded_images WHERE hash = ?1", params![hash])?;
    tx.execute("DELETE FROM skipped_images WHERE hash = ?1", params![hash])?;
    tx.commit()?;
    Ok(removed)
}

/// Replace the stored profile library. Order is kept through `position`.
pub fn save_profiles(conn: &Connection, profiles: &[Profile]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM profile_embeddings", [])?;
    tx.execute("DELETE FROM profiles", [])?;
    {
        let mut insert_profile = tx.prepare_cached("INSERT INTO profiles (position, name) VALUES (?1, ?2)")?;
        let mut insert_embedding =
            tx.prepare_cached("INSERT INTO profile_embeddings (profile_position, embedding_blob) VALUES (?1, ?2)")?;
        for (position, profile) in profiles.iter().enumerate() {
            insert_profile.execute(params![position as i64, profile.name])?;
            for reference in &profile.references {
                insert_embedding.execute(params![position as i64, encode_embedding(reference)])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn insert_job(conn: &Connection, kind: JobKind) -> Result<i64> {
    let now = now_secs();
    conn.execute(
        "INSERT INTO jobs (kind, status, detail, created_at, updated_at) VALUES (?1, ?2, NULL, ?3, ?3)",
        params![kind.as_str(), JobStatus::Pending.as_str(), now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_job_status(conn: &Connection, id: i64, status: JobStatus, detail: Option<&str>) -> Result<bool> {
    let n = conn.execute(
        "UPDATE jobs SET status = ?1, detail = COALESCE(?2, detail), updated_at = ?3 WHERE id = ?4",
        params![status.as_str(), detail, now_secs(), id],
    )?;
    Ok(n > 0)
}

/// Jobs left pending or running by a previous process can never finish.
pub fn fail_interrupted_jobs(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status = 'failed', detail = 'interrupted by restart', updated_at = ?1
         WHERE status IN ('pending', 'running')",
        params![now_secs()],
    )?;
    Ok(n)
}
