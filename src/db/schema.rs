use anyhow::Result;
use rusqlite::Connection;

/// Per-connection settings; runs on every pooled connection.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "busy_timeout", 5000i64)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS images_index (
  hash TEXT PRIMARY KEY,
  path TEXT NOT NULL,
  indexed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_images_index_path ON images_index(path);

CREATE TABLE IF NOT EXISTS downloaded_images (
  hash TEXT PRIMARY KEY,
  local_path TEXT NOT NULL,
  downloaded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS skipped_images (
  hash TEXT PRIMARY KEY,
  reason TEXT NOT NULL,
  skipped_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_images (
  hash TEXT PRIMARY KEY,
  processed_at INTEGER NOT NULL,
  face_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS images_to_faces (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL,
  identity TEXT NOT NULL,
  UNIQUE(hash, identity)
);

CREATE TABLE IF NOT EXISTS faces_to_images (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  identity TEXT NOT NULL,
  hash TEXT NOT NULL,
  UNIQUE(identity, hash)
);
CREATE INDEX IF NOT EXISTS idx_faces_to_images_hash ON faces_to_images(hash);

CREATE TABLE IF NOT EXISTS profiles (
  position INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS profile_embeddings (
  id INTEGER PRIMARY KEY,
  profile_position INTEGER NOT NULL,
  embedding_blob BLOB NOT NULL,
  FOREIGN KEY(profile_position) REFERENCES profiles(position) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_profile_embeddings_profile ON profile_embeddings(profile_position);

CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  detail TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
    "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn.execute("INSERT INTO processed_images (hash, processed_at) VALUES ('h', 1)", []).unwrap();
        apply_schema(&conn).unwrap();
        let faces: i64 = conn
            .query_row("SELECT face_count FROM processed_images WHERE hash = 'h'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(faces, 0);
    }
}
