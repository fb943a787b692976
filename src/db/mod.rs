pub mod schema;
pub mod writer;
pub mod query;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Pooled connections for the WAL-mode store. The schema is applied once
/// through the first checkout; every connection gets the pragmas.
pub fn create_pool<P: AsRef<Path>>(db_path: P, size: u32) -> Result<DbPool> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(db_path).with_init(|c| schema::apply_pragmas(c));
    let pool = r2d2::Pool::builder()
        .max_size(size)
        .build(manager)
        .context("building sqlite pool")?;
    let conn = pool.get()?;
    schema::apply_schema(&conn)?;
    Ok(pool)
}

/// Run a closure against a pooled connection on the blocking pool.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().context("checking out sqlite connection")?;
        f(&conn)
    })
    .await?
}
