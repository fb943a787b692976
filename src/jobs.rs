//! Background jobs with a durable status row, plus the lease that keeps a
//! single writer on the index.

use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::db::{self, DbPool};
use crate::models::job::{JobKind, JobStatus};

/// Held for the whole life of an index-writing job. Dropping it frees the
/// indexer for the next request.
pub struct IndexerLease {
    flag: Arc<AtomicBool>,
}

impl IndexerLease {
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for IndexerLease {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

async fn set_status(pool: &DbPool, id: i64, status: JobStatus, detail: Option<String>) {
    let r = db::with_conn(pool, move |conn| {
        db::writer::update_job_status(conn, id, status, detail.as_deref())
    })
    .await;
    if let Err(e) = r {
        error!("Failed to record job {} as {}: {:#}", id, status.as_str(), e);
    }
}

/// Record a pending job and run `work` in the background. The job's detail
/// becomes the JSON of the result, or the error chain on failure. A lease,
/// when given, is held while `work` runs and released before the final
/// status is written.
pub async fn submit<F, T>(pool: &DbPool, kind: JobKind, lease: Option<IndexerLease>, work: F) -> Result<i64>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let id = db::with_conn(pool, move |conn| db::writer::insert_job(conn, kind)).await?;
    let pool = pool.clone();
    tokio::spawn(async move {
        set_status(&pool, id, JobStatus::Running, None).await;
        info!("Job {} ({}) started", id, kind.as_str());
        let outcome = work.await;
        drop(lease);
        match outcome {
            Ok(result) => {
                let detail = serde_json::to_string(&result).ok();
                set_status(&pool, id, JobStatus::Done, detail).await;
                info!("Job {} ({}) done", id, kind.as_str());
            }
            Err(e) => {
                error!("Job {} ({}) failed: {:#}", id, kind.as_str(), e);
                set_status(&pool, id, JobStatus::Failed, Some(format!("{:#}", e))).await;
            }
        }
    });
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobRecord;
    use std::time::Duration;

    fn temp_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::create_pool(dir.path().join("db").join("jobs.db"), 2).unwrap();
        (dir, pool)
    }

    async fn wait_terminal(pool: &DbPool, id: i64) -> JobRecord {
        for _ in 0..200 {
            let job = db::with_conn(pool, move |c| db::query::get_job(c, id)).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let lease = IndexerLease::try_acquire(&flag).unwrap();
        assert!(IndexerLease::try_acquire(&flag).is_none());
        drop(lease);
        assert!(IndexerLease::try_acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_job_runs_to_done_and_releases_lease() {
        let (_dir, pool) = temp_pool();
        let flag = Arc::new(AtomicBool::new(false));
        let lease = IndexerLease::try_acquire(&flag);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let id = submit(&pool, JobKind::Process, lease, async move {
            rx.await?;
            Ok(42u32)
        })
        .await
        .unwrap();
        assert!(flag.load(Ordering::Acquire));
        let job = db::with_conn(&pool, move |c| db::query::get_job(c, id)).await.unwrap().unwrap();
        assert!(!job.status.is_terminal());

        tx.send(()).unwrap();
        let job = wait_terminal(&pool, id).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.detail.as_deref(), Some("42"));
        assert!(!flag.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let (_dir, pool) = temp_pool();
        let id = submit(&pool, JobKind::Export, None, async { Err::<(), _>(anyhow::anyhow!("remote gone")) })
            .await
            .unwrap();
        let job = wait_terminal(&pool, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.detail.as_deref(), Some("remote gone"));
    }
}
