use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use tracing::info;

use crate::api::error::ApiError;
use crate::jobs::{self, IndexerLease};
use crate::models::job::JobKind;
use crate::pipeline::acquire::{self, AcquireSettings};
use crate::pipeline::catalog;
use crate::{db, export, label, profiles, AppState};

pub const FACE_LABELS_HEADER: &str = "x-face-labels";

type ApiResult<T> = Result<T, ApiError>;

/// Record a job for `work` and acknowledge it. Exclusive kinds take the
/// indexer lease first and are refused with 409 while another one runs.
async fn start_job<F, T>(state: &AppState, kind: JobKind, work: F) -> ApiResult<i64>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: serde::Serialize + Send + 'static,
{
    let lease = if kind.is_exclusive() {
        match IndexerLease::try_acquire(&state.indexer_busy) {
            Some(l) => Some(l),
            None => return Err(ApiError::Busy("Another indexing job is running".into())),
        }
    } else {
        None
    };
    let id = jobs::submit(&state.pool, kind, lease, work).await?;
    info!("Accepted {} job {}", kind.as_str(), id);
    Ok(id)
}

/// Body of the job-starting routes: no JSON body at all means "use the
/// defaults", a body that does not parse is a 400.
fn body_or_default<T: Default>(req: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match req {
        Ok(Json(r)) => Ok(r),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(e) => Err(ApiError::BadRequest(e.body_text())),
    }
}

fn accepted(job_id: i64, kind: JobKind) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::ACCEPTED, Json(serde_json::json!({
        "success": true,
        "job_id": job_id,
        "kind": kind.as_str(),
    })))
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "profiles": state.library_snapshot().len(),
    });
    (StatusCode::OK, Json(body))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let totals = db::with_conn(&state.pool, db::query::store_totals).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({
        "counters": state.stats.snapshot(),
        "store": totals,
        "indexer_busy": state.indexer_busy.load(std::sync::atomic::Ordering::Relaxed),
    }))))
}

#[derive(Deserialize, Default)]
pub struct LocationReq {
    location: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct AcquireReq {
    location: Option<String>,
    folder: Option<PathBuf>,
    max_size: Option<u32>,
}

#[derive(Deserialize)]
pub struct ExportReq {
    name: String,
    location: Option<String>,
    output_dir: String,
}

#[derive(Deserialize)]
pub struct EnrollReq {
    folder: PathBuf,
}

pub async fn index_catalog(
    State(state): State<Arc<AppState>>,
    req: Result<Json<LocationReq>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body_or_default(req)?;
    let location = req.location.unwrap_or_else(|| state.config.remote_location.clone());
    let st = state.clone();
    let id = start_job(&state, JobKind::IndexCatalog, async move {
        let summary = catalog::index_catalog(&st.pool, st.content.as_ref(), &location).await?;
        st.stats.inc_indexed(summary.indexed as u64);
        Ok(summary)
    })
    .await?;
    Ok(accepted(id, JobKind::IndexCatalog))
}

pub async fn acquire_images(
    State(state): State<Arc<AppState>>,
    req: Result<Json<AcquireReq>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body_or_default(req)?;
    if req.max_size == Some(0) {
        return Err(ApiError::BadRequest("max_size must be positive".into()));
    }
    let folder = req.folder.unwrap_or_else(|| state.config.acquire_dir.clone());
    if folder == state.config.work_dir {
        return Err(ApiError::BadRequest("folder is the pipeline's scratch directory".into()));
    }
    let location = req.location.unwrap_or_else(|| state.config.remote_location.clone());
    let settings = AcquireSettings {
        folder,
        max_size: req.max_size.unwrap_or(state.config.max_image_size),
    };
    let st = state.clone();
    let id = start_job(&state, JobKind::Acquire, async move {
        acquire::acquire_unresolved(&st.pool, st.content.as_ref(), &location, &settings, Some(st.stats.as_ref())).await
    })
    .await?;
    Ok(accepted(id, JobKind::Acquire))
}

pub async fn process_images(
    State(state): State<Arc<AppState>>,
    req: Result<Json<LocationReq>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body_or_default(req)?;
    let location = req.location.unwrap_or_else(|| state.config.remote_location.clone());
    let pipeline = state.pipeline();
    let id = start_job(&state, JobKind::Process, async move { pipeline.run(&location).await }).await?;
    Ok(accepted(id, JobKind::Process))
}

// Header values must be visible ASCII; names outside it go out as \u escapes
fn ascii_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

pub async fn label_image(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    if body.is_empty() || image::guess_format(&body).is_err() {
        return Err(ApiError::BadRequest("Body is not a supported image".into()));
    }
    let encoder = state.encoder.clone();
    let library = state.library_snapshot();
    let font = state.caption_font.clone();
    let labeled = tokio::task::spawn_blocking(move || label::label_image(&encoder, &library, font.as_ref(), &body))
        .await
        .map_err(anyhow::Error::from)??;

    let labels = serde_json::to_string(&labeled.faces).map_err(anyhow::Error::from)?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(
        HeaderName::from_static(FACE_LABELS_HEADER),
        HeaderValue::from_str(&ascii_json(&labels)).map_err(anyhow::Error::from)?,
    );
    Ok((StatusCode::OK, headers, labeled.jpeg))
}

pub async fn image_faces(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> ApiResult<impl IntoResponse> {
    let h = hash.clone();
    match db::with_conn(&state.pool, move |conn| db::query::image_record(conn, &h)).await? {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(ApiError::NotFound(format!("Unknown image {}", hash))),
    }
}

pub async fn identity_images(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    let n = name.clone();
    let images = db::with_conn(&state.pool, move |conn| {
        let mut out = Vec::new();
        for hash in db::query::images_for_identity(conn, &n)? {
            let path = db::query::catalog_path(conn, &hash)?;
            out.push(serde_json::json!({ "hash": hash, "path": path }));
        }
        Ok(out)
    })
    .await?;
    if images.is_empty() {
        return Err(ApiError::NotFound(format!("No photos of {}", name)));
    }
    Ok((StatusCode::OK, Json(serde_json::json!({
        "identity": name,
        "count": images.len(),
        "images": images,
    }))))
}

pub async fn export_identity(State(state): State<Arc<AppState>>, Json(req): Json<ExportReq>) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() || req.output_dir.trim().is_empty() {
        return Err(ApiError::BadRequest("name and output_dir are required".into()));
    }
    let location = req.location.unwrap_or_else(|| state.config.remote_location.clone());
    let (name, output_dir) = (req.name.clone(), req.output_dir.clone());
    let plan = db::with_conn(&state.pool, move |conn| export::plan_export(conn, &name, &location, &output_dir))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No identity matches {:?}", req.name)))?;

    let (identity, photos, folder) = (plan.identity.clone(), plan.copies.len(), plan.folder.clone());
    let content = state.content.clone();
    let id = start_job(&state, JobKind::Export, async move { export::run_export(content.as_ref(), &plan).await }).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({
        "success": true,
        "job_id": id,
        "identity": identity,
        "photos": photos,
        "folder": folder,
    }))))
}

pub async fn enroll_profiles(State(state): State<Arc<AppState>>, Json(req): Json<EnrollReq>) -> ApiResult<impl IntoResponse> {
    if !req.folder.is_dir() {
        return Err(ApiError::BadRequest(format!("{} is not a directory", req.folder.display())));
    }
    let st = state.clone();
    let id = start_job(&state, JobKind::Enroll, async move {
        let (library, report) = profiles::enroll_and_store(&st.pool, st.encoder.clone(), req.folder).await?;
        st.replace_library(library);
        Ok(report)
    })
    .await?;
    Ok(accepted(id, JobKind::Enroll))
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    match db::with_conn(&state.pool, move |conn| db::query::get_job(conn, id)).await? {
        Some(job) => Ok((StatusCode::OK, Json(job))),
        None => Err(ApiError::NotFound(format!("No job {}", id))),
    }
}

pub async fn clear_skip(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> ApiResult<impl IntoResponse> {
    let _lease = IndexerLease::try_acquire(&state.indexer_busy)
        .ok_or_else(|| ApiError::Busy("Cannot change image state while indexing".into()))?;
    let h = hash.clone();
    if !db::with_conn(&state.pool, move |conn| db::writer::clear_skip(conn, &h)).await? {
        return Err(ApiError::NotFound(format!("{} is not skipped", hash)));
    }
    Ok((StatusCode::OK, Json(serde_json::json!({ "success": true, "hash": hash }))))
}

pub async fn reset_image(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> ApiResult<impl IntoResponse> {
    let _lease = IndexerLease::try_acquire(&state.indexer_busy)
        .ok_or_else(|| ApiError::Busy("Cannot change image state while indexing".into()))?;
    let h = hash.clone();
    let removed = db::with_conn(&state.pool, move |conn| {
        if db::query::catalog_path(conn, &h)?.is_none() {
            return Ok(None);
        }
        db::writer::reset_image(conn, &h).map(Some)
    })
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Unknown image {}", hash)))?;
    Ok((StatusCode::OK, Json(serde_json::json!({
        "success": true,
        "hash": hash,
        "rows_removed": removed,
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_json_escapes_non_ascii() {
        assert_eq!(ascii_json(r#"[{"name":"Zoë"}]"#), r#"[{"name":"Zo\u00eb"}]"#);
        assert_eq!(ascii_json("😀"), "\\ud83d\\ude00");
        assert!(HeaderValue::from_str(&ascii_json(r#"{"n":"Renée"}"#)).is_ok());
    }
}
