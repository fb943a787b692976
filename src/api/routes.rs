use axum::{Router, routing::{get, post, delete}};
use std::sync::Arc;
use tower_http::cors::{CorsLayer, AllowOrigin};
use axum::http::Method;
use crate::AppState;
use crate::api::handlers;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT])
        .expose_headers(vec![axum::http::HeaderName::from_static(handlers::FACE_LABELS_HEADER)]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/catalog/index", post(handlers::index_catalog))
        .route("/images/acquire", post(handlers::acquire_images))
        .route("/images/process", post(handlers::process_images))
        .route("/images/label", post(handlers::label_image))
        .route("/images/:hash/faces", get(handlers::image_faces))
        .route("/images/:hash/skip", delete(handlers::clear_skip))
        .route("/images/:hash/reset", post(handlers::reset_image))
        .route("/faces/:name/images", get(handlers::identity_images))
        .route("/export", post(handlers::export_identity))
        .route("/profiles/enroll", post(handlers::enroll_profiles))
        .route("/jobs/:id", get(handlers::get_job))
        .layer(cors)
        .with_state(state)
}
