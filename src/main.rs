use std::net::SocketAddr;
use std::sync::Arc;
use faceatlas::db;
use faceatlas::pipeline::encode::FaceEncoder;
use faceatlas::profiles;
use faceatlas::remote::{ContentStore, LocalStore, RcloneStore};
use faceatlas::utils::config::{Config, StoreBackend};
use faceatlas::utils::logging;
use tracing::{info, warn};

fn content_store(cfg: &Config) -> Arc<dyn ContentStore> {
    match cfg.store_backend {
        StoreBackend::Rclone => match RcloneStore::locate(&cfg.rclone_bin) {
            Some(store) => {
                info!("Using rclone content store ({})", cfg.rclone_bin);
                Arc::new(store)
            }
            None => {
                warn!("rclone binary {:?} not found; serving {:?} locally instead", cfg.rclone_bin, cfg.local_root);
                Arc::new(LocalStore::new(cfg.local_root.clone()))
            }
        },
        StoreBackend::Local => {
            info!("Using local content store at {:?}", cfg.local_root);
            Arc::new(LocalStore::new(cfg.local_root.clone()))
        }
    }
}

#[cfg(feature = "facial-recognition")]
async fn face_encoder(cfg: &Config) -> FaceEncoder {
    let mut model = faceatlas::pipeline::face::OnnxFaceModel::new(cfg);
    match model.initialize().await {
        Ok(()) => {
            info!("Face models loaded (detector: {:?})", model.loaded_variant());
            FaceEncoder::new(Arc::new(model))
        }
        Err(e) => {
            tracing::error!("Failed to initialize face models: {:#}", e);
            FaceEncoder::unavailable(format!("{:#}", e))
        }
    }
}

#[cfg(not(feature = "facial-recognition"))]
async fn face_encoder(_cfg: &Config) -> FaceEncoder {
    warn!("Built without facial-recognition; processing and labeling will fail");
    FaceEncoder::unavailable("built without facial-recognition")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();
    std::fs::create_dir_all(&cfg.work_dir)?;
    if cfg.acquire_dir == cfg.work_dir {
        anyhow::bail!("FACEATLAS_ACQUIRE_DIR must differ from the work dir, which is emptied after every batch");
    }
    // Small pool: the pipeline is sequential, the rest is API reads
    let pool = db::create_pool(cfg.db_path(), 8)?;

    let interrupted = db::with_conn(&pool, db::writer::fail_interrupted_jobs).await?;
    if interrupted > 0 {
        warn!("Marked {} interrupted jobs as failed", interrupted);
    }

    let content = content_store(&cfg);
    let encoder = face_encoder(&cfg).await;
    let library = profiles::load_library(&pool).await?;
    info!("Loaded {} profiles", library.len());

    let port = cfg.port;
    let state = Arc::new(faceatlas::AppState::new(cfg, pool, content, encoder, library));
    let app = faceatlas::api::routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}
