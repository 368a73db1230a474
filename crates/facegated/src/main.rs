use std::sync::Arc;

use anyhow::{bail, Context, Result};
use facegate_core::{ArcFaceExtractor, EncodingExtractor, IdentityMatcher};
use facegate_store::{EncodingStore, FaceStore, MemoryStore, SqliteStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use config::Config;
use dbus_interface::{FacegateInterface, BUS_NAME, OBJECT_PATH};
use service::FaceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        dimension = config.dimension,
        metric = %config.metric,
        threshold = config.threshold,
        ambiguity_margin = config.ambiguity_margin,
        "matching policy"
    );

    let store: Arc<dyn FaceStore> = if config.in_memory {
        tracing::warn!("in-memory store: enrollments are lost on exit");
        Arc::new(MemoryStore::new(config.dimension))
    } else {
        Arc::new(
            SqliteStore::open(&config.db_path, config.dimension)
                .with_context(|| format!("opening {}", config.db_path.display()))?,
        )
    };
    tracing::info!(encodings = store.count()?, "encoding store ready");

    let extractor = ArcFaceExtractor::load(&config.scrfd_model_path(), &config.arcface_model_path())?;
    if extractor.dimension() != config.dimension {
        bail!(
            "extractor produces {}-dim encodings but the store is configured for {}",
            extractor.dimension(),
            config.dimension
        );
    }
    let engine = engine::spawn_engine(Box::new(extractor))?;

    let matcher = IdentityMatcher::new(config.dimension, config.policy());
    let service = Arc::new(FaceService::new(engine, store, matcher));

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacegateInterface::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
