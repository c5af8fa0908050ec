mod api;
mod config;
mod error;
mod models;
mod services;

use crate::api::AppState;
use crate::config::Config;
use crate::services::{
    AuthService, ImportService, ListenCountCache, ListenExporter, ListenStore, PgListenStore,
    RedisListenCount,
};
use axum::http::{header, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,listen_archive=debug,tower_http=debug".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    tracing::info!("Configuration loaded");

    if config.upload_folder.is_none() {
        tracing::warn!("UPLOAD_FOLDER is not set; archive imports will be refused");
    }

    // Connect to database
    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Connected to Redis");

    // Initialize services
    let listen_store: Arc<dyn ListenStore> = Arc::new(PgListenStore::new(db.clone()));
    let listen_counts: Arc<dyn ListenCountCache> = Arc::new(RedisListenCount::new(redis));

    let auth_service = Arc::new(AuthService::new(&config));
    let exporter = Arc::new(ListenExporter::new(
        listen_store.clone(),
        config.export_fetch_count,
    ));
    let importer = Arc::new(ImportService::new(
        listen_store.clone(),
        listen_counts.clone(),
        config.upload_folder.clone(),
        config.max_content_length,
    ));

    let app_state = Arc::new(AppState {
        db,
        auth_service,
        listen_store,
        listen_counts,
        exporter,
        importer,
        lastfm_api_key: config.lastfm_api_key.clone(),
        public_url: config.public_url.clone(),
    });

    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    // Build router
    let app = api::router(app_state)
        .layer(CompressionLayer::new())
        .layer(
            cors.allow_methods([Method::GET, Method::POST])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
                .expose_headers([header::CONTENT_DISPOSITION]),
        );

    // Start server
    let addr = format!("{}:{}", config.server_host, config.server_port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
