mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::identity::PgTicketVerifier;
use services::snapshot::{PgSnapshotStore, spawn_snapshot_task};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let state = state::AppState::new(
        Arc::new(PgSnapshotStore::new(pool.clone())),
        Arc::new(PgTicketVerifier::new(pool)),
        config::Config::from_env(),
    );

    // Spawn the periodic snapshot save task.
    let _snapshots = spawn_snapshot_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "syncroom listening");
    axum::serve(listener, app).await.expect("server failed");
}
