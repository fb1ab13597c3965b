use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_tracker::{router, AppState, TrackerDb};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "swarm-tracker", version, about = "Swarm tracker")]
struct Args {
    #[arg(long, env = "TRACKER_LISTEN", default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// JSON snapshot of swarm state, reloaded at start.
    #[arg(long, env = "TRACKER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Peers announcing within this window count as active.
    #[arg(long, default_value_t = 300)]
    active_window_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let db = match &args.db_path {
        Some(path) => TrackerDb::load(path)
            .with_context(|| format!("failed to load tracker db {}", path.display()))?,
        None => TrackerDb::default(),
    };
    info!(files = db.files.len(), "Tracker state loaded");

    let state = Arc::new(AppState::new(
        db,
        args.db_path.clone(),
        Duration::from_secs(args.active_window_secs),
    ));
    let app = router(state);

    info!("Swarm tracker listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
