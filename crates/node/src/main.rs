use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use swarm_node::context::PeerContext;
use swarm_node::endpoint;
use swarm_node::tracker::{Tracker, TrackerClient};
use swarm_node::{DownloadOutcome, NodeConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "swarm-node", version, about = "Swarm file-sharing peer")]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long, env = "SWARM_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Write the resolved configuration back to --config.
    #[arg(long, default_value_t = false)]
    save_config: bool,

    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Default)]
struct Overrides {
    #[arg(long, env = "SWARM_TRACKER_URL")]
    tracker_url: Option<String>,
    #[arg(long)]
    listen_port: Option<u16>,
    #[arg(long)]
    advertise_host: Option<String>,
    #[arg(long)]
    storage_path: Option<PathBuf>,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    #[arg(long)]
    chunk_size: Option<u64>,
    #[arg(long)]
    announce_interval_secs: Option<u64>,
    #[arg(long)]
    max_concurrent_fetches: Option<usize>,
    #[arg(long)]
    chunk_fetch_timeout_secs: Option<u64>,
    #[arg(long)]
    max_retries_per_chunk: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve stored chunks and seed files until Ctrl-C.
    Serve {
        #[arg(long = "share")]
        share: Vec<PathBuf>,
    },
    /// Share one local file and keep seeding it.
    Share { path: PathBuf },
    /// Print the files the tracker knows about.
    List,
    /// Download a file from the swarm, then keep seeding it.
    Download {
        file_id: String,
        #[arg(long, default_value_t = false)]
        exit_on_complete: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = resolve_config(&args)?;
    match args.command {
        Command::List => list_files(&config).await,
        Command::Serve { share } => run_peer(config, share, None).await,
        Command::Share { path } => run_peer(config, vec![path], None).await,
        Command::Download {
            file_id,
            exit_on_complete,
        } => run_peer(config, Vec::new(), Some((file_id, exit_on_complete))).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }
}

fn resolve_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::load(path)?.unwrap_or_default(),
        None => NodeConfig::default(),
    };

    let o = &args.overrides;
    if let Some(v) = &o.tracker_url {
        cfg.tracker_url = v.clone();
    }
    if let Some(v) = o.listen_port {
        cfg.listen_port = v;
    }
    if let Some(v) = &o.advertise_host {
        cfg.advertise_host = Some(v.clone());
    }
    if let Some(v) = &o.storage_path {
        cfg.storage_path = v.clone();
    }
    if let Some(v) = &o.download_dir {
        cfg.download_dir = v.clone();
    }
    if let Some(v) = o.chunk_size {
        cfg.chunk_size = v;
    }
    if let Some(v) = o.announce_interval_secs {
        cfg.announce_interval_secs = v;
    }
    if let Some(v) = o.max_concurrent_fetches {
        cfg.max_concurrent_fetches = v;
    }
    if let Some(v) = o.chunk_fetch_timeout_secs {
        cfg.chunk_fetch_timeout_secs = v;
    }
    if let Some(v) = o.max_retries_per_chunk {
        cfg.max_retries_per_chunk = v;
    }
    cfg.validate().context("invalid node configuration")?;

    if args.save_config {
        let path = args
            .config
            .as_ref()
            .context("--save-config needs --config")?;
        cfg.save(path)?;
        info!(path = %path.display(), "Saved node configuration");
    }
    Ok(cfg)
}

async fn list_files(config: &NodeConfig) -> anyhow::Result<()> {
    let tracker = TrackerClient::new(&config.tracker_url)?;
    let listing = tracker
        .list_files()
        .await
        .with_context(|| format!("failed to list files at {}", config.tracker_url))?;
    if listing.files.is_empty() {
        println!("no files tracked");
    }
    for (file_id, f) in listing.files {
        println!(
            "{file_id}  {}  {} bytes  {} chunks  {} active peers",
            f.filename, f.size, f.chunks, f.active_peers
        );
    }
    Ok(())
}

async fn run_peer(
    mut config: NodeConfig,
    share: Vec<PathBuf>,
    download: Option<(String, bool)>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("failed to bind peer port {}", config.listen_port))?;
    config.listen_port = listener.local_addr()?.port();

    let ctx = PeerContext::connect(config).context("failed to start peer")?;
    let app = endpoint::router(ctx.store()).merge(endpoint::status_router(Arc::clone(&ctx)));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(endpoint::serve(listener, app, async move {
        let _ = shutdown_rx.await;
    }));
    info!(peer_id = %ctx.peer_id(), port = ctx.config().listen_port, "Peer endpoint listening");

    let resumed = ctx.resume_seeding()?;
    if !resumed.is_empty() {
        info!(files = resumed.len(), "Resumed seeding stored files");
    }
    for path in &share {
        let file_id = ctx
            .share(path)
            .await
            .with_context(|| format!("failed to share {}", path.display()))?;
        println!("{file_id}  {}", path.display());
    }

    let mut keep_running = true;
    if let Some((file_id, exit_on_complete)) = download {
        keep_running = download_file(&ctx, &file_id).await? && !exit_on_complete;
    }
    if keep_running {
        info!("Seeding; press Ctrl-C to stop");
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Peer endpoint stopped with error: {e}"),
        Err(e) => warn!("Peer endpoint task failed: {e}"),
    }
    ctx.shutdown()?;
    Ok(())
}

/// Returns `true` when the file completed and should keep being seeded.
async fn download_file(ctx: &Arc<PeerContext>, file_id: &str) -> anyhow::Result<bool> {
    let handle = ctx.start_download(file_id)?;
    let token = handle.token;
    let mut progress = handle.progress();
    let wait = handle.wait();
    tokio::pin!(wait);

    let mut watching = true;
    let mut cancelling = false;
    let outcome = loop {
        tokio::select! {
            res = &mut wait => break res,
            changed = progress.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let p = progress.borrow_and_update().clone();
                info!(
                    %file_id,
                    state = ?p.state,
                    downloaded = p.downloaded_chunks,
                    total = p.total_chunks,
                    "{:.1}%",
                    p.progress * 100.0
                );
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                warn!(%file_id, "Cancelling download");
                if let Err(e) = ctx.cancel(token) {
                    warn!(%file_id, "Cancel not delivered: {e}");
                }
                cancelling = true;
            }
        }
    };

    match outcome.with_context(|| format!("download of {file_id} failed"))? {
        DownloadOutcome::Completed { path } => {
            println!("{}", path.display());
            Ok(true)
        }
        DownloadOutcome::Cancelled { verified } => {
            info!(%file_id, verified, "Download cancelled; stored chunks kept for resume");
            Ok(false)
        }
        DownloadOutcome::Failed { chunk } => {
            error!(%file_id, chunk, "Download failed");
            anyhow::bail!("download of {file_id} failed at chunk {chunk}")
        }
    }
}
