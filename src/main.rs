use clap::Parser;
use pointsminer::chat::{ChatPresence, IrcChat};
use pointsminer::liveness::TcpProbe;
use pointsminer::status::{self, StatusState};
use pointsminer::transport::WebSocketConnector;
use pointsminer::{Config, GqlClient, Miner, MinerOptions, Sources};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(
    name = "pointsminer",
    about = "Mine channel points, watch streaks and predictions"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Dry run mode - log bets and claims instead of sending them
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Serve /status and /health on this port
    #[arg(long)]
    status_port: Option<u16>,

    /// Also mine every followed channel
    #[arg(long)]
    followers: bool,
}

fn init_logging(level: &str) {
    let builder = FmtSubscriber::builder()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    if std::env::var("RUST_LOG").is_ok() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
        return;
    }

    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    builder.with_max_level(level).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    if args.followers {
        config.followers = true;
    }
    if args.status_port.is_some() {
        config.status_port = args.status_port;
    }

    info!("pointsminer starting...");
    info!("  Login: {}", config.username);
    info!("  Streamers: {}", config.streamers.len());
    info!("  Followers: {}", config.followers);
    info!("  Priority: {:?}", config.priority);
    if !config.has_sources() {
        tracing::warn!("No streamer source configured, set MINER_STREAMERS, MINER_TRACKING_FILE or MINER_FOLLOWERS");
    }

    let api = Arc::new(GqlClient::connect(&config.username, &config.auth_token, args.dry_run).await?);
    info!("Logged in");

    let chat: Arc<dyn ChatPresence> = Arc::new(IrcChat::new(&config.username, &config.auth_token));
    let miner = Miner::new(
        api,
        Arc::new(WebSocketConnector::new(&config.pubsub_url)),
        Arc::new(TcpProbe::default()),
        Some(chat),
        Sources::from_config(&config),
        MinerOptions::from_config(&config),
    );

    if let Some(port) = config.status_port {
        let state = Arc::new(StatusState {
            session: miner.session().clone(),
            store: miner.store().clone(),
            pool: Some(miner.pool().clone()),
        });
        let cancel = miner.cancel_token();
        tokio::spawn(async move {
            if let Err(e) = status::serve(port, state, cancel).await {
                tracing::error!(error = %e, "Status endpoint failed");
            }
        });
    }

    let cancel = miner.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });

    let report = miner.run().await?;
    info!(
        streamers = report.streamers.len(),
        predictions = report.predictions.len(),
        "pointsminer stopped"
    );

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
