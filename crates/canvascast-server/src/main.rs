use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use canvascast_common::check_public_bind_allowed;
use canvascast_server::{
    router, webrtc_bridge::DEFAULT_STUN_SERVER, BroadcastHub, KeyframeScope, ServerConfig,
    WebRtcEngine,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "canvascast-server")]
struct Args {
    /// HTTP listen address for signaling, health and the frontend
    #[arg(long, env = "CANVASCAST_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// STUN/ICE server URL (repeatable)
    #[arg(
        long = "stun-server",
        env = "CANVASCAST_STUN_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    stun_servers: Vec<String>,

    /// Directory with the browser frontend
    #[arg(long, env = "CANVASCAST_FRONTEND_DIR")]
    frontend_dir: Option<PathBuf>,

    /// Minimum spacing between keyframe requests
    #[arg(long, default_value_t = 500)]
    keyframe_interval_ms: u64,

    /// Which connections receive keyframe requests
    #[arg(long, value_enum, default_value_t = KeyframeScope::Producer)]
    keyframe_scope: KeyframeScope,

    /// Inbound packets queued ahead of the relay
    #[arg(long, default_value_t = 256)]
    relay_queue: usize,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            stun_servers: args.stun_servers,
            frontend_dir: args.frontend_dir,
            keyframe_interval: Duration::from_millis(args.keyframe_interval_ms),
            keyframe_scope: args.keyframe_scope,
            relay_queue: args.relay_queue,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    canvascast_common::init_tracing_with_default(&args.log_level);
    let config = ServerConfig::from(args);

    check_public_bind_allowed(config.listen)?;

    let engine = Arc::new(
        WebRtcEngine::new(&config.stun_servers).context("failed to build webrtc engine")?,
    );
    let (hub, normalizer) = BroadcastHub::start(engine.clone(), engine.whiteboard_sink(), &config);

    if let Some(dir) = &config.frontend_dir {
        if !dir.is_dir() {
            warn!("frontend directory {} does not exist", dir.display());
        }
    }

    let app = router(hub, config.frontend_dir.clone());
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        "canvascast server listening on {} (keyframe every {:?}, scope {:?})",
        listener.local_addr()?,
        config.keyframe_interval,
        config.keyframe_scope
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    normalizer.abort();
    info!("canvascast server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
