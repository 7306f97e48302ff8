use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use canvascast_common::check_public_bind_allowed;
use canvascast_pair::{router, PairingDirectory};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "canvascast-pair")]
struct Args {
    /// HTTP listen address
    #[arg(long, env = "CANVASCAST_PAIR_LISTEN_ADDR", default_value = "127.0.0.1:8081")]
    listen: SocketAddr,

    /// Directory with the call frontend
    #[arg(long, env = "CANVASCAST_FRONTEND_DIR")]
    frontend_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    canvascast_common::init_tracing_with_default(&args.log_level);
    check_public_bind_allowed(args.listen)?;

    let directory = Arc::new(PairingDirectory::new());
    let app = router(directory, args.frontend_dir);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("pairing relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("pairing relay stopped");
    Ok(())
}
