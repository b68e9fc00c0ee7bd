//! vdigate-web - virtual-disk image gateway server
//!
//! Exposes raw block devices as streamed VHD images over HTTP and accepts
//! raw, VHD, and resumable BITS uploads into them.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use vdigate_web::GatewayConfig;

#[derive(Parser)]
#[command(name = "vdigate-web")]
#[command(about = "Sparse-disk image gateway: VHD streaming and BITS uploads over HTTP")]
#[command(version)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(long, env = "VDIGATE_CONFIG", default_value = "./vdigate.json")]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen))?;

    for (path, pc) in &config.paths {
        tracing::info!(
            %path,
            backing = %pc.backing.display(),
            get_vhd = pc.enable_getvhd,
            put = pc.enable_put,
            put_vhd = pc.enable_putvhd,
            bits = pc.enable_bits,
            bits_vhd = pc.enable_bitsvhd,
            "serving path"
        );
    }

    let app = vdigate_web::app(config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("vdigate listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
