use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use monitor_bridge::config::{BridgeConfig, FileConfig, load_config};
use monitor_bridge::provider::CommandProvider;
use monitor_bridge::{build_state, create_router, shutdown};
use monitor_hub::IdleCallback;

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Shares device monitor streams between many clients")]
struct Args {
    /// Path to bridge.toml
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Port for the HTTP server (0 for automatic)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Exit this long after the last client detaches (0 disables)
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over the built-in defaults
    let default_filter = if args.debug {
        "monitor_bridge=debug,monitor_hub=debug,tower_http=debug"
    } else {
        "monitor_bridge=info,monitor_hub=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut file_config: FileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(idle) = args.idle_timeout_ms {
        file_config.attachments.idle_timeout_ms = idle;
    }
    let config = BridgeConfig::from_file(&file_config)?;

    let idle = Arc::new(Notify::new());
    let on_idle: IdleCallback = {
        let idle = idle.clone();
        Arc::new(move || idle.notify_one())
    };

    let provider = Arc::new(CommandProvider::new(config.provider.clone()));
    let state = build_state(&config, provider, Some(on_idle)).await;
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let actual_addr = listener.local_addr()?;

    // Machine-readable first, for whoever spawned us
    println!("BRIDGE_PORT={}", actual_addr.port());
    println!("BRIDGE_ADDR={}", actual_addr);

    info!("Monitor bridge listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET    /api/control               - Control channel (WebSocket)");
    info!("  POST   /api/monitors              - Open a monitor");
    info!("  DELETE /api/monitors/:id          - Close a subscription");
    info!("  GET    /api/monitors/:id/ws       - Binary duplex channel (WebSocket)");
    info!("  GET    /api/monitors/:id/stream   - Chunked reader");
    info!("  POST   /api/attach|heartbeat|detach - Client liveness");
    info!("  GET    /api/sessions              - Session snapshots");

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            result.context("Server error")?;
        }
        _ = idle.notified() => {
            info!("No clients left, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cleaning up...");
        }
    }

    shutdown(&state).await;
    info!("Shutdown complete");
    Ok(())
}
