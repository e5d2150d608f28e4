//! Tessera server entry point.
//!
//! ```text
//! tessera-server                  Run in the foreground
//! tessera-server --config <path>  Load a custom config TOML
//! tessera-server --port <n>       Override the listening port
//! tessera-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_server::config::ServerConfig;
use tessera_server::service::TesseraService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tessera-server", about = "Tessera screen-sharing server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tessera-server.toml")]
    config: PathBuf,

    /// Listen on this port instead of the configured one.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tessera-server v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {}", config.network.port);
    info!(
        "segments: {}x{}, refresh floor {} ms",
        config.screen.segment_width, config.screen.segment_height, config.screen.min_refresh_ms
    );
    if config.password().is_some() {
        info!("viewer password required");
    }

    let service = TesseraService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
