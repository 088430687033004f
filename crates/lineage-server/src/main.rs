use std::path::PathBuf;

use clap::Parser;
use lineage_server::ServerBuilder;
use lineage_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};

#[derive(Debug, Parser)]
#[command(name = "lineage-server", version, about = "Hierarchy resolution server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "LINEAGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    lineage_server::observability::init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.to_string_lossy().to_string();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    if cli.print_config {
        match toml::to_string_pretty(&cfg) {
            Ok(text) => {
                println!("{text}");
                return;
            }
            Err(e) => {
                eprintln!("Failed to render configuration: {e}");
                std::process::exit(2);
            }
        }
    }

    tracing::info!(
        path = %config_path,
        backend = ?cfg.storage.backend,
        redis = cfg.redis.enabled,
        views = cfg.refresh.views.len(),
        "Configuration loaded"
    );

    lineage_server::observability::apply_logging_level(&cfg.logging.level);

    let server = match ServerBuilder::new().with_config(cfg).build().await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        tracing::error!(error = %format!("{e:#}"), "server error");
        std::process::exit(1);
    }
}
