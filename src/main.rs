use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// paneld, a headless control-surface orchestration daemon
#[derive(Parser)]
#[command(name = "paneld", version, about)]
struct Cli {
    /// Path to the config file (TOML).
    #[arg(short, long, default_value = "/etc/paneld/config.toml")]
    config: PathBuf,

    /// Enable JSON log output (for journald).
    #[arg(long)]
    json: bool,

    /// Validate config and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paneld=info"));

    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    info!("paneld v{}", env!("CARGO_PKG_VERSION"));

    // Load config.
    let config_path = cli
        .config
        .canonicalize()
        .unwrap_or_else(|_| cli.config.clone());
    let config = paneld::config::load(&config_path)?;

    if cli.check {
        println!(
            "config OK: {} pages of {} controls, db at {}",
            config.grid.pages,
            config.grid.buttons_per_page(),
            config.paneld.db_path.display(),
        );
        return Ok(());
    }

    // Run the daemon.
    paneld::daemon::run(config).await?;

    Ok(())
}
