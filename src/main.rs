use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stagelight::api::ApiServerBuilder;
use stagelight::db::{self, SettingsRepo};
use stagelight::{Config, HostServices, ModuleRegistry, PluginManager};

/// Stagelight - plugin host for a live-event companion server
#[derive(Parser)]
#[command(name = "stagelight", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory scanned for plugins
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "STAGELIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load plugins and serve the HTTP API (default)
    Serve,
    /// List discovered plugins and their persisted state
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,stagelight=info",
        1 => "info,stagelight=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.plugins_dir {
        config.plugins.dir = dir;
    }
    tracing::debug!(?config, "loaded configuration");

    let pool = db::init(config.database_path())?;
    let services = Arc::new(HostServices::new(
        SettingsRepo::new(pool),
        config.plugins.stale_routes,
    ));

    // Plugin code is linked in by embedders; the stock binary ships none
    let modules = Arc::new(ModuleRegistry::new());
    let manager = Arc::new(
        PluginManager::new(config.plugins.clone(), Arc::clone(&services), modules).await,
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::List => list(&manager).await,
        Command::Serve => serve(manager, config.server.port).await,
    }
}

async fn serve(manager: Arc<PluginManager>, port: u16) -> anyhow::Result<()> {
    // The plugin router must be mounted before the first plugin loads
    let server = ApiServerBuilder::new(Arc::clone(&manager), port).build()?;

    let summary = manager.load_all_plugins().await;
    tracing::info!(
        loaded = summary.loaded,
        disabled = summary.disabled,
        failed = summary.failed,
        port,
        "stagelight ready"
    );

    let mut handle = server.spawn();
    tokio::select! {
        result = &mut handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            handle.abort();
        }
    }

    let unloaded = manager.unload_all().await;
    tracing::info!(unloaded, "plugins unloaded");
    Ok(())
}

async fn list(manager: &PluginManager) -> anyhow::Result<()> {
    let plugins = manager.list_plugins().await;
    if plugins.is_empty() {
        println!("No plugins found in {}", manager.config().dir.display());
        return Ok(());
    }

    println!("{:<24} {:<10} {:<9} {:>7}  DIR", "ID", "VERSION", "STATUS", "RELOADS");
    for plugin in plugins {
        let status = if plugin.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<24} {:<10} {:<9} {:>7}  {}",
            plugin.id,
            plugin.version,
            status,
            plugin.reload_count,
            plugin.dir.display()
        );
    }
    Ok(())
}
