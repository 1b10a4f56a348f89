mod console;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sessionhub_core::registry::SurfaceSessionRegistry;
use sessionhub_core::{paths, CoreConfig, Services};
use tokio::io::BufReader;
use tokio::signal;

use console::{ConsoleSurface, Exit, SURFACE_NAME};

/// SessionHub console: talk to a shared agent session from the terminal
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Use the in-memory mock backend
    #[arg(long)]
    dev: bool,

    /// Path to config file (defaults to <data-dir>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory (defaults to ~/.sessionhub)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Agent CLI binary (overrides config)
    #[arg(long)]
    agent_path: Option<String>,

    /// User id owning console sessions (defaults to $USER)
    #[arg(short, long)]
    user: Option<String>,

    /// Active session cap per user (overrides config)
    #[arg(long)]
    max_per_user: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    let config_path = match (&args.config, &args.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join("config.json"),
        (None, None) => paths::default_data_dir()?.join("config.json"),
    };
    let mut config = CoreConfig::load(&config_path)?;

    // Flags win over the file.
    if args.dev {
        config.dev_mode = true;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(agent_path) = &args.agent_path {
        config.runtime.binary_path = agent_path.clone();
    }
    if let Some(max) = args.max_per_user {
        config.max_per_user = max;
    }

    Ok(config.resolve_dirs()?)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let data_dir = config.data_dir()?;
    let user = args
        .user
        .clone()
        .or_else(|| env::var("USER").ok())
        .unwrap_or_else(|| "console".to_string());
    let working_dir = env::current_dir()?.to_string_lossy().into_owned();

    let backend = Services::init(&config, None)?;
    let registry = SurfaceSessionRegistry::new(
        SURFACE_NAME,
        Some(paths::registry_file(&data_dir, SURFACE_NAME)?),
        config.max_per_user,
    );
    let console = ConsoleSurface::new(registry, backend, user, working_dir);

    log::info!(
        "Console ready for {} in {} ({}, {} active mappings)",
        console.routing_key(),
        data_dir.display(),
        if config.dev_mode { "dev" } else { "production" },
        console.registry().list_active().len()
    );
    println!("Type a message, or /new [description], /end, /list, /quit");

    let input = BufReader::new(tokio::io::stdin());
    if console.run(input, shutdown_signal()).await? == Exit::Interrupted {
        println!();
        log::info!("Received Ctrl+C, shutting down");
    }

    Services::stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        log::warn!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
}
