use autopilot::config::{self, Strategy};
use autopilot::orchestrator::Orchestrator;
use autopilot::store::{CredentialMode, HttpBackend, StatusStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Autopilot CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: AUTOPILOT_CONFIG_PATH or ~/.autopilot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Check that the processing backend is reachable.
    Health {
        /// Config file path (default: AUTOPILOT_CONFIG_PATH or ~/.autopilot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the orchestrator and its HTTP control surface until Ctrl+C.
    Run {
        /// Config file path (default: AUTOPILOT_CONFIG_PATH or ~/.autopilot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Control surface port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,

        /// Processing strategy: sequential, batch or parallel
        #[arg(long, short)]
        strategy: Option<Strategy>,

        /// Discover messages with admin credentials instead of the tenant context
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("autopilot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Health { config }) => {
            if let Err(e) = run_health(config).await {
                log::error!("health check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            port,
            strategy,
            admin,
        }) => {
            if let Err(e) = run(config, port, strategy, admin).await {
                log::error!("autopilot failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = autopilot::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn backend(config: &config::Config) -> HttpBackend {
    HttpBackend::new(
        config::resolve_backend_url(config),
        config::resolve_backend_token(config),
    )
}

async fn run_health(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let backend = backend(&config);
    backend.check_health().await?;
    println!("backend at {} is healthy", backend.base_url());
    Ok(())
}

async fn run(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    strategy: Option<Strategy>,
    admin: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(s) = strategy {
        config.autopilot.strategy = s;
    }
    if admin {
        config.backend.mode = CredentialMode::Admin;
    }

    let backend = Arc::new(backend(&config));
    log::info!(
        "starting autopilot ({:?} strategy) against {}",
        config.autopilot.strategy,
        backend.base_url()
    );
    let (handle, join) = Orchestrator::spawn(
        backend.clone(),
        backend,
        config.autopilot.clone(),
        config.backend.session_context(),
    );

    if config.autopilot.start_active {
        if let Err(e) = handle.activate().await {
            log::warn!("autopilot not activated at startup: {}", e);
        }
    }

    let served = autopilot::gateway::run_gateway(
        &config.gateway,
        handle.clone(),
        autopilot::gateway::shutdown_signal(),
    )
    .await;

    handle.shutdown();
    if let Err(e) = join.await {
        log::warn!("orchestrator task ended abnormally: {}", e);
    }
    served
}
