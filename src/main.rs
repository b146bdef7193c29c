//! Diffuser Manager - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diffuser_manager::download::format_duration;
use diffuser_manager::models::format_bytes;
use diffuser_manager::{
    GenerationRequest, HfHubClient, ManagerConfig, ManagerError, ModelDescriptor, ModelManager,
    ModelState, ProcessEngine,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "diffuser-manager")]
#[command(about = "Install, verify and load diffusion models from the hub", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the models directory
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    /// Print collected metrics (Prometheus text format) to stderr on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered models
    List {
        /// Only models that are fully installed
        #[arg(long)]
        installed: bool,
    },
    /// Show a model's descriptor and on-disk state
    Show { name: String },
    /// Print a model's status; the exit code encodes it
    Status { name: String },
    /// Download (or resume) a model
    Pull {
        name: String,
        /// Discard existing files first
        #[arg(long)]
        force: bool,
    },
    /// Delete a model's files
    Rm { name: String },
    /// Report download progress, including downloads run by other processes
    Progress {
        name: String,
        /// Sampling window in seconds
        #[arg(long, default_value_t = 2)]
        window: u64,
    },
    /// Load a model, run one generation and unload it
    Generate {
        name: String,
        prompt: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Edit the model registry
    #[command(subcommand)]
    Registry(RegistryCommand),
}

#[derive(Subcommand, Debug)]
enum RegistryCommand {
    /// Register a model in the runtime registry
    Add {
        name: String,
        #[arg(long)]
        repo_id: String,
        #[arg(long)]
        model_type: String,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Remove a model's visible registry entry
    Remove { name: String },
    /// Merge a registry document (JSON or TOML) into the runtime registry
    Import { file: PathBuf },
}

/// Exit code per status
fn exit_code(state: ModelState) -> u8 {
    match state {
        ModelState::Installed | ModelState::Loaded => 0,
        ModelState::NotInstalled => 10,
        ModelState::Incomplete => 11,
        ModelState::Downloading => 12,
        ModelState::InstalledUnconfigured => 13,
    }
}

/// Exit code for a failed command; resumable outcomes reuse the status codes
fn error_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ManagerError>() {
        Some(ManagerError::TransferInterrupted { .. }) => exit_code(ModelState::Incomplete),
        Some(ManagerError::DownloadInProgress { .. }) => exit_code(ModelState::Downloading),
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging (stderr, stdout carries command output)
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(dir) = cli.models_dir {
        config.models_dir = dir;
    }

    config.validate()?;

    tracing::debug!(
        models_dir = ?config.models_dir,
        registry_files = ?config.registry_files,
        endpoint = %config.hub.endpoint,
        "Configuration loaded"
    );

    let prometheus = if cli.print_metrics {
        Some(diffuser_manager::metrics::setup_metrics()?)
    } else {
        None
    };

    let hub = Arc::new(HfHubClient::new(&config.hub).context("Failed to create hub client")?);
    let engine = Arc::new(ProcessEngine::new(config.engine.clone()));
    let manager = ModelManager::from_config(&config, hub, engine)
        .context("Failed to initialise model manager")?;

    let result = run(&manager, cli.command).await;

    if let Some(handle) = prometheus {
        eprint!("{}", handle.render());
    }

    match result {
        Ok(code) => Ok(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            Ok(ExitCode::from(error_exit_code(&e)))
        }
    }
}

async fn run(manager: &ModelManager, command: Command) -> Result<ExitCode> {
    match command {
        Command::List { installed } => {
            let names: Vec<String> = if installed {
                manager.list_installed().await?
            } else {
                manager
                    .list_available()
                    .await
                    .into_iter()
                    .map(|d| d.name)
                    .collect()
            };
            for name in names {
                let state = manager.status(&name).await?;
                println!("{name:<36} {}", state.status_code());
            }
            if !installed {
                for name in manager.list_unconfigured().await? {
                    println!("{name:<36} {}", ModelState::InstalledUnconfigured.status_code());
                }
            }
        }
        Command::Show { name } => {
            let info = manager.get_model_info(&name).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Status { name } => {
            let state = manager.status(&name).await?;
            println!("{}", state.status_code());
            return Ok(ExitCode::from(exit_code(state)));
        }
        Command::Pull { name, force } => {
            tokio::select! {
                result = manager.install(&name, force) => {
                    let report = result?;
                    println!(
                        "{name}: installed ({} in {})",
                        format_bytes(report.snapshot.downloaded_bytes),
                        format_duration(report.snapshot.elapsed)
                    );
                }
                _ = shutdown_signal() => {
                    return Err(ManagerError::TransferInterrupted { name }.into());
                }
            }
        }
        Command::Rm { name } => {
            if manager.uninstall(&name).await? {
                println!("{name}: removed");
            } else {
                println!("{name}: nothing to remove");
            }
        }
        Command::Progress { name, window } => {
            let state = manager.download_state(&name);
            let snapshot = manager.progress(&name, Duration::from_secs(window)).await?;
            println!("{name}: {state}");
            println!("{}", snapshot.describe());
        }
        Command::Generate {
            name,
            prompt,
            output,
            seed,
        } => {
            manager.load(&name).await?;
            let mut request = GenerationRequest::new(prompt);
            request.output = output;
            request.seed = seed;
            let result = manager.generate(request).await;
            manager.unload().await?;

            let image = result?;
            println!("{}", image.path.display());
        }
        Command::Registry(RegistryCommand::Add {
            name,
            repo_id,
            model_type,
            variant,
        }) => {
            let mut descriptor = ModelDescriptor::new(&name, repo_id, model_type)?;
            if let Some(variant) = variant {
                descriptor = descriptor.with_variant(variant);
            }
            manager.add_model(&name, descriptor).await?;
            println!("{name}: registered");
        }
        Command::Registry(RegistryCommand::Remove { name }) => {
            if !manager.remove_model(&name).await? {
                return Err(ManagerError::ModelNotFound(name).into());
            }
            println!("{name}: unregistered");
        }
        Command::Registry(RegistryCommand::Import { file }) => {
            let report = manager.import_registry(&file).await?;
            for name in &report.loaded {
                println!("{name}: registered");
            }
            for skipped in &report.skipped {
                eprintln!("{}: skipped ({})", skipped.name, skipped.reason);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
