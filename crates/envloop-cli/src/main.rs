//! envloop - containerized environment repair loop

use anyhow::Context;
use clap::Parser;
use envloop_adapter::{create_adapter, AdapterBackend};
use envloop_cli::{handoff, llm_bridge::CommandLlm};
use envloop_config::{PatchStrategy, RunConfig, VerifyMode};
use envloop_core::Orchestrator;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "envloop")]
#[command(author, version, about = "Repair a project's containerized environment until verification passes", long_about = None)]
struct Cli {
    /// Project directory on the host
    project: PathBuf,

    /// Installer script path relative to the project (cold-stage handoff)
    #[arg(long, default_value = "envloop_setup.sh")]
    script: String,

    /// Test catalog JSON produced by the discovery stage
    #[arg(long)]
    catalog: PathBuf,

    /// Collaborator program invoked for analysis/selection/normalization
    #[arg(long)]
    llm: String,

    /// Dockerfile to build the run image from; omit to use an existing image
    #[arg(long)]
    dockerfile: Option<PathBuf>,

    /// Config file (defaults to ~/.config/envloop/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verification mode: exec or import_scan
    #[arg(long)]
    mode: Option<String>,

    /// Patch strategy: rewrite_full or single_command
    #[arg(long)]
    patch_strategy: Option<String>,

    /// Container backend: cli or api
    #[arg(long, default_value = "cli")]
    backend: String,

    /// Daemon socket for the api backend
    #[arg(long)]
    socket: Option<String>,

    /// Bind-mount the staged project into the container
    #[arg(long)]
    bind_mount: bool,

    /// Keep the container and image after the run
    #[arg(long)]
    keep: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &cli.config {
        Some(path) => RunConfig::load_from(path)?,
        None => RunConfig::load().unwrap_or_default(),
    };
    if let Some(mode) = &cli.mode {
        config.mode = VerifyMode::from_str(mode).map_err(anyhow::Error::msg)?;
    }
    if let Some(strategy) = &cli.patch_strategy {
        config.patch_strategy = PatchStrategy::from_str(strategy).map_err(anyhow::Error::msg)?;
    }
    if cli.bind_mount {
        config.bind_mount = true;
    }
    config.validate()?;

    let backend = AdapterBackend::from_str(&cli.backend).map_err(anyhow::Error::msg)?;

    let installer = handoff::load_installer(&cli.project, &cli.script, &config.workdir)?;
    let catalog = handoff::load_catalog(&cli.catalog)?;
    let dockerfile = match &cli.dockerfile {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading Dockerfile {}", path.display()))?,
        ),
        None => None,
    };

    let adapter = create_adapter(
        backend,
        &cli.project,
        &config.workdir,
        cli.socket.as_deref(),
    )
    .await?;
    let adapter: Arc<dyn envloop_adapter::ContainerAdapter> = Arc::from(adapter);
    let llm = Arc::new(CommandLlm::new(&cli.llm));

    let orchestrator = Orchestrator::new(
        adapter.clone(),
        llm,
        None,
        config,
        &cli.project,
    );

    // Ctrl-C sets the stop flag; the in-flight command runs to its
    // timeout, state is persisted, and the run exits with code 4.
    let stop = orchestrator.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current tick");
            stop.store(true, Ordering::Relaxed);
        }
    });

    orchestrator.prepare(dockerfile.as_deref()).await?;

    let exit_code = match orchestrator.run(installer, catalog).await {
        Ok(report) => {
            println!("{}", report.render());
            report.exit_code
        }
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            e.exit_code()
        }
    };

    if !cli.keep {
        if let Err(e) = adapter.cleanup().await {
            tracing::warn!("Cleanup failed: {}", e);
        }
    }

    std::process::exit(exit_code);
}
