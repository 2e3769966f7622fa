use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sluice::config::{default_settings_path, load_settings, Settings};
use sluice::plugins::PluginRegistry;
use sluice::Agent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Pipeline supervisor agent with live configuration reload")]
#[command(version)]
struct Cli {
    /// Settings file (default: /etc/sluice/sluice.yml if it exists, otherwise ~/.config/sluice/sluice.yml)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Reload the configuration automatically when it changes
        #[arg(short = 'r', long)]
        reload: bool,
        /// Seconds between automatic reload checks
        #[arg(long)]
        reload_interval: Option<f64>,
        /// Node name reported by the agent (default: host name)
        #[arg(short = 'n', long)]
        node_name: Option<String>,
        /// Print metrics in prometheus text format on exit
        #[arg(long)]
        print_metrics: bool,
    },
    /// Fetch and build the configuration without running it
    Check {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// List the available plugins
    Plugins,
}

#[derive(Args, Debug, Default)]
struct PipelineArgs {
    /// Inline pipeline configuration
    #[arg(short = 'e', long)]
    config_string: Option<String>,
    /// Pipeline configuration file or directory
    #[arg(short = 'f', long)]
    path_config: Option<PathBuf>,
    /// Number of filter workers
    #[arg(short = 'w', long)]
    workers: Option<usize>,
    /// Maximum events a worker handles at once
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,
    /// Pipeline id
    #[arg(long)]
    pipeline_id: Option<String>,
}

impl PipelineArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(config) = self.config_string {
            settings.config_string = Some(config);
        }
        if let Some(path) = self.path_config {
            settings.config_path = Some(path);
        }
        if let Some(workers) = self.workers {
            settings.pipeline_workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            settings.pipeline_batch_size = batch_size;
        }
        if let Some(id) = self.pipeline_id {
            settings.pipeline_id = id;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // Settings precedence:
    // 1. --settings if provided
    // 2. System-wide settings (/etc/sluice/sluice.yml) if they exist
    // 3. User settings (~/.config/sluice/sluice.yml) if they exist
    // 4. Built-in defaults
    let mut settings = match cli.settings.or_else(default_settings_path) {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            load_settings(&path)?
        }
        None => Settings::default(),
    };

    match cli.command {
        Commands::Run {
            pipeline,
            reload,
            reload_interval,
            node_name,
            print_metrics,
        } => {
            pipeline.apply(&mut settings);
            if reload {
                settings.reload_automatic = true;
            }
            if let Some(secs) = reload_interval {
                settings.reload_interval = Duration::try_from_secs_f64(secs)
                    .context("Invalid --reload-interval")?;
            }
            if let Some(name) = node_name {
                settings.node_name = Some(name);
            }
            run(settings, print_metrics).await
        }
        Commands::Check { pipeline } => {
            pipeline.apply(&mut settings);
            check(settings).await
        }
        Commands::Plugins => {
            for plugin in PluginRegistry::with_builtins().describe() {
                println!(
                    "{:<7} {:<10} {:<11} {}",
                    plugin.kind.to_string(),
                    plugin.name,
                    if plugin.reloadable { "reloadable" } else { "no-reload" },
                    plugin.description
                );
            }
            Ok(())
        }
    }
}

async fn run(settings: Settings, print_metrics: bool) -> Result<()> {
    let agent = Arc::new(Agent::new(settings.clone())?);
    info!(
        "Starting agent {} on node {}",
        agent.id(),
        agent.node_name()
    );

    let pipeline_id = settings.pipeline_id.clone();
    let reload_automatic = settings.reload_automatic;
    agent.register_pipeline(&pipeline_id, settings).await?;

    tokio::spawn(handle_signals(Arc::clone(&agent)));
    if !reload_automatic {
        tokio::spawn(shutdown_when_finished(Arc::clone(&agent)));
    }

    agent.execute().await?;
    agent.shutdown().await;
    info!("Agent stopped after {:?}", agent.uptime());

    if print_metrics {
        print!("{}", agent.metrics().encode_text()?);
    }
    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    let agent = Agent::new(settings.clone())?;
    let definition = agent
        .check_pipeline(&settings.pipeline_id, settings.clone())
        .await?;

    println!("Configuration OK");
    for plugin in definition.plugins() {
        println!("  {}/{}", plugin.kind, plugin.name);
    }
    Ok(())
}

/// SIGHUP reloads every pipeline; Ctrl-C and SIGTERM shut the agent down
async fn handle_signals(agent: Arc<Agent>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(mut hangup), Ok(mut terminate)) => loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        info!("SIGHUP received, reloading configuration");
                        for (id, outcome) in agent.reload_state().await {
                            info!(pipeline = %id, outcome = ?outcome, "Reload finished");
                        }
                    }
                    _ = terminate.recv() => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    agent.shutdown().await;
}

/// Without automatic reload the agent exits once every pipeline ran dry
async fn shutdown_when_finished(agent: Arc<Agent>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if agent.is_shutting_down() {
            return;
        }

        let ids = agent.pipeline_ids();
        let finished = !ids.is_empty()
            && ids
                .iter()
                .all(|id| agent.pipeline(id).is_some_and(|p| p.is_finished()));
        if finished {
            info!("All pipelines finished");
            agent.shutdown().await;
            return;
        }
    }
}
