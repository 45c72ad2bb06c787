//! Watchdog CLI
//!
//! Reads normalized watch events, detects failures and drives remediation.
//!
//! Usage:
//!   kubectl get pods,workflows,coderuns -n cto -w -o json --output-watch-events \
//!     | jq -c . | watchdog watch --config watchdog.toml
//!   watchdog family play-task-4-abc-step-123
//!   watchdog check-config --config watchdog.toml

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use watchdog::alerts::AlertRegistry;
use watchdog::config::WatchdogConfig;
use watchdog::dedup::{extract_workflow_family, DedupEngine};
use watchdog::healing::{
    BriefRenderer, Collaborators, DryRunIssueTracker, DryRunSpawner, GhIssueTracker, HealingLoop,
    KubectlSpawner, LokiLogSource,
};
use watchdog::normalize::parse_watch_line;
use watchdog::poller::PrPoller;
use watchdog::stage::StageTracker;

#[derive(Parser)]
#[command(name = "watchdog")]
#[command(about = "Self-healing operations watchdog - detects, deduplicates and remediates pipeline failures")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Read watch events (one JSON envelope per line) from stdin and heal
    Watch {
        /// Config file (toml, yaml or json); defaults apply when omitted
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Log issues and remediations instead of creating them
        #[arg(long)]
        dry_run: bool,

        /// Event channel capacity
        #[arg(long, default_value = "256")]
        buffer: usize,
    },
    /// Print the workflow family for each name
    Family {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Load and validate a config file
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Watch {
            config,
            dry_run,
            buffer,
        } => watch(config.as_deref(), dry_run, buffer).await,
        Commands::Family { names } => {
            for name in names {
                println!("{} {}", name.dimmed(), extract_workflow_family(&name).green());
            }
            Ok(())
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "watchdog=debug" } else { "watchdog=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<WatchdogConfig> {
    let mut config = match path {
        Some(path) => WatchdogConfig::load(path)?,
        None => {
            let mut config = WatchdogConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    config
        .validate()
        .context("Invalid watchdog configuration")?;
    // Remediation runs live in the healing namespace; keep them out of alerting
    if !config.exclusions.prefixes.iter().any(|p| p == "heal") {
        config.exclusions.prefixes.push("heal".into());
    }
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    println!("{} {}", "✓".green(), format!("{} is valid", path.display()).bold());
    println!("  dedup window:   {} min", config.dedup.window_mins);
    println!("  stages:         {}", config.stages.names().join(" → "));
    println!("  exclusions:     {}", config.exclusions.prefixes.join(", "));
    println!("  repository:     {}", config.healing.repository);
    println!("  loki:           {}", config.loki.base_url);
    if config.github.enabled {
        println!("  PR poll:        every {}s", config.github.interval_secs);
    } else {
        println!("  PR poll:        {}", "disabled".dimmed());
    }
    Ok(())
}

async fn watch(config_path: Option<&Path>, dry_run: bool, buffer: usize) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.healing.dry_run |= dry_run;

    let renderer = Arc::new(match &config.healing.templates_dir {
        Some(dir) => BriefRenderer::with_overrides(dir)?,
        None => BriefRenderer::new()?,
    });
    let logs = Arc::new(LokiLogSource::new(config.loki.clone())?);
    let collaborators = if config.healing.dry_run {
        println!("{}", "Dry run: issues and remediations are only logged".yellow());
        Collaborators {
            logs,
            issues: Arc::new(DryRunIssueTracker),
            spawner: Arc::new(DryRunSpawner),
        }
    } else {
        Collaborators {
            logs,
            issues: Arc::new(GhIssueTracker::new(
                config.healing.repository.clone(),
                Arc::clone(&renderer),
            )),
            spawner: Arc::new(KubectlSpawner::new(
                config.healing.namespace.clone(),
                config.healing.repository.clone(),
                config.healing.remediation.clone(),
                renderer,
            )),
        }
    };

    let healing_loop = HealingLoop::new(
        AlertRegistry::new(config.exclusions.clone()),
        config.alerts.clone(),
        StageTracker::new(config.stages.clone()),
        DedupEngine::in_memory(&config.dedup),
        collaborators,
        config.healing.clone(),
    );

    let (tx, rx) = mpsc::channel(buffer.max(1));
    let poller = config.github.enabled.then(|| {
        let poller = PrPoller::new(config.healing.repository.clone(), &config.github);
        tokio::spawn(poller.run(tx.clone()))
    });
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut skipped = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_watch_line(&line, Utc::now()) {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, len = line.len(), "Skipping malformed event");
                }
            }
        }
        skipped
    });

    println!(
        "{} {}",
        "Watchdog running".green().bold(),
        format!(
            "(window {} min, {} stages)",
            config.dedup.window_mins,
            config.stages.stages.len()
        )
        .dimmed()
    );

    let healing = tokio::spawn(healing_loop.run(rx));
    let skipped = reader.await.context("stdin reader panicked")?;
    info!(skipped, "Input exhausted");
    // Closing the last sender lets the loop drain its cycles and stop
    if let Some(poller) = poller {
        poller.abort();
    }
    healing.await.context("healing loop panicked")?;
    Ok(())
}
