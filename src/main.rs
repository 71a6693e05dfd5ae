use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use speedwatch::config::MonitorConfig;
use speedwatch::selection::{self, PreferenceCache, SelectionRequest};
use speedwatch::throughput::provider::EndpointDirectory;
use speedwatch::throughput::{report, EndpointId};

#[derive(Parser)]
#[command(
    name = "speedwatch",
    about = "Continuous internet speed monitoring with adaptive server selection",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the preference cache and measurement database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run measurement cycles (continuous until interrupted unless --single)
    Monitor {
        /// Run a single cycle and exit
        #[arg(long, short = 's')]
        single: bool,

        /// Stop after this many cycles
        #[arg(long, conflicts_with = "single")]
        cycles: Option<u64>,

        /// Minutes between cycle starts
        #[arg(long, short = 'i')]
        interval_minutes: Option<u64>,

        /// Always use this server ID (bypasses the cached preference)
        #[arg(long)]
        server_id: Option<EndpointId>,

        /// Let the provider pick the server instead of the cached preference
        #[arg(long)]
        no_server_optimization: bool,

        /// Refresh the cached best server before the first cycle
        #[arg(long, conflicts_with_all = ["server_id", "no_server_optimization"])]
        find_best_first: bool,

        /// Print the single-cycle outcome as JSON
        #[arg(long, requires = "single")]
        json: bool,
    },

    /// Test the closest servers, then cache the best one
    FindBest {
        /// Number of servers to test
        #[arg(long)]
        count: Option<usize>,
    },

    /// List candidate servers ordered by proximity
    ListServers {
        /// Maximum number of servers to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Inspect or clear the cached best server
    Preference {
        #[command(subcommand)]
        action: PreferenceAction,
    },
}

#[derive(Subcommand)]
enum PreferenceAction {
    /// Show the cached preference
    Show,

    /// Forget the cached best server (candidate scores are kept)
    Forget,
}

fn init_tracing(cfg: &MonitorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn require_provider(cfg: &MonitorConfig) -> Result<speedwatch::throughput::provider::ookla::OoklaProvider> {
    let provider = speedwatch::provider_from_config(cfg);
    match provider.version().await {
        Some(version) => {
            tracing::info!(%version, "Speedtest CLI detected");
            Ok(provider)
        }
        None => anyhow::bail!(
            "Speedtest CLI not found at '{}' (install: https://www.speedtest.net/apps/cli)",
            cfg.provider.speedtest_path
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = MonitorConfig::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        cfg.storage.data_dir = dir;
    }
    if let Commands::Monitor {
        interval_minutes: Some(minutes),
        ..
    } = cli.command
    {
        cfg.schedule.interval_minutes = minutes;
    }
    if let Commands::FindBest { count: Some(count) } = cli.command {
        cfg.selection.discovery_candidates = count;
    }
    cfg.validate().context("invalid configuration")?;

    init_tracing(&cfg);

    match cli.command {
        Commands::Monitor {
            single,
            cycles,
            server_id,
            no_server_optimization,
            find_best_first,
            json,
            ..
        } => {
            require_provider(&cfg).await?;
            let request = SelectionRequest {
                explicit: server_id,
                optimize: cfg.selection.optimize && !no_server_optimization,
            };
            if let Some(id) = server_id {
                tracing::info!(endpoint = %id, "Using explicit server");
            }
            let mut scheduler = speedwatch::build_scheduler(&cfg, request)?;
            if find_best_first {
                scheduler.request_discovery();
            }

            if single {
                let outcome = scheduler.run_cycle().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                match &outcome.record {
                    Some(record) => {
                        if !json {
                            println!("{}", report::format_summary(record));
                        }
                    }
                    None => {
                        let reasons: Vec<String> =
                            outcome.failures.iter().map(|e| e.to_string()).collect();
                        anyhow::bail!("measurement failed: {}", reasons.join("; "));
                    }
                }
            } else {
                let cancel = CancellationToken::new();
                let listener = cancel.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    tracing::info!("Shutdown signal received");
                    listener.cancel();
                });
                scheduler.run_continuous(cfg.interval(), cancel, cycles).await;
            }
        }
        Commands::FindBest { .. } => {
            let provider = require_provider(&cfg).await?;
            let cache = PreferenceCache::new(cfg.preference_path());
            let opts = cfg.discovery_options();
            println!("Testing up to {} servers...", opts.limit);

            let outcome = selection::discover(&provider, &provider, &cache, &opts).await?;

            println!("\nResults (sorted by score = download - ping/10):");
            for line in report::format_ranking(&outcome) {
                println!("{}", line);
            }
            for (id, err) in &outcome.failures {
                println!("  failed {}: {}", id, err);
            }
            let name = outcome
                .endpoint(outcome.best)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            println!("\nBest server: {} (ID: {}) cached at {}", name, outcome.best, cache.path().display());
        }
        Commands::ListServers { limit } => {
            let provider = require_provider(&cfg).await?;
            let servers = provider.list_candidates(limit).await?;
            if servers.is_empty() {
                println!("No servers found.");
            } else {
                println!("{:>8} | {:<25} | {:<30} | Distance", "ID", "Name", "Location");
                println!("{:->8}-|-{:-<25}-|-{:-<30}-|-{:-<8}", "", "", "", "");
                for server in &servers {
                    println!("{}", report::format_endpoint_row(server));
                }
            }
        }
        Commands::Preference { action } => {
            let cache = PreferenceCache::new(cfg.preference_path());
            match action {
                PreferenceAction::Show => match cache.load() {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => println!("No cached preference at {}.", cache.path().display()),
                },
                PreferenceAction::Forget => {
                    if cache.invalidate()? {
                        println!("Cached best server cleared.");
                    } else {
                        println!("No cached best server to clear.");
                    }
                }
            }
        }
    }

    Ok(())
}
