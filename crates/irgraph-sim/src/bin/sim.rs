#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use irgraph_core::config::resolve_config;
use irgraph_sim::campaign::{self, CampaignConfig, format_violation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "irgraph-sim: seeded rewrite campaigns against the graph engine",
    long_about = None
)]
struct Cli {
    /// First seed to run.
    #[arg(long, default_value_t = 0)]
    start: u64,

    /// Number of seeds.
    #[arg(long, default_value_t = 100)]
    seeds: u64,

    /// Layers of the initial graph.
    #[arg(long)]
    layers: Option<usize>,

    /// Nodes per layer.
    #[arg(long)]
    width: Option<usize>,

    /// Rewrites per seed.
    #[arg(long)]
    rewrites: Option<usize>,

    /// Replay one seed and print its trace instead of running a campaign.
    #[arg(long)]
    replay: Option<u64>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Directory whose `.irgraph/config.toml` configures the engine.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("IRGRAPH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "irgraph=debug,info"
        } else {
            "irgraph=info,warn"
        })
    });
    let format = env::var("IRGRAPH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let graph = resolve_config(&cli.root)
        .with_context(|| format!("loading engine config under {}", cli.root.display()))?;
    tracing::debug!(?graph, "engine config resolved");

    let defaults = CampaignConfig::default();
    let config = CampaignConfig {
        seed_range: cli.start..cli.start.saturating_add(cli.seeds),
        layers: cli.layers.unwrap_or(defaults.layers),
        width: cli.width.unwrap_or(defaults.width),
        rewrites: cli.rewrites.unwrap_or(defaults.rewrites),
        graph,
        ..defaults
    };

    if let Some(seed) = cli.replay {
        let trace = campaign::replay_seed(seed, &config)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&trace.result.trace)?);
        } else {
            for event in &trace.result.trace {
                println!("{:>4} {:?} {}", event.step, event.kind, event.detail);
            }
            for v in trace.violations() {
                println!("violation: {}", format_violation(v));
            }
        }
        return Ok(());
    }

    let report = campaign::run_campaign(&config)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} rewrites={} first_failure={:?}",
            report.seeds_run, report.seeds_passed, report.rewrites_applied, report.first_failure
        );
    }
    if !report.all_passed() {
        bail!("{} seeds failed", report.failures.len());
    }
    Ok(())
}
