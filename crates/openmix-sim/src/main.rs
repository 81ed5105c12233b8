//! Openmix Simulator
//!
//! Replays recorded request fixtures through the steering pipeline.
//!
//! # Usage
//!
//! ```bash
//! openmix-sim --config fixtures/app.toml --request fixtures/requests.json
//! openmix-sim -c fixtures/app.json -r fixtures/requests.json --repeat 100 --seed 7 --format text
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use openmix_core::{AppConfig, DecisionPipeline, DecisionResult, MemoryHost};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "openmix-sim")]
#[command(version)]
#[command(about = "Replay Openmix request fixtures", long_about = None)]
struct Cli {
    /// App configuration (.toml or .json)
    #[arg(long, short, env = "OPENMIX_CONFIG")]
    config: PathBuf,

    /// Request fixture: one host snapshot or an array of them
    #[arg(long, short)]
    request: PathBuf,

    /// Replay the fixture this many times
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Seed for random selection; entropy when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Output format
    #[arg(long, short, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Fixture {
    Many(Vec<MemoryHost>),
    One(MemoryHost),
}

impl Fixture {
    fn load(path: &Path) -> Result<Vec<MemoryHost>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading request fixture {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&content)
            .with_context(|| format!("parsing request fixture {}", path.display()))?;
        Ok(match fixture {
            Fixture::Many(hosts) => hosts,
            Fixture::One(host) => vec![host],
        })
    }
}

fn print_decision(format: OutputFormat, index: usize, result: &DecisionResult) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(result)?),
        OutputFormat::Text => println!(
            "#{:<4} {:<12} {:<32} ttl={:<4} {}",
            index, result.provider, result.cname, result.ttl, result.reason
        ),
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::info!("Openmix simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let pipeline = DecisionPipeline::new(config)?;
    let mut hosts = Fixture::load(&cli.request)?;

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    for host in hosts.iter_mut() {
        pipeline.init(host);
    }

    let mut index = 0;
    for _ in 0..cli.repeat {
        for host in hosts.iter_mut() {
            host.reset_response();
            let result = pipeline.decide(&*host, &host.context, Utc::now(), &mut rng);
            pipeline.emit(&result, host);
            print_decision(cli.format, index, &result)?;
            index += 1;
        }
    }

    let stats = pipeline.stats();
    tracing::info!(
        decisions = stats.decisions,
        degraded = stats.degraded,
        overrides = stats.overrides,
        "replay finished"
    );
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&serde_json::json!({ "stats": stats }))?),
        OutputFormat::Text => println!("{:#?}", stats),
    }

    Ok(())
}
