//! skirnir: inspect orchestrator configuration and request plans offline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use skirnir::cache::CacheKey;
use skirnir::cache::key::default_volatile_params;
use skirnir::config::OrchestratorConfig;
use skirnir::geo;

/// Skirnir command-line tool
#[derive(Parser)]
#[command(name = "skirnir")]
#[command(version = skirnir::PKG_VERSION)]
#[command(about = "Skirnir API orchestration toolkit")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "SKIRNIR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and summarise each service
    Check,

    /// Show how a batch of requests would be clustered
    Plan {
        /// JSON file holding an array of request parameter objects
        file: PathBuf,
    },

    /// Print the cache key for a request
    Key {
        provider: String,
        operation: String,
        /// Request parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Check => {
            let config = OrchestratorConfig::load(args.config.as_deref())?;
            print_summary(&config);
        }
        Command::Plan { file } => {
            let config = match args.config.as_deref() {
                Some(path) => OrchestratorConfig::load(Some(path))?,
                None => OrchestratorConfig::default(),
            };
            let requests: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            let batch = geo::optimize_requests(&requests, &config.geo);
            info!(
                requests = requests.len(),
                calls = batch.optimized_requests.len(),
                "planned batch"
            );
            println!(
                "{} requests -> {} calls ({} saved)",
                requests.len(),
                batch.optimized_requests.len(),
                batch.calls_saved()
            );
            for (i, params) in batch.optimized_requests.iter().enumerate() {
                let served: Vec<usize> = batch
                    .mapping
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| **slot == i)
                    .map(|(original, _)| original)
                    .collect();
                println!("  call {i}: {params}  serves {served:?}");
            }
        }
        Command::Key {
            provider,
            operation,
            params,
        } => {
            let params: Value = serde_json::from_str(&params)?;
            let volatile = match args.config.as_deref() {
                Some(path) => OrchestratorConfig::load(Some(path))?.cache.volatile_params,
                None => default_volatile_params(),
            };
            let key = CacheKey::new(&provider, &operation, &params, &volatile);
            println!("{}", key.key);
            println!("geo scope: {}", key.geo_scope);
        }
    }
    Ok(())
}

fn print_summary(config: &OrchestratorConfig) {
    let mut names: Vec<_> = config.services.keys().collect();
    names.sort();
    println!("{} service(s)", names.len());
    for name in names {
        let policy = &config.services[name];
        println!("\n{name}");
        println!(
            "  retry:    {} retries, {:?} initial, {:?} cap",
            policy.retry.max_retries, policy.retry.initial_delay, policy.retry.max_delay
        );
        if policy.rate_limit.windows.is_empty() {
            println!("  quota:    unlimited");
        }
        for window in &policy.rate_limit.windows {
            println!(
                "  quota:    {} per {}s ({})",
                window.limit, window.length_secs, window.name
            );
        }
        let stages: Vec<&str> = policy.fallback.stages.iter().map(|s| s.as_str()).collect();
        println!("  fallback: {}", if stages.is_empty() { "none".to_string() } else { stages.join(" -> ") });
        println!(
            "  cache:    {} ({})",
            if policy.cache.enabled { "on" } else { "off" },
            policy.cache.data_type.as_str()
        );
        println!("  timeout:  {}ms", policy.timeout_ms);
        if !policy.key_env.is_empty() {
            let present = policy
                .key_env
                .iter()
                .filter(|var| std::env::var(var).is_ok_and(|v| !v.is_empty()))
                .count();
            println!("  keys:     {present}/{} set", policy.key_env.len());
        }
    }
}
