//! procbus host: load every module given on the command line and route
//! their traffic until Ctrl-C.

use std::process;
use std::time::Duration;

use anyhow::{Context, Result};

use procbus::{Broker, BrokerConfig, LaunchSpec};

struct Args {
    modules: Vec<String>,
    timeout: Option<u64>,
    respawn_delay: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: procbus [--timeout <ms>] [--respawn-delay <secs>] <module>...");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <module>    Executable to run as a module (words after it are its arguments when quoted: \"path --flag\")");
            process::exit(2);
        }
    };

    procbus::init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{e:#}"), "procbus failed");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        modules: Vec::new(),
        timeout: None,
        respawn_delay: None,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--timeout" => {
                i += 1;
                let value = args.get(i).ok_or("--timeout requires a value")?;
                parsed.timeout = Some(value.parse().map_err(|_| format!("bad timeout: {value}"))?);
            }
            "--respawn-delay" => {
                i += 1;
                let value = args.get(i).ok_or("--respawn-delay requires a value")?;
                parsed.respawn_delay =
                    Some(value.parse().map_err(|_| format!("bad respawn delay: {value}"))?);
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => parsed.modules.push(arg.to_string()),
        }
        i += 1;
    }

    if parsed.modules.is_empty() {
        return Err("at least one <module> is required".to_string());
    }
    Ok(parsed)
}

fn launch_spec(module: &str) -> LaunchSpec {
    let mut words = module.split_whitespace();
    let program = words.next().unwrap_or(module);
    LaunchSpec::new(program).args(words)
}

async fn run(args: Args) -> Result<()> {
    let mut config = BrokerConfig::default();
    if let Some(ms) = args.timeout {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    if let Some(secs) = args.respawn_delay {
        config = config.with_respawn_delay(Duration::from_secs(secs));
    }
    let broker = Broker::new(config);

    for module in &args.modules {
        let handle = broker
            .load(launch_spec(module))
            .await
            .with_context(|| format!("loading {module}"))?;
        tracing::info!(module = %handle.name(), id = handle.id(), "Module loaded");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    for outcome in broker.unload_all().await {
        tracing::info!("{outcome}");
    }
    Ok(())
}
