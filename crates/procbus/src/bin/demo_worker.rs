//! Demo module: a worker process that serves a few toy requests.
//!
//! - `echo`  answers with its payload
//! - `sleep` waits `payload.ms` milliseconds, then answers
//! - `stall` blocks its thread for `payload.ms` milliseconds, then answers
//! - `relay` dispatches `payload.payload` to `payload.to` and returns that result
//! - `crash` exits with `payload.code` (default 1) without replying
//! - `exit`  exits cleanly without replying

use std::process;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};

use procbus::{HandlerError, Message, Reply, Runtime, RuntimeConfig, Setlocal};

#[derive(Debug, Default)]
struct Args {
    name: Option<String>,
    priority: Option<i64>,
    selftimeout: Option<i64>,
    watch: Vec<String>,
    halt_name: Option<String>,
    ignore_halt: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: procbus-demo-worker [--name <name>] [--priority <n>] [--selftimeout <ms>] [--watch <name>]... [--halt-name <name>] [--ignore-halt]");
            process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    let result = runtime.block_on(run(args));
    // stdin is read on a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(100));

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--name" => {
                i += 1;
                parsed.name = Some(args.get(i).ok_or("--name requires a value")?.clone());
            }
            "--priority" => {
                i += 1;
                let value = args.get(i).ok_or("--priority requires a value")?;
                parsed.priority = Some(value.parse().map_err(|_| format!("bad priority: {value}"))?);
            }
            "--selftimeout" => {
                i += 1;
                let value = args.get(i).ok_or("--selftimeout requires a value")?;
                parsed.selftimeout =
                    Some(value.parse().map_err(|_| format!("bad selftimeout: {value}"))?);
            }
            "--watch" => {
                i += 1;
                parsed
                    .watch
                    .push(args.get(i).ok_or("--watch requires a value")?.clone());
            }
            "--halt-name" => {
                i += 1;
                parsed.halt_name = Some(args.get(i).ok_or("--halt-name requires a value")?.clone());
            }
            "--ignore-halt" => parsed.ignore_halt = true,
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

async fn run(args: Args) -> Result<()> {
    let logs = procbus::init_module_tracing();

    let mut config = RuntimeConfig::new();
    if let Some(name) = &args.name {
        config = config.with_setlocal(name.as_str());
    }
    if let Some(halt_name) = &args.halt_name {
        config = config.with_halt_name(halt_name.as_str());
    }
    let halt_name = config.halt_name.clone();
    let runtime = Runtime::connect_stdio(config).await?;
    runtime.forward_logs(logs);

    if let Some(ms) = args.selftimeout {
        let effective = runtime
            .setlocal(Setlocal::key("selftimeout", json!(ms)))
            .await?;
        tracing::info!(?effective, "selftimeout applied");
    }

    let priority = args.priority.unwrap_or(procbus::message::DEFAULT_PRIORITY);

    runtime.install_with_priority("echo", priority, echo)?;
    runtime.install_with_priority("sleep", priority, sleep)?;
    runtime.install_with_priority("stall", priority, stall)?;
    let relay_runtime = runtime.clone();
    runtime.install_with_priority("relay", priority, move |m| relay(relay_runtime.clone(), m))?;
    runtime.install("crash", crash)?;
    runtime.install("exit", exit)?;

    for name in &args.watch {
        let notify = runtime.clone();
        runtime.watch(name, move |m: Message| {
            let notify = notify.clone();
            async move {
                let seen = json!({ "name": m.name, "result": m.result, "error": m.error });
                if let Err(e) = notify.enqueue_to("watched", seen) {
                    tracing::warn!(error = %e, "Failed to report notification");
                }
            }
        })?;
    }

    if args.ignore_halt {
        runtime.install(&halt_name, ignore_halt)?;
    }

    tracing::info!(name = ?runtime.name(), "Demo worker ready");
    runtime.run().await;
    tracing::info!("Demo worker stopping");
    Ok(())
}

async fn echo(m: Message) -> Result<Reply, HandlerError> {
    Ok(Reply::Value(Value::Object(m.payload)))
}

async fn sleep(m: Message) -> Result<Reply, HandlerError> {
    let ms = m.get("ms").and_then(Value::as_u64).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(Reply::Value(json!({ "slept": ms })))
}

// A blocked thread starves the local deadline too, so the reply comes late.
async fn stall(m: Message) -> Result<Reply, HandlerError> {
    let ms = m.get("ms").and_then(Value::as_u64).unwrap_or(0);
    std::thread::sleep(Duration::from_millis(ms));
    Ok(Reply::Value(json!({ "stalled": ms })))
}

async fn relay(runtime: Runtime, m: Message) -> Result<Reply, HandlerError> {
    let to = m
        .get("to")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::failed("relay needs a `to` name"))?;
    let payload = m.get("payload").cloned().unwrap_or(Value::Null);
    let reply = runtime
        .dispatch_to(to, payload)
        .await
        .map_err(|e| HandlerError::failed(e.to_string()))?;
    Ok(Reply::Value(reply.result.unwrap_or(Value::Null)))
}

async fn crash(m: Message) -> Result<Reply, HandlerError> {
    let code = m.get("code").and_then(Value::as_i64).unwrap_or(1);
    tracing::warn!(code, "Crashing on request");
    process::exit(code as i32)
}

async fn exit(_m: Message) -> Result<Reply, HandlerError> {
    tracing::info!("Exiting on request");
    process::exit(0)
}

async fn ignore_halt(_m: Message) -> Result<Reply, HandlerError> {
    tracing::info!("Ignoring halt");
    Ok(Reply::Unhandled)
}
