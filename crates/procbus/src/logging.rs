//! Subscriber setup for the host and for module processes.
//!
//! `RUST_LOG` wins when set. Otherwise `PROCBUS_LOG` picks the level for the
//! procbus targets (`debug`, `info`, `warn`, `error`; default `info`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::module_tracing_layer::{ModuleLogs, ModuleTracingLayer};

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("PROCBUS_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!(
        "procbus={level},procbus_demo_worker={level},procbus::bridge::codec=off"
    ))
}

/// Host-side subscriber: stderr, JSON when `LOG_FORMAT=json`.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Module-side subscriber: events are queued for the host instead of printed.
///
/// Hand the returned logs to [`crate::Runtime::forward_logs`] once connected.
pub fn init_module_tracing() -> ModuleLogs {
    let (layer, logs) = ModuleTracingLayer::new();
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(layer)
        .try_init();
    logs
}
