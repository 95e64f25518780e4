//! procbus: process-oriented message bus.
//!
//! A host [`Broker`] spawns and supervises worker processes ("modules"),
//! routes named messages between them through a priority-ordered handler
//! chain, and restarts modules that crash. Code running inside a module
//! talks to the host through a [`Runtime`].

pub mod bridge;
pub mod broker;
pub mod dispatch;
pub mod handler;
pub mod logging;
pub mod message;
pub mod module;
mod module_tracing_layer;
pub mod registry;
pub mod runtime;

pub use broker::{Broker, BrokerConfig, BrokerError};
pub use handler::{FnHandler, FnWatcher, Handler, HandlerError, HandlerId};
pub use logging::{init_module_tracing, init_tracing};
pub use message::{Envelope, Message, MessageError, MessageType, is_message};
pub use module::{LaunchSpec, ModuleHandle, ModuleInfo, ModuleStatus, UnloadOutcome};
pub use module_tracing_layer::{ModuleLogs, ModuleTracingLayer};
pub use registry::{HandlerInfo, HandlerKind};
pub use runtime::{Reply, Runtime, RuntimeConfig, RuntimeError, Setlocal};

/// Lock a std mutex, recovering the data if a panicking task poisoned it.
///
/// Guards are never held across an `.await`.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Mutex poisoned - recovering state");
            poisoned.into_inner()
        }
    }
}
