//! Host-facing API: load and unload modules, manage handlers, route traffic.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch::{dispatch, notify};
use crate::handler::{FnHandler, FnWatcher, Handler, HandlerError, HandlerId};
use crate::lock;
use crate::message::{DEFAULT_PRIORITY, Message, MessageError, MessageType};
use crate::module::{LaunchSpec, ModuleHandle, ModuleInfo, UnloadOutcome};
use crate::registry::{HandlerInfo, HandlerKind, Registry};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(7);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("failed to spawn module {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The module disconnected or exited before it became ready.
    #[error("{0}")]
    Process(String),

    #[error("unknown module: {0}")]
    UnknownModule(String),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Name reported for inline handlers in `message.handlers`.
    pub name: String,
    /// Default request budget when a message carries no timeout.
    pub timeout: Duration,
    /// Delay before a crashed module is spawned again.
    pub respawn_delay: Duration,
    /// Name of the notification sent to a module being unloaded.
    pub halt_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("broker")
    }
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            halt_name: "halt".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub fn with_halt_name(mut self, name: impl Into<String>) -> Self {
        self.halt_name = name.into();
        self
    }
}

/// State shared by the broker and every module supervisor task.
pub(crate) struct BrokerCore {
    pub(crate) config: BrokerConfig,
    timeout_ms: AtomicI64,
    pub(crate) registry: Mutex<Registry>,
    modules: Mutex<BTreeMap<HandlerId, ModuleHandle>>,
}

impl BrokerCore {
    fn new(config: BrokerConfig) -> Self {
        let timeout_ms = config.timeout.as_millis() as i64;
        Self {
            config,
            timeout_ms: AtomicI64::new(timeout_ms),
            registry: Mutex::new(Registry::new()),
            modules: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn timeout_ms(&self) -> i64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.timeout_ms()).unwrap_or(0))
    }

    /// Register a freshly spawned module so requests can reach it.
    pub(crate) fn track(&self, handle: ModuleHandle) {
        let id = handle.id();
        lock(&self.registry).insert(id, Arc::new(handle.clone()), HandlerKind::Module);
        lock(&self.modules).insert(id, handle);
    }

    /// Detach a module from every install and watch list.
    pub(crate) fn unsubscribe(&self, id: HandlerId) {
        lock(&self.registry).unsubscribe(id);
        lock(&self.modules).remove(&id);
    }

    fn module(&self, id: HandlerId) -> Option<ModuleHandle> {
        lock(&self.modules).get(&id).cloned()
    }

    pub(crate) async fn load(self: &Arc<Self>, launch: LaunchSpec) -> Result<ModuleHandle, BrokerError> {
        let (handle, ready) = ModuleHandle::spawn(self, launch)?;
        match ready.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::Process(format!(
                "Module {} loading failed.",
                handle.name()
            ))),
        }
    }
}

/// The host side of the bus.
///
/// Cloning is cheap; all clones share one registry and module table.
#[derive(Clone)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            core: Arc::new(BrokerCore::new(config)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.core.config
    }

    /// Spawn a module and wait until it proves liveness.
    pub async fn load(&self, launch: impl Into<LaunchSpec>) -> Result<ModuleHandle, BrokerError> {
        self.core.load(launch.into()).await
    }

    /// Halt a module, killing it if it does not exit within the timeout.
    pub async fn unload(&self, module: &ModuleHandle) -> UnloadOutcome {
        module.unload(&self.core).await
    }

    pub async fn unload_by_name(&self, name: &str) -> Result<UnloadOutcome, BrokerError> {
        let module = self
            .module(name)
            .ok_or_else(|| BrokerError::UnknownModule(name.to_string()))?;
        Ok(self.unload(&module).await)
    }

    pub async fn unload_all(&self) -> Vec<UnloadOutcome> {
        let modules: Vec<ModuleHandle> = lock(&self.core.modules).values().cloned().collect();
        let unloads = modules.iter().map(|m| m.unload(&self.core));
        futures::future::join_all(unloads).await
    }

    /// Install an inline request handler at the default priority.
    pub fn install<F, Fut>(&self, name: &str, f: F) -> HandlerId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, HandlerError>> + Send + 'static,
    {
        let handler = FnHandler::new(self.core.config.name.clone(), f);
        self.install_handler(name, Arc::new(handler), DEFAULT_PRIORITY)
    }

    pub fn install_handler(&self, name: &str, handler: Arc<dyn Handler>, priority: i64) -> HandlerId {
        let mut registry = lock(&self.core.registry);
        let id = registry.register(handler, HandlerKind::Inline);
        registry.install(name, id, priority);
        tracing::debug!(%name, id, priority, "Inline handler installed");
        id
    }

    /// Install a loaded module as a handler on its behalf.
    pub fn install_module(&self, name: &str, module: &ModuleHandle, priority: i64) {
        module.record_install(name, priority);
        lock(&self.core.registry).install(name, module.id(), priority);
    }

    /// Remove `id` from the handlers of `name`; `None` removes the first
    /// inline handler.
    pub fn uninstall(&self, name: &str, id: Option<HandlerId>) -> bool {
        let removed = {
            let mut registry = lock(&self.core.registry);
            let Some(id) = id.or_else(|| registry.first_inline(name)) else {
                return false;
            };
            registry.uninstall(name, id).then_some(id)
        };
        if let Some(module) = removed.and_then(|id| self.core.module(id)) {
            module.forget_install(name);
        }
        removed.is_some()
    }

    /// Watch `name` with an inline callback.
    pub fn watch<F, Fut>(&self, name: &str, f: F) -> HandlerId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let watcher = FnWatcher::new(self.core.config.name.clone(), f);
        self.watch_handler(name, Arc::new(watcher))
    }

    pub fn watch_handler(&self, name: &str, handler: Arc<dyn Handler>) -> HandlerId {
        let mut registry = lock(&self.core.registry);
        let id = registry.register(handler, HandlerKind::Inline);
        registry.watch(name, id);
        id
    }

    pub fn watch_module(&self, name: &str, module: &ModuleHandle) {
        lock(&self.core.registry).watch(name, module.id());
    }

    pub fn unwatch(&self, name: &str, id: HandlerId) -> bool {
        lock(&self.core.registry).unwatch(name, id)
    }

    /// Global default request timeout in milliseconds.
    pub fn timeout(&self) -> i64 {
        self.core.timeout_ms()
    }

    /// Change the global default; non-positive values are ignored.
    /// Returns the effective value.
    pub fn set_timeout(&self, timeout_ms: i64) -> i64 {
        if timeout_ms > 0 {
            self.core.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        }
        self.timeout()
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        lock(&self.core.modules).values().map(ModuleHandle::info).collect()
    }

    /// Live module currently tracked under `name`.
    pub fn module(&self, name: &str) -> Option<ModuleHandle> {
        lock(&self.core.modules)
            .values()
            .find(|m| m.name() == name)
            .cloned()
    }

    pub fn module_by_id(&self, id: HandlerId) -> Option<ModuleHandle> {
        self.core.module(id)
    }

    pub fn installs(&self, name: &str) -> Vec<HandlerInfo> {
        lock(&self.core.registry).installs_info(name)
    }

    pub fn watchers(&self, name: &str) -> Vec<HandlerInfo> {
        lock(&self.core.registry).watchers_info(name)
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.core.registry).messages()
    }

    /// Route a host-originated request and notify watchers.
    ///
    /// Failures come back as an error-typed message, never as `Err`.
    pub async fn dispatch(&self, message: Message) -> Message {
        let message = message.with_enqueue(false);
        let answer = route(&self.core, message).await;
        notify(&self.core.registry, &answer, None);
        answer
    }

    /// Route a host-originated request without waiting for the outcome.
    pub fn enqueue(&self, message: Message) {
        let core = Arc::clone(&self.core);
        let message = message.with_enqueue(true);
        tokio::spawn(async move {
            let answer = route(&core, message).await;
            notify(&core.registry, &answer, None);
        });
    }
}

async fn route(core: &BrokerCore, message: Message) -> Message {
    let fallback = message.clone();
    match dispatch(&core.registry, message, None, core.timeout()).await {
        Ok(mut answer) if answer.kind != MessageType::Error => {
            answer.kind = MessageType::Answer;
            answer
        }
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(name = %fallback.name, id = %fallback.id, error = %e, "Host request failed");
            fallback.into_error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::new("host").with_timeout(Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn inline_handler_answers_host_dispatch() {
        let broker = broker();
        broker.install("sum", |mut m: Message| async move {
            let a = m.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = m.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            m.result = Some(json!(a + b));
            m.handled = true;
            Ok(m)
        });

        let out = broker
            .dispatch(Message::new("sum", json!({"a": 2, "b": 3})).unwrap())
            .await;
        assert_eq!(out.kind, MessageType::Answer);
        assert!(out.handled);
        assert_eq!(out.result, Some(json!(5)));
        assert_eq!(out.handlers, ["host"]);
        assert_eq!(out.timeout, Some(500));
        assert_eq!(broker.messages(), ["sum"]);
        assert_eq!(broker.installs("sum")[0].priority, Some(DEFAULT_PRIORITY));
    }

    #[tokio::test]
    async fn unhandled_request_comes_back_as_answer() {
        let broker = broker();
        broker.install("pass", |m: Message| async move { Ok(m) });
        broker.install("pass", |m: Message| async move { Ok(m) });

        let out = broker.dispatch(Message::new("pass", json!({})).unwrap()).await;
        assert_eq!(out.kind, MessageType::Answer);
        assert!(!out.handled);
        assert_eq!(out.handlers, ["host", "host"]);

        let nobody = broker.dispatch(Message::new("nobody", json!({})).unwrap()).await;
        assert_eq!(nobody.kind, MessageType::Answer);
        assert!(nobody.handlers.is_empty());
    }

    #[tokio::test]
    async fn failure_comes_back_as_error_message() {
        let broker = broker();
        broker.install("bad", |_m: Message| async move {
            Err(HandlerError::failed("no disk"))
        });
        let out = broker.dispatch(Message::new("bad", json!({})).unwrap()).await;
        assert_eq!(out.kind, MessageType::Error);
        assert_eq!(out.error.as_deref(), Some("no disk"));
    }

    #[tokio::test]
    async fn uninstall_without_id_removes_first_inline() {
        let broker = broker();
        let first = broker.install("x", |m: Message| async move { Ok(m) });
        let second = broker.install("x", |m: Message| async move { Ok(m) });

        assert!(broker.uninstall("x", None));
        let left: Vec<_> = broker.installs("x").iter().map(|i| i.id).collect();
        assert_eq!(left, [second]);
        assert!(!broker.uninstall("x", Some(first)));
        assert!(broker.uninstall("x", None));
        assert!(!broker.uninstall("x", None));
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn watchers_see_host_requests_until_unwatched() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broker.watch("evt", move |m: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
            }
        });

        broker.dispatch(Message::new("evt", json!({"n": 1})).unwrap()).await;
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.kind, MessageType::Answer);
        assert_eq!(seen.get("n"), Some(&json!(1)));
        assert_eq!(broker.watchers("evt").len(), 1);

        assert!(broker.unwatch("evt", id));
        broker.dispatch(Message::new("evt", json!({})).unwrap()).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn enqueue_runs_the_chain_in_the_background() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.install("job", move |m: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m.enqueue);
                Ok(m)
            }
        });
        broker.enqueue(Message::new("job", json!({})).unwrap());
        assert_eq!(rx.recv().await, Some(true));
    }

    #[test]
    fn set_timeout_ignores_non_positive_values() {
        let broker = broker();
        assert_eq!(broker.timeout(), 500);
        assert_eq!(broker.set_timeout(1200), 1200);
        assert_eq!(broker.set_timeout(0), 1200);
        assert_eq!(broker.set_timeout(-5), 1200);
    }

    #[tokio::test]
    async fn unknown_module_is_reported() {
        let err = broker().unload_by_name("ghost").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownModule(ref n) if n == "ghost"));
        assert!(broker().modules().is_empty());
    }

    #[tokio::test]
    async fn load_of_missing_program_fails_to_spawn() {
        let err = broker()
            .load("/nonexistent/procbus-module")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn module_exiting_before_ready_rejects_load() {
        let broker = broker();
        let err = broker.load("true").await.unwrap_err();
        assert!(matches!(err, BrokerError::Process(_)));
    }
}
