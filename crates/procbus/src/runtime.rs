//! Worker runtime - the module side of the bus.
//!
//! Mirrors the broker's vocabulary from inside a worker process. The host is
//! reached only through the channel (stdin/stdout by default):
//!
//! - `install`/`uninstall`/`watch`/`unwatch` update a local table and tell the host
//! - inbound requests run the matching local handler under a deadline that
//!   expires slightly before the caller's
//! - `dispatch` and `setlocal` wait for a correlated reply, `enqueue` does not
//!
//! The first frame sent is always `connect`, so the host marks the module
//! ready before any handler exists.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::FramedRead;

use crate::bridge::{JsonCodec, Outbound};
use crate::handler::HandlerError;
use crate::lock;
use crate::message::{DEFAULT_PRIORITY, Message, MessageError, MessageType};
use crate::module_tracing_layer::ModuleLogs;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_HANDLER_MARGIN: Duration = Duration::from_millis(20);
const DEFAULT_NETWORK_MARGIN: Duration = Duration::from_millis(10);
const DEFAULT_HALT_NAME: &str = "halt";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No reply arrived within the message's timeout plus the network margin.
    #[error("dispatch of {name} timed out after {timeout_ms}ms")]
    DispatchTimeout { name: String, timeout_ms: i64 },

    /// The host answered with an error-typed reply.
    #[error("{name}: {error}")]
    Remote { name: String, error: String },

    #[error("channel to host closed")]
    ChannelClosed,

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Configuration pushed to the host with `setlocal`.
#[derive(Debug, Clone, PartialEq)]
pub enum Setlocal {
    /// Shorthand for `{"trackname": name}`.
    Name(String),
    Map(Map<String, Value>),
}

impl Setlocal {
    pub fn key(key: impl Into<String>, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value);
        Self::Map(map)
    }

    fn into_payload(self) -> Map<String, Value> {
        match self {
            Self::Name(name) => {
                let mut map = Map::new();
                map.insert("trackname".to_string(), Value::String(name));
                map
            }
            Self::Map(map) => map,
        }
    }
}

impl From<&str> for Setlocal {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Setlocal {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Map<String, Value>> for Setlocal {
    fn from(map: Map<String, Value>) -> Self {
        Self::Map(map)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Timeout for requests that carry none.
    pub timeout: Duration,
    /// Subtracted from the local handler deadline.
    pub handler_margin: Duration,
    /// Added to the wait for a dispatch reply.
    pub network_margin: Duration,
    /// Sent with `setlocal` right after `connect`.
    pub initial: Option<Setlocal>,
    /// Request name that stops the runtime when no local handler claims it.
    /// Must match the host's `BrokerConfig::halt_name`.
    pub halt_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            handler_margin: DEFAULT_HANDLER_MARGIN,
            network_margin: DEFAULT_NETWORK_MARGIN,
            initial: None,
            halt_name: DEFAULT_HALT_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_handler_margin(mut self, margin: Duration) -> Self {
        self.handler_margin = margin;
        self
    }

    pub fn with_network_margin(mut self, margin: Duration) -> Self {
        self.network_margin = margin;
        self
    }

    pub fn with_setlocal(mut self, initial: impl Into<Setlocal>) -> Self {
        self.initial = Some(initial.into());
        self
    }

    pub fn with_halt_name(mut self, name: impl Into<String>) -> Self {
        self.halt_name = name.into();
        self
    }
}

/// What a local handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A full message; its id and name are restored to the request's.
    Message(Message),
    /// Becomes `result` on a handled answer.
    Value(Value),
    /// Pass: the host keeps walking its handler chain.
    Unhandled,
}

impl From<Message> for Reply {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

type LocalHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Reply, HandlerError>> + Send + Sync>;
type LocalWatcher = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Effective values last confirmed by the host.
#[derive(Debug, Clone, Default)]
struct LocalFlags {
    name: Option<String>,
    selfwatch: bool,
    selfdispatch: bool,
    respawn: bool,
    selftimeout: Option<i64>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    outbound: Outbound,
    installs: Mutex<HashMap<String, LocalHandler>>,
    watches: Mutex<HashMap<String, LocalWatcher>>,
    pending: DashMap<String, oneshot::Sender<Message>>,
    flags: Mutex<LocalFlags>,
    stopped: watch::Sender<bool>,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Message>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Handle to the bus from inside a module. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Connect over this process's stdin/stdout.
    pub async fn connect_stdio(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::connect_with(tokio::io::stdin(), tokio::io::stdout(), config).await
    }

    /// Connect over an arbitrary channel and announce the module.
    pub async fn connect_with<R, W>(
        reader: R,
        writer: W,
        config: RuntimeConfig,
    ) -> Result<Self, RuntimeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, _writer) = Outbound::spawn(writer, "host");
        let (stopped, _) = watch::channel(false);
        let initial = config.initial.clone();
        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                config,
                outbound,
                installs: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                pending: DashMap::new(),
                flags: Mutex::new(LocalFlags {
                    respawn: true,
                    ..LocalFlags::default()
                }),
                stopped,
            }),
        };

        if !runtime.send(Message::control(MessageType::Connect, "connect")?) {
            return Err(RuntimeError::ChannelClosed);
        }
        tracing::debug!("Connected to host");

        let reader = FramedRead::new(reader, JsonCodec::<Value>::new());
        tokio::spawn(read_loop(runtime.clone(), reader));

        if let Some(initial) = initial {
            if let Err(e) = runtime.setlocal(initial).await {
                tracing::warn!(error = %e, "Initial setlocal failed");
            }
        }
        Ok(runtime)
    }

    /// Wait until the host hangs up or halts this module.
    pub async fn run(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;
    }

    /// Stop the runtime; `run` returns.
    pub fn stop(&self) {
        self.inner.stopped.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }

    /// Name the host last confirmed for this module, if any.
    pub fn name(&self) -> Option<String> {
        lock(&self.inner.flags).name.clone()
    }

    pub fn selftimeout(&self) -> Option<i64> {
        lock(&self.inner.flags).selftimeout
    }

    pub fn selfwatch(&self) -> bool {
        lock(&self.inner.flags).selfwatch
    }

    pub fn selfdispatch(&self) -> bool {
        lock(&self.inner.flags).selfdispatch
    }

    pub fn respawn(&self) -> bool {
        lock(&self.inner.flags).respawn
    }

    /// Forward events captured by a [`crate::ModuleTracingLayer`] to the host.
    pub fn forward_logs(&self, mut logs: ModuleLogs) {
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(message) = logs.recv().await {
                if !runtime.send(message) {
                    break;
                }
            }
        });
    }

    /// Handle requests for `name` at the default priority.
    pub fn install<F, Fut>(&self, name: &str, handler: F) -> Result<(), RuntimeError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.install_with_priority(name, DEFAULT_PRIORITY, handler)
    }

    pub fn install_with_priority<F, Fut>(
        &self,
        name: &str,
        priority: i64,
        handler: F,
    ) -> Result<(), RuntimeError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        let mut install = Message::control(MessageType::Install, name)?;
        install.set("priority", json!(priority));
        let handler: LocalHandler = Arc::new(move |m| handler(m).boxed());
        lock(&self.inner.installs).insert(name.to_string(), handler);
        self.send(install);
        Ok(())
    }

    pub fn uninstall(&self, name: &str) -> Result<(), RuntimeError> {
        let uninstall = Message::control(MessageType::Uninstall, name)?;
        lock(&self.inner.installs).remove(name);
        self.send(uninstall);
        Ok(())
    }

    /// Receive a copy of every finished request for `name`.
    pub fn watch<F, Fut>(&self, name: &str, watcher: F) -> Result<(), RuntimeError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let watch = Message::control(MessageType::Watch, name)?;
        let watcher: LocalWatcher = Arc::new(move |m| watcher(m).boxed());
        lock(&self.inner.watches).insert(name.to_string(), watcher);
        self.send(watch);
        Ok(())
    }

    pub fn unwatch(&self, name: &str) -> Result<(), RuntimeError> {
        let unwatch = Message::control(MessageType::Unwatch, name)?;
        lock(&self.inner.watches).remove(name);
        self.send(unwatch);
        Ok(())
    }

    /// Fire-and-forget request.
    pub fn enqueue(&self, message: Message) -> Result<(), RuntimeError> {
        if self.send(message.with_enqueue(true)) {
            Ok(())
        } else {
            Err(RuntimeError::ChannelClosed)
        }
    }

    pub fn enqueue_to(&self, name: &str, payload: Value) -> Result<(), RuntimeError> {
        self.enqueue(Message::new(name, payload)?)
    }

    /// Send a request and wait for its answer.
    ///
    /// An error-typed reply is returned as [`RuntimeError::Remote`].
    pub async fn dispatch(&self, mut message: Message) -> Result<Message, RuntimeError> {
        message.enqueue = false;
        let timeout_ms = *message.timeout.get_or_insert_with(|| self.default_timeout_ms());
        let reply = self.exchange(message, timeout_ms).await?;
        match reply.kind {
            MessageType::Error => Err(RuntimeError::Remote {
                name: reply.name,
                error: reply.error.unwrap_or_default(),
            }),
            _ => Ok(reply),
        }
    }

    pub async fn dispatch_to(&self, name: &str, payload: Value) -> Result<Message, RuntimeError> {
        self.dispatch(Message::new(name, payload)?).await
    }

    /// Push configuration to the host and apply the values it confirms.
    pub async fn setlocal(
        &self,
        config: impl Into<Setlocal>,
    ) -> Result<Map<String, Value>, RuntimeError> {
        let mut message = Message::control(MessageType::Setlocal, "setlocal")?;
        message.payload = config.into().into_payload();
        let timeout_ms = self.default_timeout_ms();
        message.timeout = Some(timeout_ms);

        let reply = self.exchange(message, timeout_ms).await?;
        if reply.kind == MessageType::Error {
            return Err(RuntimeError::Remote {
                name: reply.name,
                error: reply.error.unwrap_or_default(),
            });
        }
        let effective = match reply.result {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        self.apply_effective(&effective);
        Ok(effective)
    }

    fn default_timeout_ms(&self) -> i64 {
        self.selftimeout()
            .unwrap_or(self.inner.config.timeout.as_millis() as i64)
    }

    fn apply_effective(&self, effective: &Map<String, Value>) {
        let mut flags = lock(&self.inner.flags);
        for (key, value) in effective {
            match key.as_str() {
                "trackname" => flags.name = value.as_str().map(str::to_string),
                "selfwatch" => flags.selfwatch = value.as_bool().unwrap_or(flags.selfwatch),
                "selfdispatch" => {
                    flags.selfdispatch = value.as_bool().unwrap_or(flags.selfdispatch)
                }
                "respawn" => flags.respawn = value.as_bool().unwrap_or(flags.respawn),
                "selftimeout" => {
                    if let Some(ms) = value.as_i64() {
                        flags.selftimeout = Some(ms);
                    }
                }
                _ => {}
            }
        }
    }

    /// Send `message` and wait for the reply carrying its id.
    async fn exchange(&self, message: Message, timeout_ms: i64) -> Result<Message, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: message.id.clone(),
        };
        self.inner.pending.insert(message.id.clone(), tx);

        let name = message.name.clone();
        if !self.send(message) {
            return Err(RuntimeError::ChannelClosed);
        }

        let wait = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0))
            + self.inner.config.network_margin;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RuntimeError::ChannelClosed),
            Err(_) => Err(RuntimeError::DispatchTimeout { name, timeout_ms }),
        }
    }

    fn send(&self, message: Message) -> bool {
        self.inner.outbound.send(message)
    }

    fn on_frame(&self, raw: Value) {
        let message = match Message::normalize(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed frame from host skipped");
                return;
            }
        };

        let kind = message.kind.clone();
        match kind {
            MessageType::Request => self.on_request(message),
            MessageType::Answer | MessageType::Error | MessageType::Setlocal => {
                if let Some((_, waiter)) = self.inner.pending.remove(&message.id) {
                    let _ = waiter.send(message);
                    return;
                }
                if message.kind == MessageType::Setlocal {
                    tracing::debug!(id = %message.id, "Late setlocal acknowledgement dropped");
                    return;
                }
                let watcher = lock(&self.inner.watches).get(&message.name).cloned();
                match watcher {
                    Some(watcher) => {
                        tokio::spawn(watcher(message));
                    }
                    None => {
                        tracing::debug!(id = %message.id, name = %message.name, "Uncorrelated reply dropped");
                    }
                }
            }
            other => {
                tracing::debug!(kind = %other, name = %message.name, "Unexpected message type from host ignored");
            }
        }
    }

    fn on_request(&self, message: Message) {
        let handler = lock(&self.inner.installs).get(&message.name).cloned();
        let Some(handler) = handler else {
            if message.name == self.inner.config.halt_name {
                tracing::info!("Halt received, stopping");
                self.stop();
            } else if !message.enqueue {
                // Nothing local: hand it back so the host keeps walking its chain.
                let mut pass = message;
                pass.kind = MessageType::Answer;
                self.send(pass);
            }
            return;
        };

        let runtime = self.clone();
        tokio::spawn(async move {
            let reply = runtime.run_handler(handler, message).await;
            if let Some(reply) = reply {
                runtime.send(reply);
            }
        });
    }

    /// Run a local handler under the local deadline; returns the reply to send.
    async fn run_handler(&self, handler: LocalHandler, request: Message) -> Option<Message> {
        let budget_ms = match (request.timeout, self.selftimeout()) {
            (Some(t), Some(s)) => t.min(s),
            (Some(t), None) => t,
            (None, Some(s)) => s,
            (None, None) => self.inner.config.timeout.as_millis() as i64,
        };
        let deadline = Duration::from_millis(u64::try_from(budget_ms).unwrap_or(0))
            .saturating_sub(self.inner.config.handler_margin);

        let id = request.id.clone();
        let name = request.name.clone();
        let enqueue = request.enqueue;
        let fallback = request.clone();

        let reply = match tokio::time::timeout(deadline, handler(request)).await {
            Ok(Ok(Reply::Message(mut answer))) => {
                answer.id = id;
                answer.name = name;
                if answer.kind != MessageType::Error {
                    answer.kind = MessageType::Answer;
                }
                answer
            }
            Ok(Ok(Reply::Value(value))) => {
                let mut answer = fallback;
                answer.kind = MessageType::Answer;
                answer.result = Some(value);
                answer.handled = true;
                answer
            }
            Ok(Ok(Reply::Unhandled)) => fallback.with_kind(MessageType::Answer),
            Ok(Err(e)) => {
                tracing::warn!(%name, error = %e, "Local handler failed");
                fallback.into_error(e.to_string())
            }
            Err(_) => {
                let e = HandlerError::Timeout {
                    handler: self.name().unwrap_or_else(|| "module".to_string()),
                    timeout_ms: deadline.as_millis() as i64,
                };
                tracing::warn!(%name, error = %e, "Local handler timed out");
                fallback.into_error(e.to_string())
            }
        };

        (!enqueue).then_some(reply)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

async fn read_loop<R>(runtime: Runtime, mut reader: FramedRead<R, JsonCodec<Value>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(raw)) => runtime.on_frame(raw),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Host channel error");
                break;
            }
            None => {
                tracing::info!("Host channel closed");
                break;
            }
        }
    }
    // Dropping the waiters fails every outstanding exchange with ChannelClosed.
    runtime.inner.pending.clear();
    runtime.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::io::{DuplexStream, duplex};
    use tokio::sync::mpsc;
    use tokio_util::codec::FramedWrite;

    struct FakeHost {
        reader: FramedRead<DuplexStream, JsonCodec<Value>>,
        writer: FramedWrite<DuplexStream, JsonCodec<Message>>,
    }

    impl FakeHost {
        async fn next(&mut self) -> Message {
            let raw = self.reader.next().await.unwrap().unwrap();
            Message::normalize(raw).unwrap()
        }

        async fn send(&mut self, message: Message) {
            self.writer.send(message).await.unwrap();
        }
    }

    fn collector() -> (
        impl Fn(Message) -> futures::future::Ready<()> + Send + Sync + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |m: Message| {
                let _ = tx.send(m);
                futures::future::ready(())
            },
            rx,
        )
    }

    fn channel() -> (DuplexStream, DuplexStream, FakeHost) {
        let (worker_in, host_out) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        let host = FakeHost {
            reader: FramedRead::new(host_in, JsonCodec::new()),
            writer: FramedWrite::new(host_out, JsonCodec::new()),
        };
        (worker_in, worker_out, host)
    }

    async fn start(config: RuntimeConfig) -> (Runtime, FakeHost) {
        let (reader, writer, mut host) = channel();
        let runtime = Runtime::connect_with(reader, writer, config).await.unwrap();
        assert_eq!(host.next().await.kind, MessageType::Connect);
        (runtime, host)
    }

    #[tokio::test]
    async fn install_announces_and_answers_requests() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        runtime
            .install_with_priority("echo", 7, |m: Message| async move {
                Ok(Reply::Value(m.get("text").cloned().unwrap_or(Value::Null)))
            })
            .unwrap();

        let install = host.next().await;
        assert_eq!(install.kind, MessageType::Install);
        assert_eq!(install.name, "echo");
        assert_eq!(install.get("priority"), Some(&json!(7)));

        let request = Message::new("echo", json!({"text": "hi"})).unwrap();
        host.send(request.clone()).await;
        let answer = host.next().await;
        assert_eq!(answer.id, request.id);
        assert_eq!(answer.kind, MessageType::Answer);
        assert!(answer.handled);
        assert_eq!(answer.result, Some(json!("hi")));
    }

    #[tokio::test]
    async fn returned_message_keeps_request_identity() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        runtime
            .install("rename", |_m: Message| async move {
                let mut other = Message::new("something-else", json!({"x": 1})).unwrap();
                other.handled = true;
                Ok(Reply::Message(other))
            })
            .unwrap();
        host.next().await;

        let request = Message::new("rename", json!({})).unwrap();
        host.send(request.clone()).await;
        let answer = host.next().await;
        assert_eq!(answer.id, request.id);
        assert_eq!(answer.name, "rename");
        assert_eq!(answer.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_reply() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        runtime
            .install("fail", |_m: Message| async move {
                Err(HandlerError::failed("disk full"))
            })
            .unwrap();
        host.next().await;

        host.send(Message::new("fail", json!({})).unwrap()).await;
        let reply = host.next().await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.error.as_deref(), Some("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_misses_the_local_deadline() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        runtime
            .install("slow", |m: Message| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Reply::Message(m))
            })
            .unwrap();
        host.next().await;

        host.send(Message::new("slow", json!({})).unwrap().with_timeout(200))
            .await;
        let reply = host.next().await;
        assert_eq!(reply.kind, MessageType::Error);
        assert!(reply.error.unwrap().contains("timed out after 180ms"));
    }

    #[tokio::test]
    async fn unknown_request_is_handed_back_unhandled() {
        let (_runtime, mut host) = start(RuntimeConfig::new()).await;
        let request = Message::new("nobody-here", json!({})).unwrap();
        host.send(request.clone()).await;
        let reply = host.next().await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.kind, MessageType::Answer);
        assert!(!reply.handled);
    }

    #[tokio::test]
    async fn dispatch_resolves_on_the_correlated_answer() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        let call = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.dispatch_to("sum", json!({"a": 1, "b": 2})).await }
        });

        let request = host.next().await;
        assert_eq!(request.kind, MessageType::Request);
        assert!(!request.enqueue);
        assert_eq!(request.timeout, Some(3000));

        // An unrelated answer first: must not settle the call.
        let mut stray = Message::new("sum", json!({})).unwrap();
        stray.kind = MessageType::Answer;
        host.send(stray).await;

        let mut answer = request.clone();
        answer.kind = MessageType::Answer;
        answer.handled = true;
        answer.result = Some(json!(3));
        host.send(answer).await;

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.result, Some(json!(3)));
        assert_eq!(runtime.pending_len(), 0);
    }

    #[tokio::test]
    async fn error_reply_rejects_dispatch() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        let call = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.dispatch_to("sum", json!({})).await }
        });
        let request = host.next().await;
        host.send(request.into_error("handler sum timed out after 3000ms"))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Remote { ref error, .. } if error.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_timeout_leaves_no_listener() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        let message = Message::new("void", json!({})).unwrap().with_timeout(100);
        let call = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.dispatch(message).await }
        });
        let request = host.next().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::DispatchTimeout { timeout_ms: 100, .. }));
        assert_eq!(runtime.pending_len(), 0);

        // A late answer is dropped quietly.
        host.send(request.with_kind(MessageType::Answer)).await;
        tokio::task::yield_now().await;
        assert!(!runtime.is_stopped());
    }

    #[tokio::test]
    async fn enqueue_marks_fire_and_forget() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        runtime.enqueue_to("tick", json!({"n": 1})).unwrap();
        let sent = host.next().await;
        assert!(sent.enqueue);
        assert_eq!(sent.get("n"), Some(&json!(1)));
        assert_eq!(runtime.pending_len(), 0);
    }

    #[tokio::test]
    async fn setlocal_applies_the_values_the_host_echoes() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        let call = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.setlocal(Setlocal::key("selftimeout", json!(500))).await }
        });

        let request = host.next().await;
        assert_eq!(request.kind, MessageType::Setlocal);
        assert_eq!(request.get("selftimeout"), Some(&json!(500)));

        let mut ack = request.clone();
        ack.handled = true;
        ack.result = Some(json!({"selftimeout": 500}));
        host.send(ack).await;

        let effective = call.await.unwrap().unwrap();
        assert_eq!(effective["selftimeout"], json!(500));
        assert_eq!(runtime.selftimeout(), Some(500));
    }

    #[tokio::test]
    async fn initial_name_is_sent_after_connect() {
        let (reader, writer, mut host) = channel();
        let connect = tokio::spawn(Runtime::connect_with(
            reader,
            writer,
            RuntimeConfig::new().with_setlocal("indexer"),
        ));

        assert_eq!(host.next().await.kind, MessageType::Connect);
        let setlocal = host.next().await;
        assert_eq!(setlocal.get("trackname"), Some(&json!("indexer")));
        let mut ack = setlocal.clone();
        ack.result = Some(json!({"trackname": "indexer"}));
        host.send(ack).await;

        let runtime = connect.await.unwrap().unwrap();
        assert_eq!(runtime.name().as_deref(), Some("indexer"));
    }

    #[tokio::test]
    async fn uncorrelated_answers_reach_local_watchers() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        let (watcher, mut seen) = collector();
        runtime.watch("build", watcher).unwrap();
        assert_eq!(host.next().await.kind, MessageType::Watch);

        let notice = Message::new("build", json!({"ok": true}))
            .unwrap()
            .with_kind(MessageType::Answer);
        host.send(notice).await;
        let got = seen.recv().await.unwrap();
        assert_eq!(got.get("ok"), Some(&json!(true)));

        runtime.unwatch("build").unwrap();
        assert_eq!(host.next().await.kind, MessageType::Unwatch);
    }

    #[tokio::test]
    async fn halt_without_local_handler_stops_run() {
        let (runtime, mut host) = start(RuntimeConfig::new()).await;
        host.send(Message::new("halt", Value::Null).unwrap().with_enqueue(true))
            .await;
        runtime.run().await;
        assert!(runtime.is_stopped());
    }

    #[tokio::test]
    async fn configured_halt_name_stops_run() {
        let config = RuntimeConfig::new().with_halt_name("procbus.halt");
        let (runtime, mut host) = start(config).await;

        // The default name is now an ordinary request and comes back unhandled.
        let plain = Message::new("halt", Value::Null).unwrap();
        host.send(plain.clone()).await;
        let pass = host.next().await;
        assert_eq!(pass.id, plain.id);
        assert_eq!(pass.kind, MessageType::Answer);
        assert!(!pass.handled);
        assert!(!runtime.is_stopped());

        host.send(
            Message::new("procbus.halt", Value::Null)
                .unwrap()
                .with_enqueue(true),
        )
        .await;
        runtime.run().await;
        assert!(runtime.is_stopped());
    }

    #[tokio::test]
    async fn host_hangup_stops_run_and_fails_waiters() {
        let (runtime, host) = start(RuntimeConfig::new()).await;
        let call = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.dispatch_to("never", json!({})).await }
        });
        let mut host = host;
        host.next().await;
        drop(host);

        runtime.run().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::ChannelClosed));
    }
}
