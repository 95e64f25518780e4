//! Module supervisor - owns one worker process.
//!
//! Flow:
//! 1. Spawn the worker with piped stdin/stdout (the channel), inherited stderr
//! 2. First inbound frame of any kind marks the module ready and settles `load`
//! 3. Reader task de-multiplexes inbound messages by type
//! 4. Exit task waits for the process, detaches it from the registry and
//!    schedules a respawn after a crash
//!
//! The process handle never leaves this module; the broker only sees
//! [`ModuleHandle`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::FramedRead;

use crate::bridge::{JsonCodec, Outbound};
use crate::broker::{BrokerCore, BrokerError};
use crate::dispatch::{dispatch, notify};
use crate::handler::{Handler, HandlerError, HandlerId};
use crate::lock;
use crate::message::{Envelope, Message, MessageType};

/// Setlocal keys a module may read but never change.
const READ_ONLY_KEYS: &[&str] = &["procbus.configpath", "procbus.modulepath"];

/// How to start a module process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Initial module name: the program's file stem.
    pub fn module_name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl From<&str> for LaunchSpec {
    fn from(program: &str) -> Self {
        Self::new(program)
    }
}

impl From<PathBuf> for LaunchSpec {
    fn from(program: PathBuf) -> Self {
        Self::new(program)
    }
}

impl From<&Path> for LaunchSpec {
    fn from(program: &Path) -> Self {
        Self::new(program)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModuleStatus {
    Spawning,
    Ready,
    /// Channel closed; the process may still be running.
    Disconnected,
    Exited { code: Option<i32> },
    Killed,
}

/// Snapshot of a module record.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub id: HandlerId,
    pub name: String,
    pub status: ModuleStatus,
    pub ready: bool,
    pub respawn: bool,
    pub selfwatch: bool,
    pub selfdispatch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selftimeout: Option<i64>,
    /// Message name → priority this module installed with.
    pub installs: HashMap<String, i64>,
}

/// Result of [`crate::Broker::unload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The module exited on its own after the halt notification.
    Halted(String),
    /// The module ignored the halt and was killed.
    Killed(String),
}

impl fmt::Display for UnloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halted(name) => write!(f, "Module {name} successfully halted."),
            Self::Killed(name) => write!(f, "Unresponsive module {name} was killed."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitState {
    code: Option<i32>,
    killed: bool,
}

struct ModuleState {
    name: String,
    status: ModuleStatus,
    ready: bool,
    respawn: bool,
    selfwatch: bool,
    selfdispatch: bool,
    selftimeout: Option<i64>,
    installs: HashMap<String, i64>,
}

impl ModuleState {
    fn new(name: String) -> Self {
        Self {
            name,
            status: ModuleStatus::Spawning,
            ready: false,
            respawn: true,
            selfwatch: false,
            selfdispatch: false,
            selftimeout: None,
            installs: HashMap::new(),
        }
    }

    /// Apply recognized keys and echo the effective value of each.
    fn apply_setlocal(&mut self, payload: &Map<String, Value>, default_timeout_ms: i64) -> Map<String, Value> {
        let mut result = Map::new();
        for (key, value) in payload {
            match key.as_str() {
                "trackname" => {
                    if let Some(name) = value.as_str().filter(|n| n.chars().count() > 1) {
                        self.name = name.to_string();
                    }
                    result.insert(key.clone(), json!(self.name));
                }
                "selfwatch" => {
                    if let Some(flag) = value.as_bool() {
                        self.selfwatch = flag;
                    }
                    result.insert(key.clone(), json!(self.selfwatch));
                }
                "selfdispatch" => {
                    if let Some(flag) = value.as_bool() {
                        self.selfdispatch = flag;
                    }
                    result.insert(key.clone(), json!(self.selfdispatch));
                }
                "respawn" => {
                    if let Some(flag) = value.as_bool() {
                        self.respawn = flag;
                    }
                    result.insert(key.clone(), json!(self.respawn));
                }
                "selftimeout" => {
                    if let Some(ms) = value.as_i64().filter(|ms| *ms > 0) {
                        self.selftimeout = Some(ms);
                    }
                    result.insert(
                        key.clone(),
                        json!(self.selftimeout.unwrap_or(default_timeout_ms)),
                    );
                }
                k if READ_ONLY_KEYS.contains(&k) => {
                    tracing::debug!(module = %self.name, key = k, "Read-only setlocal key ignored");
                }
                _ => {}
            }
        }
        result
    }
}

struct PendingReply {
    name: String,
    tx: oneshot::Sender<Message>,
}

/// Removes a pending correlation when the waiting dispatch ends, however it ends.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingReply>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

struct ModuleInner {
    id: HandlerId,
    launch: LaunchSpec,
    state: Mutex<ModuleState>,
    outbound: Outbound,
    pending: DashMap<String, PendingReply>,
    load_tx: Mutex<Option<oneshot::Sender<Result<(), BrokerError>>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitState>>,
    unloading: AtomicBool,
}

/// Cheap, cloneable handle to one supervised module.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<ModuleInner>,
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .finish()
    }
}

/// Pending `load` for a freshly spawned module.
pub(crate) type LoadReceiver = oneshot::Receiver<Result<(), BrokerError>>;

impl ModuleHandle {
    /// Spawn the process and start its reader and exit tasks.
    ///
    /// The returned receiver settles once the module is ready, or fails if
    /// it disconnects or exits first.
    pub(crate) fn spawn(
        core: &Arc<BrokerCore>,
        launch: LaunchSpec,
    ) -> Result<(Self, LoadReceiver), BrokerError> {
        let name = launch.module_name();
        tracing::info!(module = %name, program = %launch.program.display(), "Module loading...");

        let mut child = launch.command().spawn().map_err(|source| BrokerError::Spawn {
            program: launch.program.display().to_string(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Process(format!("Module {name}: stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Process(format!("Module {name}: stdout not captured")))?;

        let (outbound, _writer) = Outbound::spawn(stdin, name.clone());
        let (load_tx, load_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let id = lock(&core.registry).allocate_id();
        let handle = Self {
            inner: Arc::new(ModuleInner {
                id,
                launch,
                state: Mutex::new(ModuleState::new(name)),
                outbound,
                pending: DashMap::new(),
                load_tx: Mutex::new(Some(load_tx)),
                kill_tx: Mutex::new(Some(kill_tx)),
                exit_rx,
                unloading: AtomicBool::new(false),
            }),
        };
        core.track(handle.clone());

        let reader = FramedRead::new(stdout, JsonCodec::<Value>::new());
        tokio::spawn(read_loop(handle.clone(), Arc::clone(core), reader));
        tokio::spawn(supervise_exit(
            handle.clone(),
            Arc::clone(core),
            child,
            kill_rx,
            exit_tx,
        ));

        Ok((handle, load_rx))
    }

    pub fn id(&self) -> HandlerId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        lock(&self.inner.state).name.clone()
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.inner.state).ready
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.inner.launch
    }

    pub fn info(&self) -> ModuleInfo {
        let state = lock(&self.inner.state);
        ModuleInfo {
            id: self.inner.id,
            name: state.name.clone(),
            status: state.status,
            ready: state.ready,
            respawn: state.respawn,
            selfwatch: state.selfwatch,
            selfdispatch: state.selfdispatch,
            selftimeout: state.selftimeout,
            installs: state.installs.clone(),
        }
    }

    /// Requests sent to this module that still wait for a reply.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    fn selftimeout(&self) -> Option<i64> {
        lock(&self.inner.state).selftimeout
    }

    pub(crate) fn record_install(&self, name: &str, priority: i64) {
        lock(&self.inner.state)
            .installs
            .insert(name.to_string(), priority);
    }

    pub(crate) fn forget_install(&self, name: &str) {
        lock(&self.inner.state).installs.remove(name);
    }

    fn send(&self, message: Message) -> bool {
        self.inner.outbound.send(message)
    }

    fn settle_load(&self, result: Result<(), BrokerError>) {
        if let Some(tx) = lock(&self.inner.load_tx).take() {
            let _ = tx.send(result);
        }
    }

    fn mark_ready(&self) {
        let name = {
            let mut state = lock(&self.inner.state);
            if state.ready {
                return;
            }
            state.ready = true;
            state.status = ModuleStatus::Ready;
            state.name.clone()
        };
        tracing::info!(module = %name, "Module is ready");
        self.settle_load(Ok(()));
    }

    /// Handle one inbound frame.
    fn on_frame(&self, core: &Arc<BrokerCore>, raw: Value) {
        // Any traffic proves liveness, even a frame we cannot use.
        self.mark_ready();
        let module = self.name();

        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%module, error = %e, "-?-> skipped");
                return;
            }
        };

        match envelope {
            Envelope::Request(mut message) => {
                if message.timeout.is_none() {
                    message.timeout = Some(self.selftimeout().unwrap_or_else(|| core.timeout_ms()));
                }
                let arrow = if message.enqueue { "-E->" } else { "-R->" };
                tracing::debug!(%module, id = %message.id, name = %message.name, "{arrow}");
                let handle = self.clone();
                let core = Arc::clone(core);
                tokio::spawn(async move { handle.route_request(&core, message).await });
            }
            Envelope::Answer(message) | Envelope::Error(message) => self.complete(message),
            Envelope::Install { name, priority } => {
                tracing::debug!(%module, %name, priority, "-I->");
                self.record_install(&name, priority);
                lock(&core.registry).install(&name, self.inner.id, priority);
            }
            Envelope::Uninstall { name } => {
                tracing::debug!(%module, %name, "-U->");
                self.forget_install(&name);
                lock(&core.registry).uninstall(&name, self.inner.id);
            }
            Envelope::Watch { name } => {
                tracing::debug!(%module, %name, "-W->");
                lock(&core.registry).watch(&name, self.inner.id);
            }
            Envelope::Unwatch { name } => {
                tracing::debug!(%module, %name, "-X->");
                lock(&core.registry).unwatch(&name, self.inner.id);
            }
            Envelope::Setlocal(message) => {
                let reply = self.apply_setlocal(message, core.timeout_ms());
                tracing::debug!(%module, result = ?reply.result, "<-S-");
                self.send(reply);
            }
            Envelope::Connect => {
                tracing::debug!(%module, "-C->");
            }
            Envelope::Log {
                level,
                target,
                text,
            } => emit_module_log(&module, &level, target.as_deref(), &text),
            Envelope::Unknown(message) => {
                tracing::debug!(%module, kind = %message.kind, name = %message.name, "Unrecognized message type ignored");
            }
        }
    }

    /// Run a request from this module through the registry and reply.
    async fn route_request(&self, core: &Arc<BrokerCore>, message: Message) {
        let id = message.id.clone();
        let name = message.name.clone();
        let enqueue = message.enqueue;
        let fallback = message.clone();

        let mut answer = match dispatch(&core.registry, message, Some(self.inner.id), core.timeout())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(module = %self.name(), %name, %id, error = %e, "Request failed");
                fallback.into_error(e.to_string())
            }
        };
        answer.id = id;
        answer.name = name;
        if answer.kind != MessageType::Error {
            answer.kind = MessageType::Answer;
        }

        if !enqueue {
            tracing::debug!(module = %self.name(), id = %answer.id, kind = %answer.kind, "<-A-");
            self.send(answer.clone());
        }
        notify(&core.registry, &answer, Some(self.inner.id));
    }

    /// Settle the dispatch waiting on this reply, if any.
    fn complete(&self, reply: Message) {
        let matched = self
            .inner
            .pending
            .remove_if(&reply.id, |_, pending| pending.name == reply.name);
        match matched {
            Some((_, pending)) => {
                let _ = pending.tx.send(reply);
            }
            None => {
                tracing::debug!(module = %self.name(), id = %reply.id, name = %reply.name, "-A-> uncorrelated reply dropped");
            }
        }
    }

    fn apply_setlocal(&self, mut message: Message, default_timeout_ms: i64) -> Message {
        let result = lock(&self.inner.state).apply_setlocal(&message.payload, default_timeout_ms);
        message.handled = true;
        message.result = Some(Value::Object(result));
        message
    }

    fn mark_disconnected(&self) {
        let mut state = lock(&self.inner.state);
        if matches!(state.status, ModuleStatus::Spawning | ModuleStatus::Ready) {
            state.status = ModuleStatus::Disconnected;
        }
    }

    /// Graceful unload: halt, detach, wait, kill if needed.
    pub(crate) async fn unload(&self, core: &Arc<BrokerCore>) -> UnloadOutcome {
        self.inner.unloading.store(true, Ordering::SeqCst);
        let name = self.name();

        match Message::new(core.config.halt_name.clone(), Value::Null) {
            Ok(halt) => {
                tracing::debug!(module = %name, "<-N- halt");
                self.send(halt.with_enqueue(true));
            }
            Err(e) => tracing::error!(module = %name, error = %e, "Invalid halt message name"),
        }
        core.unsubscribe(self.inner.id);

        let mut exit_rx = self.inner.exit_rx.clone();
        let exited = matches!(
            tokio::time::timeout(core.timeout(), exit_rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        if exited {
            let outcome = UnloadOutcome::Halted(name);
            tracing::info!("{outcome}");
            return outcome;
        }

        if let Some(kill) = lock(&self.inner.kill_tx).take() {
            let _ = kill.send(());
        }
        let _ = exit_rx.wait_for(Option::is_some).await;
        let outcome = UnloadOutcome::Killed(name);
        tracing::warn!("{outcome}");
        outcome
    }
}

#[async_trait]
impl Handler for ModuleHandle {
    fn name(&self) -> String {
        ModuleHandle::name(self)
    }

    /// Send a request to the module and wait for the correlated reply.
    ///
    /// The wait is bounded by the dispatch engine; dropping this future
    /// removes the pending entry.
    async fn dispatch(&self, message: Message) -> Result<Message, HandlerError> {
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: message.id.clone(),
        };
        self.inner.pending.insert(
            message.id.clone(),
            PendingReply {
                name: message.name.clone(),
                tx,
            },
        );

        tracing::debug!(module = %self.name(), id = %message.id, name = %message.name, "<-R-");
        if !self.send(message) {
            return Err(HandlerError::Disconnected(self.name()));
        }

        rx.await
            .map_err(|_| HandlerError::Disconnected(self.name()))
    }

    async fn enqueue(&self, message: Message) {
        tracing::debug!(module = %self.name(), id = %message.id, name = %message.name, "<-N-");
        self.send(message);
    }

    fn self_dispatch(&self) -> bool {
        lock(&self.inner.state).selfdispatch
    }

    fn self_watch(&self) -> bool {
        lock(&self.inner.state).selfwatch
    }
}

async fn read_loop<R>(
    handle: ModuleHandle,
    core: Arc<BrokerCore>,
    mut reader: FramedRead<R, JsonCodec<Value>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(raw)) => handle.on_frame(&core, raw),
            Some(Err(e)) => {
                tracing::error!(module = %handle.name(), error = %e, "Channel error");
                break;
            }
            None => break,
        }
    }

    tracing::warn!(module = %handle.name(), "Module has been disconnected");
    handle.mark_disconnected();
    if !handle.is_ready() {
        handle.settle_load(Err(BrokerError::Process(format!(
            "Module {} loading failed.",
            handle.name()
        ))));
    }
}

async fn supervise_exit(
    handle: ModuleHandle,
    core: Arc<BrokerCore>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitState>>,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        Ok(()) = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::error!(module = %handle.name(), error = %e, "Failed to kill module");
            }
            (child.wait().await, true)
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(module = %handle.name(), error = %e, "Failed to wait for module");
            None
        }
    };
    let name = handle.name();
    tracing::info!(module = %name, ?code, killed, "Module exited");

    let ready = {
        let mut state = lock(&handle.inner.state);
        state.status = if killed {
            ModuleStatus::Killed
        } else {
            ModuleStatus::Exited { code }
        };
        state.ready
    };
    core.unsubscribe(handle.inner.id);
    // Dropping the senders fails every outstanding dispatch with Disconnected.
    handle.inner.pending.clear();
    let _ = exit_tx.send(Some(ExitState { code, killed }));

    if !ready {
        handle.settle_load(Err(BrokerError::Process(format!(
            "Module {name} exited with code {code:?} before it was ready"
        ))));
        return;
    }

    let respawn = lock(&handle.inner.state).respawn;
    let unloading = handle.inner.unloading.load(Ordering::SeqCst);
    if code != Some(0) && !killed && !unloading && respawn {
        let delay = core.config.respawn_delay;
        let launch = handle.inner.launch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(module = %name, "Try respawn");
            if let Err(e) = core.load(launch).await {
                tracing::error!(module = %name, error = %e, "Respawn failed");
            }
        });
    }
}

/// Re-emit a module's forwarded log line on the host's sink.
fn emit_module_log(module: &str, level: &str, origin: Option<&str>, text: &str) {
    let origin = origin.unwrap_or("");
    match level {
        "error" => tracing::error!(target: "procbus::module", %module, origin, "{text}"),
        "warn" | "warning" => tracing::warn!(target: "procbus::module", %module, origin, "{text}"),
        "debug" => tracing::debug!(target: "procbus::module", %module, origin, "{text}"),
        "trace" => tracing::trace!(target: "procbus::module", %module, origin, "{text}"),
        _ => tracing::info!(target: "procbus::module", %module, origin, "{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_is_program_stem() {
        assert_eq!(LaunchSpec::new("/opt/mods/metrics.bin").module_name(), "metrics");
        assert_eq!(LaunchSpec::new("worker").module_name(), "worker");
    }

    #[test]
    fn launch_spec_builder_collects_args_and_env() {
        let spec = LaunchSpec::new("w")
            .arg("--name")
            .args(["a", "b"])
            .env("PROCBUS_LOG", "debug");
        assert_eq!(spec.args, ["--name", "a", "b"]);
        assert_eq!(spec.envs.len(), 1);
    }

    #[test]
    fn unload_outcome_reads_like_a_sentence() {
        assert_eq!(
            UnloadOutcome::Halted("db".into()).to_string(),
            "Module db successfully halted."
        );
        assert!(UnloadOutcome::Killed("db".into()).to_string().contains("killed"));
    }

    #[test]
    fn setlocal_applies_and_echoes_effective_values() {
        let mut state = ModuleState::new("worker".into());
        let payload = json!({
            "trackname": "db",
            "selfwatch": true,
            "respawn": "yes",
            "selftimeout": 500,
            "procbus.modulepath": "/tmp/elsewhere",
            "colour": "blue",
        });
        let Value::Object(payload) = payload else { unreachable!() };

        let result = state.apply_setlocal(&payload, 3000);
        assert_eq!(
            Value::Object(result),
            json!({"trackname": "db", "selfwatch": true, "respawn": true, "selftimeout": 500})
        );
        assert_eq!(state.name, "db");
        assert!(state.selfwatch);
        assert!(state.respawn);
        assert_eq!(state.selftimeout, Some(500));
    }

    #[test]
    fn setlocal_rejects_short_names_and_reports_default_timeout() {
        let mut state = ModuleState::new("worker".into());
        let Value::Object(payload) = json!({"trackname": "x", "selftimeout": 0}) else {
            unreachable!()
        };
        let result = state.apply_setlocal(&payload, 3000);
        assert_eq!(result["trackname"], json!("worker"));
        assert_eq!(result["selftimeout"], json!(3000));
        assert_eq!(state.selftimeout, None);
    }

    #[test]
    fn module_status_serializes_tagged() {
        let v = serde_json::to_value(ModuleStatus::Exited { code: Some(1) }).unwrap();
        assert_eq!(v, json!({"state": "exited", "code": 1}));
        let v = serde_json::to_value(ModuleStatus::Ready).unwrap();
        assert_eq!(v, json!({"state": "ready"}));
    }
}
