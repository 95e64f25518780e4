//! Handler capability shared by supervised modules and in-process callbacks.

use std::future::Future;

use async_trait::async_trait;

use crate::message::Message;

/// Stable identity of a registered handler (module or inline callback).
pub type HandlerId = u64;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// A single handler exceeded its share of the message's budget.
    #[error("handler {handler} timed out after {timeout_ms}ms")]
    Timeout { handler: String, timeout_ms: i64 },

    /// The handler itself reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The module went away while a reply was outstanding.
    #[error("module {0} disconnected")]
    Disconnected(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Something the broker can route a message to.
///
/// `dispatch` is one step of a handler chain and returns the (possibly
/// answered) message; `enqueue` is a fire-and-forget delivery used for
/// watcher notifications.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn dispatch(&self, message: Message) -> Result<Message, HandlerError>;

    async fn enqueue(&self, message: Message);

    /// Whether this handler may handle requests it originated.
    fn self_dispatch(&self) -> bool {
        false
    }

    /// Whether this handler is notified about requests it originated.
    fn self_watch(&self) -> bool {
        false
    }
}

/// Inline request handler backed by an async closure.
pub struct FnHandler<F> {
    label: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, HandlerError>> + Send + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, HandlerError>> + Send + 'static,
{
    fn name(&self) -> String {
        self.label.clone()
    }

    async fn dispatch(&self, message: Message) -> Result<Message, HandlerError> {
        (self.f)(message).await
    }

    async fn enqueue(&self, message: Message) {
        let name = message.name.clone();
        if let Err(e) = (self.f)(message).await {
            tracing::debug!(handler = %self.label, %name, error = %e, "Inline handler failed on notification");
        }
    }
}

/// Inline watcher backed by an async closure; it never answers requests.
pub struct FnWatcher<F> {
    label: String,
    f: F,
}

impl<F, Fut> FnWatcher<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnWatcher<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn name(&self) -> String {
        self.label.clone()
    }

    async fn dispatch(&self, message: Message) -> Result<Message, HandlerError> {
        Ok(message)
    }

    async fn enqueue(&self, message: Message) {
        (self.f)(message).await
    }
}
