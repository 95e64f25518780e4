//! Tracing layer for module processes.
//!
//! Ships each tracing event to the host as a `log` message, preserving level
//! and target. The host re-emits it on its own sink. Events from the channel
//! plumbing itself are skipped so a failing write cannot log about itself.

use std::fmt::Write as _;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::message::{Message, MessageType};

/// Events queued before the runtime is connected stay buffered up to this depth.
const LOG_QUEUE_DEPTH: usize = 1024;

/// Receiving end of a [`ModuleTracingLayer`], drained by
/// [`crate::Runtime::forward_logs`].
pub struct ModuleLogs {
    rx: mpsc::Receiver<Message>,
}

impl ModuleLogs {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

pub struct ModuleTracingLayer {
    tx: mpsc::Sender<Message>,
}

impl ModuleTracingLayer {
    pub fn new() -> (Self, ModuleLogs) {
        let (tx, rx) = mpsc::channel(LOG_QUEUE_DEPTH);
        (Self { tx }, ModuleLogs { rx })
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for ModuleTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with("procbus::bridge") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let payload = json!({
            "level": Self::level_to_string(metadata.level()),
            "target": target,
            "text": visitor.finish(),
        });
        if let Ok(message) = Message::new("log", payload) {
            // Full queue: drop rather than block the caller.
            let _ = self
                .tx
                .try_send(message.with_kind(MessageType::Log).with_enqueue(true));
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Vec<Message> {
        let (layer, mut logs) = ModuleTracingLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);

        let mut out = Vec::new();
        while let Ok(message) = logs.rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn events_become_log_messages() {
        let logs = capture(|| {
            tracing::warn!(target: "indexer", files = 3, "scan slow");
        });
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.kind, MessageType::Log);
        assert!(log.enqueue);
        assert_eq!(log.get("level"), Some(&Value::from("warn")));
        assert_eq!(log.get("target"), Some(&Value::from("indexer")));
        assert_eq!(log.get("text"), Some(&Value::from("scan slow files=3")));
    }

    #[test]
    fn channel_plumbing_is_not_forwarded() {
        let logs = capture(|| {
            tracing::warn!(target: "procbus::bridge::outbound", "Channel closed");
            tracing::info!(target: "procbus::runtime", "kept");
        });
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].get("text"), Some(&Value::from("kept")));
    }
}
