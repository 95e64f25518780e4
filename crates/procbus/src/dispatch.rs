//! Dispatch engine: walks a handler chain and fans answers out to watchers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::handler::{HandlerError, HandlerId};
use crate::lock;
use crate::message::{Message, MessageType};
use crate::registry::Registry;

/// Route `message` through the handlers installed for its name.
///
/// Handlers run one at a time in priority order, each seeing the message the
/// previous one returned. The walk stops at the first handler that sets
/// `handled`, or once the budget in `message.timeout` is spent. `exclude`
/// (the originating module) is skipped unless it opted into self-dispatch.
/// A message nobody handles comes back unchanged with `handled == false`.
pub async fn dispatch(
    registry: &Mutex<Registry>,
    mut message: Message,
    exclude: Option<HandlerId>,
    default_timeout: Duration,
) -> Result<Message, HandlerError> {
    if message.handled {
        return Ok(message);
    }

    // Snapshot: later registry changes never touch a running chain.
    let chain = lock(registry).chain(&message.name);
    if chain.is_empty() {
        return Ok(message);
    }

    let budget = *message
        .timeout
        .get_or_insert(default_timeout.as_millis() as i64);
    let started = Instant::now();

    let eligible = chain
        .into_iter()
        .filter(|link| Some(link.id) != exclude || link.handler.self_dispatch());

    for (step, link) in eligible.enumerate() {
        if step > 0 {
            let remaining = budget - started.elapsed().as_millis() as i64;
            message.timeout = Some(remaining);
            message.kind = MessageType::Request;
            if message.handled || remaining <= 0 {
                break;
            }
        }

        let handler = link.handler.name();
        message.handlers.push(handler.clone());
        let remaining_ms = message.timeout.unwrap_or(budget);
        let limit = message.timeout_duration().unwrap_or(default_timeout);

        tracing::trace!(name = %message.name, id = %message.id, %handler, remaining_ms, "Dispatch step");
        message = match tokio::time::timeout(limit, link.handler.dispatch(message)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HandlerError::Timeout {
                    handler,
                    timeout_ms: remaining_ms,
                });
            }
        };
    }

    Ok(message)
}

/// Deliver a copy of a finished request to every watcher of its name.
///
/// The copy is re-tagged as an answer. Deliveries are spawned and never
/// awaited; `exclude` is skipped unless it opted into self-watch.
pub fn notify(registry: &Mutex<Registry>, message: &Message, exclude: Option<HandlerId>) {
    let watchers = lock(registry).watchers(&message.name);
    if watchers.is_empty() {
        return;
    }

    let mut notice = message.clone();
    notice.kind = MessageType::Answer;

    for link in watchers {
        if Some(link.id) == exclude && !link.handler.self_watch() {
            continue;
        }
        let notice = notice.clone();
        tokio::spawn(async move {
            link.handler.enqueue(notice).await;
        });
    }
}
