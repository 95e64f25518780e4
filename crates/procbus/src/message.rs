//! Message model shared by the host and every module.
//!
//! The wire shape is a flat JSON object:
//! `{id, type, name, handled, handlers, result, error, timeout, broadcast, enqueue, payload}`.
//! Unknown top-level keys are folded into `payload` on the way in, so nothing a
//! peer sends is silently dropped.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Default install priority when a module does not send one.
pub const DEFAULT_PRIORITY: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Message built or received without a usable name.
    #[error("wrong message name")]
    InvalidName,

    /// Channel traffic that is not shaped like a message at all.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Interpretation of a message by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Answer,
    Error,
    Install,
    Uninstall,
    Watch,
    Unwatch,
    Setlocal,
    Connect,
    Log,
    /// Types this build does not know; carried through so they can be logged.
    Other(String),
}

impl MessageType {
    pub fn parse(s: &str) -> Self {
        match s {
            "request" => Self::Request,
            "answer" => Self::Answer,
            "error" => Self::Error,
            "install" => Self::Install,
            "uninstall" => Self::Uninstall,
            "watch" => Self::Watch,
            "unwatch" => Self::Unwatch,
            "setlocal" => Self::Setlocal,
            "connect" => Self::Connect,
            "log" => Self::Log,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Request => "request",
            Self::Answer => "answer",
            Self::Error => "error",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Watch => "watch",
            Self::Unwatch => "unwatch",
            Self::Setlocal => "setlocal",
            Self::Connect => "connect",
            Self::Log => "log",
            Self::Other(s) => s,
        }
    }

    /// Answer or error: the two types that settle a pending request.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Answer | Self::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Unit of communication between host and modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Message {
    /// Correlation token; a reply carries the id of its request.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub name: String,
    /// Set by the handler that fully answered; stops the handler chain.
    pub handled: bool,
    /// Names of the handlers already consulted, in chain order.
    pub handlers: Vec<String>,
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remaining end-to-end budget in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    pub broadcast: bool,
    /// Fire-and-forget: no reply is sent back.
    pub enqueue: bool,
    pub payload: Map<String, Value>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Message {
    /// Build a request. A non-object payload is replaced by an empty map.
    pub fn new(name: impl Into<String>, payload: Value) -> Result<Self, MessageError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MessageError::InvalidName);
        }
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            id: new_id(),
            kind: MessageType::Request,
            name,
            handled: false,
            handlers: Vec::new(),
            result: None,
            error: None,
            timeout: None,
            broadcast: false,
            enqueue: false,
            payload,
        })
    }

    /// Control message (install, watch, connect, ...) with an empty payload.
    pub fn control(kind: MessageType, name: impl Into<String>) -> Result<Self, MessageError> {
        Ok(Self::new(name, Value::Null)?.with_kind(kind))
    }

    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_enqueue(mut self, enqueue: bool) -> Self {
        self.enqueue = enqueue;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.payload.insert(key.into(), value);
    }

    /// Remaining budget as a duration; negative budgets clamp to zero.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
    }

    /// Turn this message into an error reply carrying `error`.
    pub fn into_error(mut self, error: impl Into<String>) -> Self {
        self.kind = MessageType::Error;
        self.error = Some(error.into());
        self
    }

    /// Rebuild a message from untyped channel input.
    ///
    /// `type` defaults to request, `handled` to false; unrecognized top-level
    /// keys are folded into `payload` without overwriting explicit payload fields.
    pub fn normalize(raw: Value) -> Result<Self, MessageError> {
        let Value::Object(obj) = raw else {
            return Err(MessageError::InvalidName);
        };
        let name = match obj.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(MessageError::InvalidName),
        };

        let mut message = Self::new(name, Value::Null)?;
        let mut extra = Map::new();
        for (key, value) in obj {
            match key.as_str() {
                "name" => {}
                "id" => {
                    if let Value::String(id) = value {
                        message.id = id;
                    }
                }
                "type" => {
                    if let Value::String(kind) = value {
                        message.kind = MessageType::parse(&kind);
                    }
                }
                "handled" => message.handled = value.as_bool().unwrap_or(false),
                "handlers" => {
                    if let Value::Array(items) = value {
                        message.handlers = items
                            .into_iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                    }
                }
                "result" => message.result = (!value.is_null()).then_some(value),
                "error" => {
                    message.error = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s),
                        other => Some(other.to_string()),
                    }
                }
                "timeout" => {
                    message.timeout = value
                        .as_i64()
                        .or_else(|| value.as_f64().map(|f| f.round() as i64));
                }
                "broadcast" => message.broadcast = value.as_bool().unwrap_or(false),
                "enqueue" => message.enqueue = value.as_bool().unwrap_or(false),
                "payload" => {
                    if let Value::Object(map) = value {
                        message.payload = map;
                    }
                }
                _ => {
                    extra.insert(key, value);
                }
            }
        }
        for (key, value) in extra {
            message.payload.entry(key).or_insert(value);
        }
        Ok(message)
    }
}

impl TryFrom<Value> for Message {
    type Error = MessageError;

    fn try_from(raw: Value) -> Result<Self, Self::Error> {
        Self::normalize(raw)
    }
}

/// Structural check applied to channel traffic before it is processed.
pub fn is_message(raw: &Value) -> bool {
    matches!(raw.get("id"), Some(Value::String(_)))
        && matches!(raw.get("type"), Some(Value::String(_)))
        && matches!(raw.get("name"), Some(Value::String(_)))
        && matches!(raw.get("payload"), Some(Value::Object(_)))
}

/// Decoded view of an inbound message, carrying only what each type needs.
#[derive(Debug, Clone)]
pub enum Envelope {
    Request(Message),
    Answer(Message),
    Error(Message),
    Install { name: String, priority: i64 },
    Uninstall { name: String },
    Watch { name: String },
    Unwatch { name: String },
    Setlocal(Message),
    Connect,
    Log {
        level: String,
        target: Option<String>,
        text: String,
    },
    Unknown(Message),
}

impl Envelope {
    /// Validate raw channel input and classify it by type.
    pub fn decode(raw: Value) -> Result<Self, MessageError> {
        if !is_message(&raw) {
            return Err(MessageError::Malformed(raw.to_string()));
        }
        Ok(Self::from(Message::normalize(raw)?))
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        match message.kind {
            MessageType::Request => Self::Request(message),
            MessageType::Answer => Self::Answer(message),
            MessageType::Error => Self::Error(message),
            MessageType::Install => Self::Install {
                priority: message
                    .get("priority")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_PRIORITY),
                name: message.name,
            },
            MessageType::Uninstall => Self::Uninstall { name: message.name },
            MessageType::Watch => Self::Watch { name: message.name },
            MessageType::Unwatch => Self::Unwatch { name: message.name },
            MessageType::Setlocal => Self::Setlocal(message),
            MessageType::Connect => Self::Connect,
            MessageType::Log => Self::Log {
                level: message
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string(),
                target: message
                    .get("target")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                text: match message.get("text") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .map(|p| match p {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" "),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            },
            MessageType::Other(_) => Self::Unknown(message),
        }
    }
}
