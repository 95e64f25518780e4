//! IPC bridge between the host and its modules.
//!
//! The channel is the module's stdin/stdout. Each direction carries
//! length-prefixed JSON frames, one message per frame.
//!
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **outbound**: queued writer that logs and swallows send failures

pub mod codec;
pub mod outbound;

pub use codec::JsonCodec;
pub use outbound::Outbound;
