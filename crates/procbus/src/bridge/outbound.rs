//! Outbound half of a channel: a queue drained by a single writer task.
//!
//! Sends never fail the caller. A closed queue or a failed frame write is
//! logged and dropped; whoever waits for a reply has its own timeout.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use super::codec::JsonCodec;
use crate::message::Message;

#[derive(Clone)]
pub struct Outbound {
    peer: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    /// Start the writer task for `writer`. `peer` only labels log lines.
    pub fn spawn<W>(writer: W, peer: impl Into<String>) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut framed = FramedWrite::new(writer, JsonCodec::<Message>::new());

        let task_peer = peer.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = framed.send(msg).await {
                    tracing::warn!(peer = %task_peer, error = %e, "Channel write failed, closing outbound queue");
                    break;
                }
            }
            tracing::trace!(peer = %task_peer, "Outbound writer exiting");
        });

        (Self { peer, tx }, task)
    }

    /// Queue `message`; returns false if the channel is already gone.
    pub fn send(&self, message: Message) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                tracing::warn!(
                    peer = %self.peer,
                    name = %message.name,
                    id = %message.id,
                    "Channel closed, message dropped"
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
