//! Framed codec for the host/module channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child pipes, stdio, in-memory duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Readers normally decode into `serde_json::Value` and normalize afterwards,
/// so a frame that is valid JSON but not a valid message does not end the stream.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Never shipped to the host: ModuleTracingLayer drops this target, otherwise
        // encoding a forwarded log would log again and loop.
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageType};
    use serde_json::{Value, json};

    #[test]
    fn message_frame_decodes_as_value() {
        let mut writer = JsonCodec::<Message>::new();
        let mut reader = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let msg = Message::new("echo", json!({"x": 1})).unwrap().with_timeout(250);
        writer.encode(msg.clone(), &mut buf).unwrap();
        let raw = reader.decode(&mut buf).unwrap().unwrap();

        let decoded = Message::normalize(raw).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.kind, MessageType::Request);
        assert_eq!(decoded.timeout, Some(250));
        assert_eq!(decoded.get("x"), Some(&json!(1)));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut writer = JsonCodec::<Value>::new();
        let mut reader = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        writer.encode(json!({"name": "a"}), &mut buf).unwrap();

        let mut head = buf.split_to(3);
        assert!(reader.decode(&mut head).unwrap().is_none());
    }

    #[test]
    fn non_json_frame_is_invalid_data() {
        let mut framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        framing.encode(Bytes::from_static(b"not json"), &mut buf).unwrap();

        let err = JsonCodec::<Value>::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
