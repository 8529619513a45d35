//! Tokio codec for framed cluster messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::ClusterMessage;

/// Codec for encoding/decoding cluster link frames
#[derive(Debug, Default)]
pub struct ClusterCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl ClusterCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for ClusterCodec {
    type Item = ClusterMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            tracing::warn!(payload_len, "Rejecting oversized cluster frame");
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            self.pending_header = Some(header);
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: ClusterMessage = serde_json::from_slice(&payload_bytes)?;

        if message.kind != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                envelope: message.kind,
            });
        }

        Ok(Some(message))
    }
}

impl Encoder<ClusterMessage> for ClusterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: ClusterMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(message.kind, payload_len as u32).encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use crate::message::{MessageType, PingPayload};
    use bytes::BufMut;

    #[test]
    fn test_codec_ping() {
        let mut codec = ClusterCodec::new();
        let msg =
            ClusterMessage::with_payload(MessageType::Ping, "m-a", &PingPayload { nonce: 77 }, 5)
                .unwrap();

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf[0], MessageType::Ping.as_u8());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.decode_payload::<PingPayload>().unwrap().nonce, 77);
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = ClusterCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(ClusterMessage::heartbeat("m-a", 12345), &mut full_buf)
            .unwrap();

        // Header only, no payload yet
        let mut partial = full_buf.split_to(HEADER_SIZE + 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageType::Heartbeat);
        assert_eq!(decoded.timestamp, 12345);
    }

    #[test]
    fn test_codec_keeps_order() {
        let mut codec = ClusterCodec::new();
        let mut buf = BytesMut::new();
        for ts in 0..5 {
            codec
                .encode(ClusterMessage::heartbeat("m-a", ts), &mut buf)
                .unwrap();
        }
        for ts in 0..5 {
            assert_eq!(codec.decode(&mut buf).unwrap().unwrap().timestamp, ts);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_type_mismatch() {
        let mut codec = ClusterCodec::new();
        let payload = serde_json::to_vec(&ClusterMessage::heartbeat("m-a", 1)).unwrap();

        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::Ping, payload.len() as u32).encode(&mut buf);
        buf.extend_from_slice(&payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = ClusterCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::StatusUpdate.as_u8());
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_codec_rejects_malformed_json() {
        let mut codec = ClusterCodec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::Heartbeat, 4).encode(&mut buf);
        buf.extend_from_slice(b"{{{{");

        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Json(_))));
    }
}
