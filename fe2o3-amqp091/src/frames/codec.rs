//! Encoder and decoder of AMQP 0-9-1 frames

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fe2o3_amqp091_types::{
    method::{decode_properties, encode_properties, Method, MethodTable},
    DecodeError, EncodeError,
};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    ContentHeader, Frame, FrameBody, FrameError, FRAME_BODY, FRAME_END, FRAME_HEADER,
    FRAME_HEADER_SIZE, FRAME_HEARTBEAT, FRAME_METHOD, FRAME_OVERHEAD,
};

/// Encoder and decoder of frames. Method and property layouts come from the method table.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    table: Arc<dyn MethodTable>,

    /// Maximum frame size including overhead, 0 for no limit
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a new codec
    pub fn new(table: Arc<dyn MethodTable>, max_frame_size: usize) -> Self {
        Self {
            table,
            max_frame_size,
        }
    }

    /// Changes the maximum frame size, 0 for no limit
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Maximum frame size including overhead, 0 for no limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        match self.max_frame_size {
            0 => Ok(()),
            max if size > max => Err(FrameError::FrameTooLarge { size, max }),
            _ => Ok(()),
        }
    }
}

fn encode_payload(
    table: &dyn MethodTable,
    body: &FrameBody,
    dst: &mut BytesMut,
) -> Result<u8, FrameError> {
    let frame_type = match body {
        FrameBody::Method(method) => {
            method.encode(table, dst)?;
            FRAME_METHOD
        }
        FrameBody::Header(header) => {
            let fields = table
                .properties(header.class_id)
                .ok_or(EncodeError::UnknownClass(header.class_id))?;
            dst.put_u16(header.class_id);
            dst.put_u16(header.weight);
            dst.put_u64(header.body_size);
            encode_properties(fields, &header.properties, dst)?;
            FRAME_HEADER
        }
        FrameBody::Body(bytes) => {
            dst.put_slice(bytes);
            FRAME_BODY
        }
        FrameBody::Heartbeat => FRAME_HEARTBEAT,
    };
    Ok(frame_type)
}

fn decode_payload(
    table: &dyn MethodTable,
    frame_type: u8,
    channel: u16,
    mut payload: Bytes,
) -> Result<Frame, FrameError> {
    let body = match frame_type {
        FRAME_METHOD => FrameBody::Method(Method::decode(table, &mut payload)?),
        FRAME_HEADER => {
            if payload.remaining() < 12 {
                return Err(DecodeError::Incomplete {
                    needed: 12 - payload.remaining(),
                }
                .into());
            }
            let class_id = payload.get_u16();
            let weight = payload.get_u16();
            let body_size = payload.get_u64();
            let fields = table
                .properties(class_id)
                .ok_or(DecodeError::UnknownClass(class_id))?;
            let properties = decode_properties(fields, &mut payload)?;
            FrameBody::Header(ContentHeader {
                class_id,
                weight,
                body_size,
                properties,
            })
        }
        FRAME_BODY => FrameBody::Body(payload),
        FRAME_HEARTBEAT => {
            if channel != 0 || !payload.is_empty() {
                return Err(FrameError::MalformedHeartbeat {
                    channel,
                    size: payload.len(),
                });
            }
            FrameBody::Heartbeat
        }
        other => return Err(FrameError::UnknownFrameType(other)),
    };
    Ok(Frame { channel, body })
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u8(0); // frame type, written once the payload is known
        dst.put_u16(item.channel);
        dst.put_u32(0);

        let frame_type = match encode_payload(self.table.as_ref(), &item.body, dst) {
            Ok(frame_type) => frame_type,
            Err(err) => {
                dst.truncate(start);
                return Err(err);
            }
        };
        let size = dst.len() - start - FRAME_HEADER_SIZE;
        dst.put_u8(FRAME_END);

        if let Err(err) = self.check_size(size + FRAME_OVERHEAD) {
            dst.truncate(start);
            return Err(err);
        }

        dst[start] = frame_type;
        dst[start + 3..start + 7].copy_from_slice(&(size as u32).to_be_bytes());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == b'A' {
            if src.len() < 8 {
                return Ok(None);
            }
            let mut header = [0u8; 8];
            header.copy_from_slice(&src[..8]);
            src.advance(8);
            return Err(FrameError::ProtocolHeader(header));
        }

        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        self.check_size(size + FRAME_OVERHEAD)?;

        let total = size + FRAME_OVERHEAD;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let frame_type = frame.get_u8();
        let channel = frame.get_u16();
        let _ = frame.get_u32();
        let end = frame[size];
        if end != FRAME_END {
            return Err(FrameError::MissingFrameEnd(end));
        }
        frame.truncate(size);

        decode_payload(self.table.as_ref(), frame_type, channel, frame.freeze()).map(Some)
    }
}

/// Decodes exactly one complete frame from `src`.
///
/// Unlike the streaming [`FrameCodec`], the buffer must hold the whole frame and nothing
/// else; a declared size that disagrees with the buffer is a
/// [`FrameError::LengthMismatch`].
pub fn decode_frame(table: &dyn MethodTable, src: &[u8]) -> Result<Frame, FrameError> {
    if src.len() < FRAME_OVERHEAD {
        return Err(FrameError::LengthMismatch {
            declared: 0,
            actual: src.len().saturating_sub(FRAME_OVERHEAD),
        });
    }
    let declared = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
    let actual = src.len() - FRAME_OVERHEAD;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    let end = src[src.len() - 1];
    if end != FRAME_END {
        return Err(FrameError::MissingFrameEnd(end));
    }

    let frame_type = src[0];
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let payload = Bytes::copy_from_slice(&src[FRAME_HEADER_SIZE..src.len() - 1]);
    decode_payload(table, frame_type, channel, payload)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{Bytes, BytesMut};
    use fe2o3_amqp091_types::{
        method::{Method, MethodTable},
        primitives::{Arguments, FieldTable, Value},
        protocol::{self, Amqp091},
    };
    use tokio_util::codec::{Decoder, Encoder};

    use super::{decode_frame, FrameCodec};
    use crate::frames::{ContentHeader, Frame, FrameBody, FrameError};

    fn codec() -> FrameCodec {
        FrameCodec::new(Arc::new(Amqp091), 4096)
    }

    fn encode(frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        codec().encode(frame, &mut dst).unwrap();
        dst
    }

    #[test]
    fn heartbeat_frame_bytes() {
        let dst = encode(Frame::heartbeat());
        assert_eq!(&dst[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn method_frame_bytes() {
        let spec = Amqp091.method(protocol::CHANNEL_OPEN).unwrap();
        let method = Method::from_spec(spec, Arguments::new()).unwrap();
        let dst = encode(Frame::method(1, method));
        assert_eq!(
            &dst[..],
            &[1, 0, 1, 0, 0, 0, 5, 0, 20, 0, 10, 0, 0xCE]
        );
    }

    #[test]
    fn every_frame_kind_decodes_to_what_was_encoded() {
        let frames = vec![
            Frame::method(
                3,
                Method::new(
                    protocol::BASIC_DELIVER,
                    Arguments::new()
                        .with("consumer-tag", Value::ShortStr("ctag".into()))
                        .with("delivery-tag", Value::Timestamp(1))
                        .with("redelivered", false)
                        .with("exchange", Value::ShortStr("".into()))
                        .with("routing-key", Value::ShortStr("rk".into())),
                ),
            ),
            Frame::new(
                3u16,
                FrameBody::Header(ContentHeader {
                    class_id: protocol::class::BASIC,
                    weight: 0,
                    body_size: 5,
                    properties: FieldTable::new()
                        .with("content-type", Value::ShortStr("text/plain".into())),
                }),
            ),
            Frame::new(3u16, FrameBody::Body(Bytes::from_static(b"hello"))),
            Frame::heartbeat(),
        ];

        for frame in frames {
            let bytes = encode(frame.clone());
            let decoded = decode_frame(&Amqp091, &bytes).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(encode(decoded), bytes);
        }
    }

    #[test]
    fn streaming_decode_waits_for_the_whole_frame() {
        let bytes = encode(Frame::new(1u16, FrameBody::Body(Bytes::from_static(b"abc"))));
        let mut codec = codec();
        let mut src = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&bytes[5..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.body, FrameBody::Body(Bytes::from_static(b"abc")));
        assert!(src.is_empty());
    }

    #[test]
    fn declared_length_must_match_buffer() {
        let mut bytes = encode(Frame::new(1u16, FrameBody::Body(Bytes::from_static(b"abcd"))));
        bytes[6] = 3;
        assert!(matches!(
            decode_frame(&Amqp091, &bytes),
            Err(FrameError::LengthMismatch {
                declared: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn missing_frame_end_is_rejected() {
        let mut src = BytesMut::from(&[3, 0, 1, 0, 0, 0, 1, b'x', 0x00][..]);
        assert!(matches!(
            codec().decode(&mut src),
            Err(FrameError::MissingFrameEnd(0x00))
        ));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut src = BytesMut::from(&[9, 0, 1, 0, 0, 0, 0, 0xCE][..]);
        assert!(matches!(
            codec().decode(&mut src),
            Err(FrameError::UnknownFrameType(9))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut src = BytesMut::from(&[3, 0, 1, 0, 1, 0, 0][..]);
        assert!(matches!(
            codec().decode(&mut src),
            Err(FrameError::FrameTooLarge { max: 4096, .. })
        ));
    }

    #[test]
    fn protocol_header_from_peer_is_reported() {
        let mut src = BytesMut::from(&b"AMQP\x00\x00\x09\x01"[..]);
        assert!(matches!(
            codec().decode(&mut src),
            Err(FrameError::ProtocolHeader(header)) if &header == b"AMQP\x00\x00\x09\x01"
        ));
    }

    #[test]
    fn heartbeat_on_a_channel_is_malformed() {
        let mut src = BytesMut::from(&[8, 0, 2, 0, 0, 0, 0, 0xCE][..]);
        assert!(matches!(
            codec().decode(&mut src),
            Err(FrameError::MalformedHeartbeat { channel: 2, .. })
        ));
    }
}
