//! Splitting outgoing content into frames and reassembling incoming content

use bytes::{Bytes, BytesMut};
use fe2o3_amqp091_types::method::Method;

use crate::{content::Content, error::ProtocolViolation};

use super::{ContentHeader, Frame, FrameBody, FRAME_OVERHEAD};

/// Upper bound on the body buffer reserved when a content header arrives. The declared size
/// comes from the peer, so anything larger grows with the body frames instead.
const MAX_BODY_RESERVE: usize = 128 * 1024;

/// Frames that follow a content-bearing method: one header frame and as many body frames as
/// `frame_max` requires. An empty body produces no body frames; `frame_max == 0` means no limit.
pub fn content_frames(channel: u16, class_id: u16, content: Content, frame_max: usize) -> Vec<Frame> {
    let Content {
        mut body,
        properties,
    } = content;
    let header = ContentHeader {
        class_id,
        weight: 0,
        body_size: body.len() as u64,
        properties,
    };

    let chunk = match frame_max {
        0 => body.len().max(1),
        max => max.saturating_sub(FRAME_OVERHEAD).max(1),
    };

    let mut frames = Vec::with_capacity(1 + body.len() / chunk + 1);
    frames.push(Frame::new(channel, FrameBody::Header(header)));
    while !body.is_empty() {
        let at = chunk.min(body.len());
        frames.push(Frame::new(channel, FrameBody::Body(body.split_to(at))));
    }
    frames
}

#[derive(Debug)]
struct Partial {
    method: Method,
    header: Option<ContentHeader>,
    body: BytesMut,
}

/// Reassembles a content-bearing method, its header and its body frames
#[derive(Debug, Default)]
pub struct ContentAssembler {
    partial: Option<Partial>,
}

impl ContentAssembler {
    /// Creates an idle assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no content is in progress
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Starts a new content with the method that announces it
    pub fn start(&mut self, method: Method) -> Result<(), ProtocolViolation> {
        if self.partial.is_some() {
            return Err(ProtocolViolation::ContentInterrupted(method.id));
        }
        self.partial = Some(Partial {
            method,
            header: None,
            body: BytesMut::new(),
        });
        Ok(())
    }

    /// Accepts the content header. Returns the complete content if the body is empty.
    pub fn on_header(
        &mut self,
        header: ContentHeader,
    ) -> Result<Option<(Method, Content)>, ProtocolViolation> {
        let partial = match &mut self.partial {
            Some(partial) if partial.header.is_none() => partial,
            _ => return Err(ProtocolViolation::UnexpectedHeader),
        };
        if header.class_id != partial.method.id.class_id {
            return Err(ProtocolViolation::ClassMismatch {
                expected: partial.method.id.class_id,
                found: header.class_id,
            });
        }
        partial.body.reserve(header.body_size.min(MAX_BODY_RESERVE as u64) as usize);
        partial.header = Some(header);
        Ok(self.take_if_complete())
    }

    /// Accepts a body frame. Returns the complete content once all bytes arrived.
    pub fn on_body(&mut self, bytes: Bytes) -> Result<Option<(Method, Content)>, ProtocolViolation> {
        let partial = match &mut self.partial {
            Some(partial) => partial,
            None => return Err(ProtocolViolation::UnexpectedBody),
        };
        let declared = match &partial.header {
            Some(header) => header.body_size,
            None => return Err(ProtocolViolation::UnexpectedBody),
        };
        if (partial.body.len() + bytes.len()) as u64 > declared {
            return Err(ProtocolViolation::BodyOverflow { declared });
        }
        partial.body.extend_from_slice(&bytes);
        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<(Method, Content)> {
        let complete = match &self.partial {
            Some(Partial {
                header: Some(header),
                body,
                ..
            }) => body.len() as u64 == header.body_size,
            _ => false,
        };
        if !complete {
            return None;
        }
        let Partial {
            method,
            header,
            body,
        } = self.partial.take()?;
        let content = Content {
            body: body.freeze(),
            properties: header.map(|h| h.properties).unwrap_or_default(),
        };
        Some((method, content))
    }
}
