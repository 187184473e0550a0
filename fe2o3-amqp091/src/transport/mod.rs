//! Implements low level transport framing
//!
//! The transport owns the byte stream. It writes the protocol header once, then carries
//! [`Frame`]s in both directions through a [`FrameCodec`] and tracks the inbound idle timeout.

mod error;
pub mod protocol_header;

use std::{pin::Pin, sync::Arc, task::Poll, time::Duration};

use fe2o3_amqp091_types::method::MethodTable;
use futures_util::{Future, Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

pub use error::Error;

use crate::{
    frames::{Frame, FrameCodec},
    util::IdleTimeout,
};

use protocol_header::ProtocolHeader;

pin_project! {
    /// Frame transport over a byte stream
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, FrameCodec>,
        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream on which the protocol header was already sent
    pub fn bind(
        io: Io,
        table: Arc<dyn MethodTable>,
        max_frame_size: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let framed = Framed::new(io, FrameCodec::new(table, max_frame_size));
        let idle_timeout = match idle_timeout {
            Some(duration) if !duration.is_zero() => Some(IdleTimeout::new(duration)),
            _ => None,
        };

        Self {
            framed,
            idle_timeout,
        }
    }

    /// Writes the protocol header. The server answers with `connection.start` or, if it does
    /// not support the version, with its own protocol header.
    pub async fn send_proto_header(io: &mut Io, proto_header: ProtocolHeader) -> Result<(), Error> {
        let buf: [u8; 8] = proto_header.into();
        io.write_all(&buf).await?;
        io.flush().await?;
        Ok(())
    }

    /// Changes the maximum frame size after tuning
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.framed.codec_mut().set_max_frame_size(max_frame_size);
        self
    }

    /// Maximum frame size, 0 for no limit
    pub fn max_frame_size(&self) -> usize {
        self.framed.codec().max_frame_size()
    }

    /// Sets the inbound idle timeout, zero disables it
    pub fn set_idle_timeout(&mut self, duration: Duration) -> &mut Self {
        self.idle_timeout = match duration.is_zero() {
            true => None,
            false => Some(IdleTimeout::new(duration)),
        };
        self
    }
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let this = self.project();
        this.framed.start_send(item).map_err(Into::into)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    delay.get_mut().reset();
                }
                Poll::Ready(next.map(|item| item.map_err(Into::into)))
            }
            Poll::Pending => {
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    if let Poll::Ready(()) = delay.poll(cx) {
                        return Poll::Ready(Some(Err(Error::IdleTimeout)));
                    }
                }
                Poll::Pending
            }
        }
    }
}
