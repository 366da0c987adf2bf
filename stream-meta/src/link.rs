//! # Inter-Core Link Adapter
//!
//! The seam between the metadata layer and whatever carries bytes between
//! the cores (hardware mailbox, shared ring, simulated queue). The
//! contract is deliberately thin:
//!
//! - **Fire-and-forget**: `post` hands the message to the carrier and
//!   returns. No acknowledgment, no timeout, no retry.
//! - **Trusted carrier**: delivery is assumed lossless and in order.
//!   Protocol correctness depends on that, not on latency.
//!
//! Both a blocking and an async flavor are provided; firmware mailbox
//! drivers are usually non-blocking writes, DMA-backed transports want
//! the async variant.

use core::future::Future;

use crate::transit::{FrameCodec, FrameError, LinkMessage};
use crate::MAX_FRAME_SIZE;

/// Errors surfaced by a link transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// The underlying carrier rejected the write
    Transport,
    /// The message could not be framed
    Encode,
}

impl From<FrameError> for LinkError {
    fn from(_: FrameError) -> Self {
        LinkError::Encode
    }
}

/// Blocking transmitter for metadata link messages.
pub trait InterCoreTx {
    /// Hand one message to the carrier.
    fn post(&mut self, msg: &LinkMessage) -> Result<(), LinkError>;
}

/// Async transmitter for metadata link messages.
pub trait AsyncInterCoreTx {
    /// Hand one message to the carrier.
    fn post(&mut self, msg: &LinkMessage) -> impl Future<Output = Result<(), LinkError>>;
}

/// Frames messages through a blocking [`embedded_io::Write`] carrier.
pub struct FrameTx<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W> FrameTx<W> {
    /// Wrap a carrier.
    pub fn new(writer: W) -> Self {
        FrameTx {
            writer,
            codec: FrameCodec::new(),
        }
    }

    /// Recover the carrier.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<W: embedded_io::Write> InterCoreTx for FrameTx<W> {
    fn post(&mut self, msg: &LinkMessage) -> Result<(), LinkError> {
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let len = self.codec.encode(msg, &mut buffer)?;
        self.writer
            .write_all(&buffer[..len])
            .map_err(|_| LinkError::Transport)
    }
}

/// Frames messages through an async [`embedded_io_async::Write`] carrier.
pub struct AsyncFrameTx<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W> AsyncFrameTx<W> {
    /// Wrap a carrier.
    pub fn new(writer: W) -> Self {
        AsyncFrameTx {
            writer,
            codec: FrameCodec::new(),
        }
    }

    /// Recover the carrier.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<W: embedded_io_async::Write> AsyncInterCoreTx for AsyncFrameTx<W> {
    fn post(&mut self, msg: &LinkMessage) -> impl Future<Output = Result<(), LinkError>> {
        async move {
            let mut buffer = [0u8; MAX_FRAME_SIZE];
            let len = self.codec.encode(msg, &mut buffer)?;
            self.writer
                .write_all(&buffer[..len])
                .await
                .map_err(|_| LinkError::Transport)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::EosToken;
    use crate::transit::DeletionNotice;
    use crate::CoreId;

    fn notice_msg() -> LinkMessage {
        LinkMessage::Retired(DeletionNotice {
            origin: CoreId::P1,
            token: EosToken::test_token(2, 0),
        })
    }

    #[test]
    fn test_frame_tx_writes_parseable_frame() {
        let mut storage = [0u8; MAX_FRAME_SIZE];
        let msg = notice_msg();
        {
            let mut tx = FrameTx::new(&mut storage[..]);
            tx.post(&msg).unwrap();
        }

        let (_, parsed) = FrameCodec::parse(&storage).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_frame_tx_reports_full_carrier() {
        let mut storage = [0u8; 4]; // too small for any frame
        let mut tx = FrameTx::new(&mut storage[..]);
        assert!(tx.post(&notice_msg()).is_err());
    }

    #[tokio::test]
    async fn test_async_frame_tx() {
        struct SinkBuf {
            data: std::vec::Vec<u8>,
        }
        impl embedded_io::ErrorType for SinkBuf {
            type Error = core::convert::Infallible;
        }
        impl embedded_io_async::Write for SinkBuf {
            async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
                self.data.extend_from_slice(buf);
                Ok(buf.len())
            }

            async fn flush(&mut self) -> Result<(), Self::Error> {
                Ok(())
            }
        }

        let msg = notice_msg();
        let mut tx = AsyncFrameTx::new(SinkBuf { data: Vec::new() });
        tx.post(&msg).await.unwrap();

        let sink = tx.into_writer();
        let (_, parsed) = FrameCodec::parse(&sink.data).unwrap();
        assert_eq!(parsed, msg);
    }
}
