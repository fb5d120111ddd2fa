//! Transport glue
//!
//! The engine never owns a socket. Outgoing frames go to a [`TransportSink`]
//! and incoming bytes are pushed into a receiver by whoever owns the read
//! half; [`pump`] does that for any [`AsyncRead`].

use crate::error::Result;
use crate::receiver::{FrameHandler, FrameReceiver};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer growth step used by [`pump`]
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Destination for serialized frames
#[async_trait]
pub trait TransportSink: Send {
    /// Write one buffer; a frame is written as one or two buffers
    async fn write(&mut self, data: Bytes) -> Result<()>;
}

/// Records every write as a separate buffer
#[async_trait]
impl TransportSink for Vec<Bytes> {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.push(data);
        Ok(())
    }
}

/// [`TransportSink`] over any tokio writer
#[derive(Debug)]
pub struct IoSink<W> {
    inner: W,
}

impl<W> IoSink<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Borrow the writer
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> TransportSink for IoSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Feed `reader` into `receiver` until EOF, teardown, or a halting error
///
/// Returns the number of bytes read. Read errors are transport errors and are
/// returned as [`Error::Io`](crate::Error::Io); protocol errors go to the
/// receiver's handler as usual.
pub async fn pump<R, H>(mut reader: R, receiver: &mut FrameReceiver<H>) -> Result<u64>
where
    R: AsyncRead + Unpin,
    H: FrameHandler,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut total = 0u64;
    loop {
        if receiver.is_dead() || receiver.is_halted() {
            return Ok(total);
        }
        buf.reserve(READ_CHUNK_SIZE);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(total);
        }
        total += read as u64;
        receiver.add(buf.split().freeze()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::receiver::ReceiverEvent;
    use std::io;

    #[tokio::test]
    async fn test_io_sink_writes_through() {
        let mock = tokio_test::io::Builder::new()
            .write(b"\x81\x02hi")
            .write(b"more")
            .build();
        let mut sink = IoSink::new(mock);
        sink.write(Bytes::from_static(b"\x81\x02hi")).await.unwrap();
        sink.write(Bytes::from_static(b"more")).await.unwrap();
    }

    #[tokio::test]
    async fn test_io_sink_surfaces_io_errors() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut sink = IoSink::new(mock);
        let err = sink.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[tokio::test]
    async fn test_pump_feeds_receiver_in_chunks() {
        let wire = Frame::text("pumped").masked().to_bytes();
        let reader = tokio_test::io::Builder::new()
            .read(&wire[..3])
            .read(&wire[3..])
            .build();

        let mut receiver = FrameReceiver::new(Vec::new());
        let read = pump(reader, &mut receiver).await.unwrap();
        assert_eq!(read, wire.len() as u64);
        assert!(matches!(&receiver.handler()[0], ReceiverEvent::Text(t, _) if t == "pumped"));
    }

    #[tokio::test]
    async fn test_pump_stops_after_close() {
        let mut wire = BytesMut::new();
        Frame::close(Some(1000), None).write_to(&mut wire);
        let wire = wire.freeze();
        let reader = tokio_test::io::Builder::new().read(&wire).build();

        let mut receiver = FrameReceiver::new(Vec::new());
        pump(reader, &mut receiver).await.unwrap();
        assert!(receiver.is_halted());
        assert_eq!(receiver.handler().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_read_error() {
        let reader = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut receiver = FrameReceiver::new(Vec::new());
        assert!(pump(reader, &mut receiver).await.is_err());
    }
}
