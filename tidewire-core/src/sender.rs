//! Frame serializer
//!
//! [`FrameSender`] turns outgoing messages and control frames into wire
//! frames. Every call enqueues one unit of work; [`flush`](FrameSender::flush)
//! runs the units strictly one after another, so a unit that is waiting on
//! the compressor or on the transport holds back everything queued after it.

use crate::config::SenderConfig;
use crate::error::{Error, ExtensionError, ProtocolError, Result};
use crate::extension::Extensions;
use crate::frame::{apply_mask, encode_header, header_len};
use crate::protocol::{
    constants::{DEFAULT_CLOSE_CODE, MAX_CONTROL_PAYLOAD},
    extensions::PERMESSAGE_DEFLATE,
    utils::is_valid_close_code,
    Opcode,
};
use crate::transport::TransportSink;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Options for [`FrameSender::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Last fragment of the message
    pub fin: bool,
    /// Binary rather than text; only read on the first fragment
    pub binary: bool,
    /// Mask the payload
    pub mask: bool,
    /// Compress the message; only read on the first fragment
    pub compress: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            fin: true,
            binary: false,
            mask: false,
            compress: false,
        }
    }
}

impl SendOptions {
    /// Final, unmasked, uncompressed text
    pub fn text() -> Self {
        Self::default()
    }

    /// Final, unmasked, uncompressed binary
    pub fn binary() -> Self {
        Self {
            binary: true,
            ..Self::default()
        }
    }

    /// Set the FIN flag
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set masking
    pub fn mask(mut self, mask: bool) -> Self {
        self.mask = mask;
        self
    }

    /// Request compression
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Options for ping and pong frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlOptions {
    /// Mask the payload
    pub mask: bool,
}

impl ControlOptions {
    /// Masked control frame, as clients send them
    pub fn masked() -> Self {
        Self { mask: true }
    }
}

/// Outgoing payload bytes
///
/// Owned payloads belong to the sender and are masked in place. Shared
/// payloads may still be referenced by the caller and are copied before
/// masking.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Bytes the sender may modify
    Owned(BytesMut),
    /// Bytes the sender must not modify
    Shared(Bytes),
}

impl Payload {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the sender may modify the bytes in place
    pub fn is_owned(&self) -> bool {
        matches!(self, Payload::Owned(_))
    }

    /// Convert into immutable bytes without copying
    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Owned(buf) => buf.freeze(),
            Payload::Shared(bytes) => bytes,
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        match self {
            Payload::Owned(buf) => &buf[..],
            Payload::Shared(bytes) => &bytes[..],
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Shared(bytes)
    }
}

impl From<BytesMut> for Payload {
    fn from(buf: BytesMut) -> Self {
        Payload::Owned(buf)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Owned(BytesMut::from(&data[..]))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::from(text.into_bytes())
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Owned(BytesMut::from(data))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::from(text.as_bytes())
    }
}

/// Resolves once the unit it belongs to has been written or has failed
///
/// Units are only written by [`FrameSender::flush`], so a completion awaited
/// before the queue is flushed never resolves. Dropping a completion is
/// allowed; a failure of that unit is then returned from `flush` instead.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Closed)))
    }
}

/// Header fields and payload of one queued frame
#[derive(Debug)]
struct OutgoingFrame {
    opcode: Opcode,
    payload: Payload,
    fin: bool,
    rsv1: bool,
    mask: bool,
    /// Run the payload through the compressor, even on continuation frames
    compress: bool,
}

/// One unit of work on the send queue
#[derive(Debug)]
struct SendJob {
    frame: OutgoingFrame,
    done: oneshot::Sender<Result<()>>,
}

/// Serializes frames for one connection
pub struct FrameSender<S> {
    sink: Option<S>,
    extensions: Extensions,
    merge_threshold: usize,
    queue: VecDeque<SendJob>,
    first_fragment: bool,
    /// Compression chosen by the first fragment of the current message
    compress: bool,
    destroyed: bool,
}

impl<S: TransportSink> FrameSender<S> {
    /// Create a sender with no extensions and the default configuration
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, Extensions::new(), SenderConfig::default())
    }

    /// Create a sender for a connection with negotiated `extensions`
    pub fn with_config(sink: S, extensions: Extensions, config: SenderConfig) -> Self {
        Self {
            sink: Some(sink),
            extensions,
            merge_threshold: config.merge_threshold,
            queue: VecDeque::new(),
            first_fragment: true,
            compress: false,
            destroyed: false,
        }
    }

    /// Queue a data frame
    ///
    /// The first call of a message picks text or binary and whether the
    /// message is compressed; later calls until `fin` send continuation
    /// frames. Compression is ignored unless permessage-deflate was
    /// negotiated.
    ///
    /// Nothing is written until [`flush`](Self::flush) runs.
    pub fn send(&mut self, data: impl Into<Payload>, options: SendOptions) -> Completion {
        let mut opcode = if options.binary { Opcode::Binary } else { Opcode::Text };
        let mut rsv1 = options.compress && self.extensions.is_negotiated(PERMESSAGE_DEFLATE);
        if self.first_fragment {
            self.first_fragment = false;
            self.compress = rsv1;
        } else {
            opcode = Opcode::Continuation;
            rsv1 = false;
        }
        if options.fin {
            self.first_fragment = true;
        }

        self.enqueue(OutgoingFrame {
            opcode,
            payload: data.into(),
            fin: options.fin,
            rsv1,
            mask: options.mask,
            compress: self.compress,
        })
    }

    /// Queue a ping; payloads over 125 bytes are refused
    pub fn ping(&mut self, data: impl Into<Payload>, options: ControlOptions) -> Result<Completion> {
        let frame = control_frame(Opcode::Ping, data.into(), options.mask)?;
        Ok(self.enqueue(frame))
    }

    /// Queue a pong; payloads over 125 bytes are refused
    pub fn pong(&mut self, data: impl Into<Payload>, options: ControlOptions) -> Result<Completion> {
        let frame = control_frame(Opcode::Pong, data.into(), options.mask)?;
        Ok(self.enqueue(frame))
    }

    /// Queue a data frame and write everything queued
    ///
    /// A failure of this unit is returned directly.
    pub async fn send_and_flush(&mut self, data: impl Into<Payload>, options: SendOptions) -> Result<()> {
        let done = self.send(data, options);
        self.flush().await?;
        done.await
    }

    /// Queue a close frame
    ///
    /// `code` defaults to 1000. An invalid code or an oversized reason is a
    /// caller error and nothing is queued.
    pub fn close(&mut self, code: Option<u16>, reason: Option<&str>, mask: bool) -> Result<Completion> {
        let code = code.unwrap_or(DEFAULT_CLOSE_CODE);
        if !is_valid_close_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        let reason = reason.unwrap_or_default();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        let frame = control_frame(Opcode::Close, Payload::Owned(payload), mask)?;
        Ok(self.enqueue(frame))
    }

    /// Write every queued unit, one at a time
    ///
    /// A failing unit resolves its [`Completion`]. When nobody holds that
    /// completion the failure is returned here and the units behind it stay
    /// queued.
    pub async fn flush(&mut self) -> Result<()> {
        while let Some(SendJob { frame, done }) = self.queue.pop_front() {
            match self.write_frame(frame).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(err) if done.is_closed() => {
                    warn!(error = %err, queued = self.queue.len(), "frame write failed");
                    return Err(err);
                }
                Err(err) => {
                    let _ = done.send(Err(err));
                }
            }
        }
        Ok(())
    }

    /// Drop the transport and the queue
    ///
    /// Queued and future units complete immediately without being written.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        trace!(queued = self.queue.len(), "frame sender destroyed");
        self.destroyed = true;
        self.sink = None;
        self.first_fragment = true;
        self.compress = false;
        for job in self.queue.drain(..) {
            let _ = job.done.send(Ok(()));
        }
    }

    /// Number of queued units
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The transport, unless destroyed
    pub fn sink(&self) -> Option<&S> {
        self.sink.as_ref()
    }

    fn enqueue(&mut self, frame: OutgoingFrame) -> Completion {
        let (done, rx) = oneshot::channel();
        if self.destroyed {
            let _ = done.send(Ok(()));
        } else {
            self.queue.push_back(SendJob { frame, done });
        }
        Completion { rx }
    }

    async fn write_frame(&mut self, frame: OutgoingFrame) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        let payload = if frame.compress {
            Payload::Shared(self.compress_payload(frame.payload, frame.fin).await?)
        } else {
            frame.payload
        };

        let mask = frame.mask.then(rand::random::<[u8; 4]>);
        let len = payload.len();
        // Shared payloads are never masked in place, so they always merge.
        let merge = len < self.merge_threshold || (mask.is_some() && !payload.is_owned());
        let header = header_len(len, mask.is_some());
        let mut out = BytesMut::with_capacity(if merge { header + len } else { header });
        encode_header(&mut out, frame.fin, frame.rsv1, frame.opcode, mask, len);

        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        if merge {
            let start = out.len();
            out.put_slice(payload.as_ref());
            if let Some(mask) = mask {
                apply_mask(&mut out[start..], mask);
            }
            return sink.write(out.freeze()).await;
        }

        let body = match payload {
            Payload::Owned(mut buf) => {
                if let Some(mask) = mask {
                    apply_mask(&mut buf, mask);
                }
                buf.freeze()
            }
            Payload::Shared(bytes) => bytes,
        };
        sink.write(out.freeze()).await?;
        sink.write(body).await
    }

    async fn compress_payload(&mut self, payload: Payload, fin: bool) -> Result<Bytes> {
        let extension = self
            .extensions
            .get(PERMESSAGE_DEFLATE)
            .cloned()
            .ok_or(ExtensionError::Unavailable)?;
        let mut extension = extension.lock().await;
        Ok(extension.compress(payload.into_bytes(), fin).await?)
    }
}

fn control_frame(opcode: Opcode, payload: Payload, mask: bool) -> Result<OutgoingFrame> {
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::ControlFrameTooLarge.into());
    }
    Ok(OutgoingFrame {
        opcode,
        payload,
        fin: true,
        rsv1: false,
        mask,
        compress: false,
    })
}

impl<S> fmt::Debug for FrameSender<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSender")
            .field("extensions", &self.extensions)
            .field("merge_threshold", &self.merge_threshold)
            .field("queued", &self.queue.len())
            .field("first_fragment", &self.first_fragment)
            .field("compress", &self.compress)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::testing::{BrokenExtension, ReverseExtension};
    use crate::receiver::{FrameReceiver, ReceiverEvent};
    use crate::transport::IoSink;
    use std::io;
    use tracing_test::traced_test;

    fn recording() -> FrameSender<Vec<Bytes>> {
        FrameSender::new(Vec::new())
    }

    fn written(sender: &FrameSender<Vec<Bytes>>) -> Vec<Bytes> {
        sender.sink().cloned().unwrap_or_default()
    }

    fn concat(writes: &[Bytes]) -> Bytes {
        writes.iter().flat_map(|b| b.iter().copied()).collect::<Vec<u8>>().into()
    }

    async fn parse(wire: Bytes) -> Vec<ReceiverEvent> {
        let mut receiver = FrameReceiver::new(Vec::new());
        receiver.add(wire).await;
        receiver.into_handler()
    }

    #[tokio::test]
    async fn test_exact_bytes_on_the_wire() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0x81, 0x02, b'h', b'i'])
            .write(&[0x82, 0x03, 1, 2, 3])
            .write(&[0x89, 0x00])
            .write(&[0x88, 0x05, 0x03, 0xe8, b'b', b'y', b'e'])
            .build();
        let mut sender = FrameSender::new(IoSink::new(mock));

        let text = sender.send("hi", SendOptions::text());
        let binary = sender.send(vec![1u8, 2, 3], SendOptions::binary());
        let ping = sender.ping(Bytes::new(), ControlOptions::default()).unwrap();
        let close = sender.close(None, Some("bye"), false).unwrap();
        assert_eq!(sender.pending(), 4);

        sender.flush().await.unwrap();
        assert_eq!(sender.pending(), 0);
        text.await.unwrap();
        binary.await.unwrap();
        ping.await.unwrap();
        close.await.unwrap();
    }

    #[tokio::test]
    async fn test_length_classes() {
        for (len, second, header) in [(125usize, 125u8, 2usize), (126, 126, 4), (65535, 126, 4), (65536, 127, 10)] {
            let mut sender = FrameSender::with_config(
                Vec::new(),
                Extensions::new(),
                SenderConfig::default().merge_threshold(usize::MAX),
            );
            sender.send(vec![0u8; len], SendOptions::binary());
            sender.flush().await.unwrap();
            let writes = written(&sender);
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0][1], second, "length {len}");
            assert_eq!(writes[0].len(), header + len);
        }
    }

    #[tokio::test]
    async fn test_large_unmasked_payload_written_separately() {
        let mut sender = recording();
        let payload = Bytes::from(vec![9u8; 40_000]);
        sender.send(payload.clone(), SendOptions::binary());
        sender.flush().await.unwrap();

        let writes = written(&sender);
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[0][..], &[0x82, 126, 0x9c, 0x40]);
        assert_eq!(writes[1], payload);
    }

    #[tokio::test]
    async fn test_large_masked_shared_payload_is_merged() {
        let mut sender = recording();
        let payload = Bytes::from(vec![5u8; 40_000]);
        sender.send(payload.clone(), SendOptions::binary().mask(true));
        sender.flush().await.unwrap();

        let writes = written(&sender);
        assert_eq!(writes.len(), 1);
        assert_eq!(payload, Bytes::from(vec![5u8; 40_000]));
        match &parse(writes[0].clone()).await[0] {
            ReceiverEvent::Binary(data, meta) => {
                assert!(meta.masked);
                assert_eq!(*data, payload);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_masked_owned_payload_masked_in_place() {
        let mut sender = recording();
        sender.send(vec![5u8; 40_000], SendOptions::binary().mask(true));
        sender.flush().await.unwrap();

        let writes = written(&sender);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), 8);
        assert_eq!(writes[0][1], 0x80 | 126);
        let events = parse(concat(&writes)).await;
        assert!(matches!(&events[0], ReceiverEvent::Binary(d, _) if d.len() == 40_000 && d.iter().all(|b| *b == 5)));
    }

    #[tokio::test]
    async fn test_fragmented_message_opcodes() {
        let mut sender = recording();
        sender.send("a", SendOptions::binary().fin(false));
        sender.send("b", SendOptions::text().fin(false));
        sender.send("c", SendOptions::text());
        sender.send("d", SendOptions::text());
        sender.flush().await.unwrap();

        let firsts: Vec<u8> = written(&sender).iter().map(|w| w[0]).collect();
        assert_eq!(firsts, vec![0x02, 0x00, 0x80, 0x81]);
    }

    #[tokio::test]
    async fn test_control_frames_between_fragments() {
        let mut sender = recording();
        sender.send("Hel", SendOptions::text().fin(false));
        sender.ping("p", ControlOptions::masked()).unwrap();
        sender.send("lo", SendOptions::text());
        sender.flush().await.unwrap();

        let events = parse(concat(&written(&sender))).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ReceiverEvent::Ping(d, meta) if &d[..] == b"p" && meta.masked));
        assert!(matches!(&events[1], ReceiverEvent::Text(t, _) if t == "Hello"));
    }

    #[tokio::test]
    async fn test_close_validation() {
        let mut sender = recording();
        assert!(matches!(sender.close(Some(1005), None, false), Err(Error::InvalidCloseCode(1005))));
        assert!(matches!(sender.close(Some(999), None, false), Err(Error::InvalidCloseCode(999))));
        let long = "x".repeat(124);
        assert!(sender.close(Some(1000), Some(&long), false).is_err());
        assert_eq!(sender.pending(), 0);

        sender.close(Some(4000), Some("app"), true).unwrap();
        sender.flush().await.unwrap();
        let events = parse(concat(&written(&sender))).await;
        assert!(matches!(&events[0], ReceiverEvent::Close(4000, reason, meta) if reason == "app" && meta.masked));
    }

    #[tokio::test]
    async fn test_oversized_ping_and_pong_refused() {
        let mut sender = recording();
        let big = vec![0u8; MAX_CONTROL_PAYLOAD + 1];
        assert!(matches!(
            sender.ping(big.clone(), ControlOptions::default()),
            Err(Error::Protocol(ProtocolError::ControlFrameTooLarge))
        ));
        assert!(matches!(
            sender.pong(big, ControlOptions::masked()),
            Err(Error::Protocol(ProtocolError::ControlFrameTooLarge))
        ));
        assert_eq!(sender.pending(), 0);

        sender.pong(vec![1u8; MAX_CONTROL_PAYLOAD], ControlOptions::default()).unwrap();
        sender.flush().await.unwrap();
        let events = parse(concat(&written(&sender))).await;
        assert!(matches!(&events[..], [ReceiverEvent::Pong(d, _)] if d.len() == MAX_CONTROL_PAYLOAD));
    }

    #[tokio::test]
    async fn test_completion_waits_for_flush() {
        let mut sender = recording();
        let mut done = tokio_test::task::spawn(sender.send("queued", SendOptions::text()));
        assert!(done.poll().is_pending());
        assert!(written(&sender).is_empty());

        sender.flush().await.unwrap();
        assert!(done.is_woken());
        assert!(matches!(done.poll(), Poll::Ready(Ok(()))));

        sender.send_and_flush("direct", SendOptions::text()).await.unwrap();
        assert_eq!(written(&sender).len(), 2);
    }

    #[tokio::test]
    async fn test_compression_ignored_without_extension() {
        let mut sender = recording();
        sender.send("plain", SendOptions::text().compress(true));
        sender.flush().await.unwrap();
        assert_eq!(written(&sender)[0][0], 0x81);
    }

    #[tokio::test]
    async fn test_compressed_message_sets_rsv1_on_first_frame_only() {
        let extensions = Extensions::new().with(ReverseExtension::default());
        let mut sender = FrameSender::with_config(Vec::new(), extensions, SenderConfig::default());
        sender.send("abc", SendOptions::text().fin(false).compress(true));
        sender.send("def", SendOptions::text().compress(false));
        sender.send("xyz", SendOptions::text());
        sender.flush().await.unwrap();

        let writes = written(&sender);
        assert_eq!(&writes[0][..], &[0x41, 0x03, b'c', b'b', b'a']);
        assert_eq!(&writes[1][..], &[0x80, 0x03, b'f', b'e', b'd']);
        assert_eq!(&writes[2][..], &[0x81, 0x03, b'x', b'y', b'z']);
    }

    #[tokio::test]
    async fn test_codec_failure_goes_to_completion() {
        let extensions = Extensions::new().with(BrokenExtension);
        let mut sender = FrameSender::with_config(Vec::new(), extensions, SenderConfig::default());
        let failed = sender.send("x", SendOptions::text().compress(true));
        let ok = sender.send("y", SendOptions::text());
        sender.flush().await.unwrap();

        assert!(matches!(failed.await, Err(Error::Extension(_))));
        ok.await.unwrap();
        assert_eq!(written(&sender).len(), 1);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unobserved_failure_surfaces_from_flush() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut sender = FrameSender::new(IoSink::new(mock));
        drop(sender.send("lost", SendOptions::text()));
        let _kept = sender.send("later", SendOptions::text());

        let err = sender.flush().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(sender.pending(), 1);
        assert!(logs_contain("frame write failed"));
        sender.destroy();
    }

    #[tokio::test]
    async fn test_destroy_completes_queued_and_future_units() {
        let mut sender = recording();
        let queued = sender.send("a", SendOptions::text());
        sender.destroy();
        sender.destroy();
        assert!(sender.is_destroyed());
        assert_eq!(sender.pending(), 0);
        queued.await.unwrap();

        let later = sender.ping("p", ControlOptions::default()).unwrap();
        later.await.unwrap();
        sender.flush().await.unwrap();
        assert!(sender.sink().is_none());
    }

    #[test]
    fn test_payload_conversions() {
        assert!(Payload::from("str").is_owned());
        assert!(Payload::from(vec![1u8]).is_owned());
        assert!(Payload::from(String::from("s")).is_owned());
        assert!(!Payload::from(Bytes::from_static(b"b")).is_owned());
        assert!(Payload::from(Bytes::new()).is_empty());
    }
}
