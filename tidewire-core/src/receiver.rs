//! Incremental WebSocket frame parser
//!
//! [`FrameReceiver`] consumes bytes exactly as they arrive from the transport
//! and reports complete messages to a [`FrameHandler`]. Internally it is
//! always waiting for a fixed number of bytes (the two header bytes, an
//! extended length, a masking key or a payload). Surplus input is parked in
//! an overflow queue, so one call to [`add`](FrameReceiver::add) may complete
//! several frames and a partial frame simply waits for the next call.
//!
//! Completed frames become [`FrameTask`] values in a FIFO that is drained one
//! task at a time. Decompression may suspend, but messages are always
//! delivered in the order their frames arrived.

use crate::config::ReceiverConfig;
use crate::error::{CloseCode, Error, ExtensionError, ProtocolError, Result};
use crate::extension::Extensions;
use crate::frame::{apply_mask, RawHeader};
use crate::pool::BufferPool;
use crate::protocol::{
    constants::{DEFAULT_CLOSE_CODE, MAX_CONTROL_PAYLOAD, MAX_POOLED_PAYLOAD, MIN_CLOSE_PAYLOAD_SIZE},
    extensions::PERMESSAGE_DEFLATE,
    frame::{MASKING_KEY_LEN, PAYLOAD_LEN_16, PAYLOAD_LEN_64, RSV1_BIT},
    utils::{is_valid_close_code, is_valid_utf8},
    Opcode,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// UTF-8 validation primitive used for text messages and close reasons
pub type Utf8Validator = fn(&[u8]) -> bool;

/// Metadata delivered with text and binary messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMeta {
    /// Whether the final frame of the message was masked
    pub masked: bool,
    /// The assembled message bytes
    pub buffer: Bytes,
}

/// Metadata delivered with ping and pong frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMeta {
    /// Whether the frame was masked
    pub masked: bool,
    /// Control payloads are always delivered as raw bytes
    pub binary: bool,
}

/// Metadata delivered with close frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseMeta {
    /// Whether the frame was masked
    pub masked: bool,
}

/// Receives everything a [`FrameReceiver`] parses
///
/// Every method defaults to doing nothing.
pub trait FrameHandler {
    /// A complete, UTF-8 validated text message
    fn on_text(&mut self, _text: String, _meta: DataMeta) {}

    /// A complete binary message
    fn on_binary(&mut self, _data: Bytes, _meta: DataMeta) {}

    /// A ping frame
    fn on_ping(&mut self, _data: Bytes, _meta: ControlMeta) {}

    /// A pong frame
    fn on_pong(&mut self, _data: Bytes, _meta: ControlMeta) {}

    /// A valid close frame
    fn on_close(&mut self, _code: u16, _reason: String, _meta: CloseMeta) {}

    /// A protocol, size or extension failure; `code` is what the peer should be sent
    fn on_error(&mut self, _error: Error, _code: Option<CloseCode>) {}
}

/// Owned form of every [`FrameHandler`] callback
#[derive(Debug)]
pub enum ReceiverEvent {
    /// See [`FrameHandler::on_text`]
    Text(String, DataMeta),
    /// See [`FrameHandler::on_binary`]
    Binary(Bytes, DataMeta),
    /// See [`FrameHandler::on_ping`]
    Ping(Bytes, ControlMeta),
    /// See [`FrameHandler::on_pong`]
    Pong(Bytes, ControlMeta),
    /// See [`FrameHandler::on_close`]
    Close(u16, String, CloseMeta),
    /// See [`FrameHandler::on_error`]
    Error(Error, Option<CloseCode>),
}

impl FrameHandler for Vec<ReceiverEvent> {
    fn on_text(&mut self, text: String, meta: DataMeta) {
        self.push(ReceiverEvent::Text(text, meta));
    }

    fn on_binary(&mut self, data: Bytes, meta: DataMeta) {
        self.push(ReceiverEvent::Binary(data, meta));
    }

    fn on_ping(&mut self, data: Bytes, meta: ControlMeta) {
        self.push(ReceiverEvent::Ping(data, meta));
    }

    fn on_pong(&mut self, data: Bytes, meta: ControlMeta) {
        self.push(ReceiverEvent::Pong(data, meta));
    }

    fn on_close(&mut self, code: u16, reason: String, meta: CloseMeta) {
        self.push(ReceiverEvent::Close(code, reason, meta));
    }

    fn on_error(&mut self, error: Error, code: Option<CloseCode>) {
        self.push(ReceiverEvent::Error(error, code));
    }
}

// A closed channel means the connection owner is gone; events are dropped.
impl FrameHandler for mpsc::UnboundedSender<ReceiverEvent> {
    fn on_text(&mut self, text: String, meta: DataMeta) {
        let _ = self.send(ReceiverEvent::Text(text, meta));
    }

    fn on_binary(&mut self, data: Bytes, meta: DataMeta) {
        let _ = self.send(ReceiverEvent::Binary(data, meta));
    }

    fn on_ping(&mut self, data: Bytes, meta: ControlMeta) {
        let _ = self.send(ReceiverEvent::Ping(data, meta));
    }

    fn on_pong(&mut self, data: Bytes, meta: ControlMeta) {
        let _ = self.send(ReceiverEvent::Pong(data, meta));
    }

    fn on_close(&mut self, code: u16, reason: String, meta: CloseMeta) {
        let _ = self.send(ReceiverEvent::Close(code, reason, meta));
    }

    fn on_error(&mut self, error: Error, code: Option<CloseCode>) {
        let _ = self.send(ReceiverEvent::Error(error, code));
    }
}

/// Immutable description of a frame, fixed when its header is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Effective opcode; continuation frames resolve to their message's opcode
    pub opcode: Opcode,
    /// FIN bit
    pub fin: bool,
    /// MASK bit
    pub masked: bool,
    /// Part of a multi-frame message
    pub fragmented: bool,
    /// Payload must go through the compression extension
    pub compressed: bool,
}

/// A fully read frame waiting for dispatch
#[derive(Debug, Clone)]
pub struct FrameTask {
    /// Header snapshot
    pub meta: FrameMeta,
    /// Unmasked payload
    pub payload: Bytes,
}

/// Fragmentation state carried between frames
#[derive(Debug, Clone, Copy, Default)]
struct ParserState {
    active_fragmented_op: Option<Opcode>,
    message_compressed: bool,
}

/// What to do once the pending read is satisfied
#[derive(Debug, Clone, Copy)]
enum Step {
    Header,
    Length16(FrameMeta),
    Length64(FrameMeta),
    MaskKey(FrameMeta, usize),
    Payload(FrameMeta, Option<[u8; 4]>),
}

#[derive(Debug)]
enum ReadBuf {
    Header { bytes: [u8; 8], len: usize },
    /// Pool slice sized up front
    Payload(BytesMut),
    /// Large payload, allocated as its bytes arrive
    Streamed { buf: BytesMut, len: usize },
}

impl ReadBuf {
    fn len(&self) -> usize {
        match self {
            ReadBuf::Header { len, .. } | ReadBuf::Streamed { len, .. } => *len,
            ReadBuf::Payload(buf) => buf.len(),
        }
    }

    fn write_at(&mut self, at: usize, src: &[u8]) {
        match self {
            ReadBuf::Header { bytes, .. } => bytes[at..at + src.len()].copy_from_slice(src),
            ReadBuf::Payload(buf) => buf[at..at + src.len()].copy_from_slice(src),
            ReadBuf::Streamed { buf, .. } => buf.extend_from_slice(src),
        }
    }

    fn header(&self) -> &[u8] {
        match self {
            ReadBuf::Header { bytes, len } => &bytes[..*len],
            ReadBuf::Payload(buf) | ReadBuf::Streamed { buf, .. } => &buf[..],
        }
    }

    fn into_payload(self) -> BytesMut {
        match self {
            ReadBuf::Header { bytes, len } => BytesMut::from(&bytes[..len]),
            ReadBuf::Payload(buf) | ReadBuf::Streamed { buf, .. } => buf,
        }
    }
}

/// The single outstanding "expect N bytes" request
#[derive(Debug)]
struct PendingRead {
    step: Step,
    buf: ReadBuf,
    filled: usize,
}

impl PendingRead {
    fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }
}

/// Payload chunks of the message being assembled
#[derive(Debug, Default)]
struct MessageAccumulator {
    chunks: Vec<Bytes>,
    len: usize,
}

impl MessageAccumulator {
    fn push(&mut self, chunk: Bytes) {
        self.len += chunk.len();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    fn take(&mut self) -> Bytes {
        self.len = 0;
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop().unwrap_or_default(),
            _ => {
                let total = self.chunks.iter().map(Bytes::len).sum();
                let mut message = BytesMut::with_capacity(total);
                for chunk in self.chunks.drain(..) {
                    message.put_slice(&chunk);
                }
                message.freeze()
            }
        }
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

/// Tears a receiver down from outside its owning task
///
/// The receiver notices on its next step: pending input and late codec
/// completions are dropped.
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    dead: Arc<AtomicBool>,
}

impl ReceiverHandle {
    /// Mark the receiver dead
    pub fn cleanup(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Whether the receiver has been torn down
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Streaming frame parser for one connection
pub struct FrameReceiver<H> {
    handler: H,
    extensions: Extensions,
    validator: Utf8Validator,
    max_payload: usize,
    state: ParserState,
    pending: Option<PendingRead>,
    overflow: VecDeque<Bytes>,
    accumulator: MessageAccumulator,
    queue: VecDeque<FrameTask>,
    /// Frame queued for dispatch whose follow-up read is not armed yet
    in_flight: Option<FrameMeta>,
    /// Wire length of the current message so far
    message_len: usize,
    fragmented_pool: BufferPool,
    unfragmented_pool: BufferPool,
    halted: bool,
    released: bool,
    dead: Arc<AtomicBool>,
}

impl<H: FrameHandler> FrameReceiver<H> {
    /// Create a receiver with the default configuration and no extensions
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, Extensions::new(), ReceiverConfig::default())
    }

    /// Create a receiver for a connection with negotiated `extensions`
    pub fn with_config(handler: H, extensions: Extensions, config: ReceiverConfig) -> Self {
        let mut receiver = Self {
            handler,
            extensions,
            validator: is_valid_utf8,
            max_payload: config.max_payload,
            state: ParserState::default(),
            pending: None,
            overflow: VecDeque::new(),
            accumulator: MessageAccumulator::default(),
            queue: VecDeque::new(),
            in_flight: None,
            message_len: 0,
            fragmented_pool: BufferPool::smoothed(config.fragmented_pool_size),
            unfragmented_pool: BufferPool::smoothed(config.unfragmented_pool_size),
            halted: false,
            released: false,
            dead: Arc::new(AtomicBool::new(false)),
        };
        receiver.expect_header(2, Step::Header);
        receiver
    }

    /// Replace the UTF-8 validation primitive
    pub fn with_validator(mut self, validator: Utf8Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Feed newly arrived bytes
    ///
    /// Parses every frame the buffered input completes and delivers the
    /// resulting messages before returning. Input is ignored once the
    /// receiver is dead, or halted after an error or a close frame.
    ///
    /// Dropping the returned future is allowed: a frame whose dispatch was
    /// interrupted stays queued and is dispatched again by the next call.
    pub async fn add(&mut self, data: impl Into<Bytes>) {
        if self.check_dead() || self.halted {
            return;
        }
        let data = data.into();
        if !data.is_empty() {
            self.overflow.push_back(data);
        }
        if !self.finish_frame().await {
            return;
        }

        while let Some(read) = self.fill() {
            match self.advance(read) {
                Ok(None) => continue,
                Ok(Some(task)) => {
                    self.in_flight = Some(task.meta);
                    self.queue.push_back(task);
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
            if !self.finish_frame().await {
                return;
            }
        }
    }

    /// Discard in-flight message state and wait for a fresh frame header
    pub fn reset(&mut self) {
        if self.check_dead() {
            return;
        }
        self.clear_state();
        self.halted = false;
        self.expect_header(2, Step::Header);
    }

    /// Irreversibly tear the receiver down
    pub fn cleanup(&mut self) {
        self.dead.store(true, Ordering::Release);
        self.release();
    }

    /// Handle for tearing the receiver down from elsewhere
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            dead: Arc::clone(&self.dead),
        }
    }

    /// Whether [`cleanup`](Self::cleanup) has run
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Whether input is being ignored until [`reset`](Self::reset)
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Bytes received but not yet turned into a frame
    pub fn buffered_bytes(&self) -> usize {
        let partial = self.pending.as_ref().map_or(0, |read| read.filled);
        partial + self.overflow.iter().map(Bytes::len).sum::<usize>()
    }

    /// The handler receiving parsed messages
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consume the receiver and return its handler
    pub fn into_handler(self) -> H {
        self.handler
    }

    fn check_dead(&mut self) -> bool {
        if self.is_dead() {
            self.release();
            return true;
        }
        false
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        trace!("frame receiver cleanup");
        self.released = true;
        self.pending = None;
        self.overflow.clear();
        self.queue.clear();
        self.in_flight = None;
        self.accumulator.clear();
        self.fragmented_pool.destroy();
        self.unfragmented_pool.destroy();
    }

    fn expect_header(&mut self, len: usize, step: Step) {
        self.pending = Some(PendingRead {
            step,
            buf: ReadBuf::Header { bytes: [0; 8], len },
            filled: 0,
        });
    }

    fn expect_data(&mut self, len: usize, step: Step, fragmented: bool) {
        let buf = if len > MAX_POOLED_PAYLOAD {
            // Trust the length field only as far as the bytes that arrive.
            ReadBuf::Streamed {
                buf: BytesMut::new(),
                len,
            }
        } else if fragmented {
            ReadBuf::Payload(self.fragmented_pool.get(len))
        } else {
            ReadBuf::Payload(self.unfragmented_pool.get(len))
        };
        self.pending = Some(PendingRead { step, buf, filled: 0 });
    }

    /// Satisfy the pending read from the overflow queue
    ///
    /// Returns the read once it is complete; leftover bytes go back to the
    /// front of the queue.
    fn fill(&mut self) -> Option<PendingRead> {
        let pending = self.pending.as_mut()?;
        while !pending.is_complete() {
            let mut chunk = self.overflow.pop_front()?;
            let take = (pending.buf.len() - pending.filled).min(chunk.len());
            pending.buf.write_at(pending.filled, &chunk[..take]);
            pending.filled += take;
            if take < chunk.len() {
                chunk.advance(take);
                self.overflow.push_front(chunk);
            }
        }
        self.pending.take()
    }

    /// Run the step of a completed read
    fn advance(&mut self, read: PendingRead) -> Result<Option<FrameTask>> {
        match read.step {
            Step::Header => {
                let bytes = read.buf.header();
                let raw = RawHeader::decode([bytes[0], bytes[1]]);
                let meta = self.decode_header(&raw)?;
                match raw.len7 {
                    PAYLOAD_LEN_16 => self.expect_header(2, Step::Length16(meta)),
                    PAYLOAD_LEN_64 => self.expect_header(8, Step::Length64(meta)),
                    len => self.begin_payload(meta, len as usize)?,
                }
                Ok(None)
            }
            Step::Length16(meta) => {
                let bytes = read.buf.header();
                let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
                self.begin_payload(meta, len)?;
                Ok(None)
            }
            Step::Length64(meta) => {
                let bytes = read.buf.header();
                let high = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if high != 0 {
                    return Err(ProtocolError::UnsupportedLength.into());
                }
                let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
                self.begin_payload(meta, len)?;
                Ok(None)
            }
            Step::MaskKey(meta, len) => {
                let bytes = read.buf.header();
                let mask = [bytes[0], bytes[1], bytes[2], bytes[3]];
                self.expect_data(len, Step::Payload(meta, Some(mask)), meta.fragmented);
                Ok(None)
            }
            Step::Payload(meta, mask) => {
                let mut payload = read.buf.into_payload();
                if let Some(mask) = mask {
                    apply_mask(&mut payload, mask);
                }
                Ok(Some(FrameTask {
                    meta,
                    payload: payload.freeze(),
                }))
            }
        }
    }

    /// Validate the first two header bytes against the fragmentation state
    fn decode_header(&mut self, raw: &RawHeader) -> Result<FrameMeta> {
        let allowed = if self.extensions.is_negotiated(PERMESSAGE_DEFLATE) {
            RSV1_BIT
        } else {
            0
        };
        if raw.rsv & !allowed != 0 {
            return Err(ProtocolError::ReservedBitsSet.into());
        }
        let compressed = raw.rsv1();
        let opcode = Opcode::from(raw.opcode).ok_or(ProtocolError::InvalidOpcode(raw.opcode))?;

        let meta = match opcode {
            Opcode::Continuation => {
                if compressed {
                    return Err(ProtocolError::CompressedContinuation.into());
                }
                let active = self
                    .state
                    .active_fragmented_op
                    .ok_or(ProtocolError::UnexpectedContinuation)?;
                FrameMeta {
                    opcode: active,
                    fin: raw.fin,
                    masked: raw.masked,
                    fragmented: true,
                    compressed: self.state.message_compressed,
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.state.active_fragmented_op.is_some() {
                    return Err(ProtocolError::ExpectedContinuation.into());
                }
                self.state.message_compressed = compressed;
                if !raw.fin {
                    self.state.active_fragmented_op = Some(opcode);
                }
                FrameMeta {
                    opcode,
                    fin: raw.fin,
                    masked: raw.masked,
                    fragmented: !raw.fin,
                    compressed,
                }
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                if compressed {
                    return Err(ProtocolError::CompressedControlFrame.into());
                }
                if !raw.fin {
                    return Err(ProtocolError::FragmentedControlFrame.into());
                }
                if raw.len7 as usize > MAX_CONTROL_PAYLOAD {
                    return Err(ProtocolError::ControlFrameTooLarge.into());
                }
                FrameMeta {
                    opcode,
                    fin: true,
                    masked: raw.masked,
                    fragmented: false,
                    compressed: false,
                }
            }
        };
        Ok(meta)
    }

    fn begin_payload(&mut self, meta: FrameMeta, len: usize) -> Result<()> {
        if meta.opcode.is_data() {
            self.check_message_len(len)?;
        }
        if meta.masked {
            self.expect_header(MASKING_KEY_LEN, Step::MaskKey(meta, len));
        } else {
            self.expect_data(len, Step::Payload(meta, None), meta.fragmented);
        }
        Ok(())
    }

    /// Header-time guard on the cumulative wire length of the message
    fn check_message_len(&mut self, len: usize) -> Result<()> {
        let total = self.message_len.saturating_add(len);
        if self.max_payload > 0 && total >= self.max_payload {
            return Err(Error::PayloadTooLarge {
                size: total,
                max: self.max_payload,
            });
        }
        self.message_len = total;
        Ok(())
    }

    /// Prepare for the next frame after `meta` was dispatched
    fn end_packet(&mut self, meta: FrameMeta) {
        if !meta.fragmented {
            self.unfragmented_pool.reset(true);
        } else if meta.fin {
            self.fragmented_pool.reset(true);
        }
        if meta.fin && meta.opcode.is_data() {
            if self.state.active_fragmented_op == Some(meta.opcode) {
                self.state.active_fragmented_op = None;
            }
            self.message_len = 0;
        }
        self.expect_header(2, Step::Header);
    }

    /// Dispatch queued tasks, then arm the read that follows the last frame
    ///
    /// Returns false once input has to stop.
    async fn finish_frame(&mut self) -> bool {
        self.drain().await;
        if self.check_dead() || self.halted {
            return false;
        }
        if let Some(meta) = self.in_flight.take() {
            self.end_packet(meta);
        }
        true
    }

    /// Run queued frame tasks one at a time
    ///
    /// A task leaves the queue only once its dispatch has finished.
    async fn drain(&mut self) {
        loop {
            if self.check_dead() {
                return;
            }
            let Some(task) = self.queue.front().cloned() else {
                return;
            };
            let result = self.dispatch(task).await;
            self.queue.pop_front();
            if let Err(err) = result {
                self.fail(err);
                return;
            }
        }
    }

    async fn dispatch(&mut self, task: FrameTask) -> Result<()> {
        let FrameTask { meta, payload } = task;
        match meta.opcode {
            Opcode::Text | Opcode::Binary => self.dispatch_data(meta, payload).await,
            Opcode::Close => self.dispatch_close(meta, payload),
            Opcode::Ping => {
                self.handler.on_ping(payload, ControlMeta { masked: meta.masked, binary: true });
                Ok(())
            }
            Opcode::Pong => {
                self.handler.on_pong(payload, ControlMeta { masked: meta.masked, binary: true });
                Ok(())
            }
            Opcode::Continuation => Err(ProtocolError::UnexpectedContinuation.into()),
        }
    }

    async fn dispatch_data(&mut self, meta: FrameMeta, payload: Bytes) -> Result<()> {
        let payload = if meta.compressed {
            let decoded = self.decompress(payload, meta.fin).await;
            // The codec may have suspended; the receiver could be gone by now.
            if self.check_dead() {
                return Ok(());
            }
            decoded?
        } else {
            payload
        };

        let total = self.accumulator.len + payload.len();
        if self.max_payload > 0 && total >= self.max_payload {
            return Err(Error::PayloadTooLarge {
                size: total,
                max: self.max_payload,
            });
        }
        self.accumulator.push(payload);
        if !meta.fin {
            return Ok(());
        }

        let message = self.accumulator.take();
        if meta.opcode == Opcode::Text {
            if !(self.validator)(&message) {
                return Err(ProtocolError::InvalidUtf8.into());
            }
            let text = String::from_utf8_lossy(&message).into_owned();
            self.handler.on_text(text, DataMeta { masked: meta.masked, buffer: message });
        } else {
            self.handler.on_binary(message.clone(), DataMeta { masked: meta.masked, buffer: message });
        }
        Ok(())
    }

    async fn decompress(&mut self, payload: Bytes, fin: bool) -> Result<Bytes> {
        let extension = self
            .extensions
            .get(PERMESSAGE_DEFLATE)
            .cloned()
            .ok_or(ExtensionError::Unavailable)?;
        let mut extension = extension.lock().await;
        Ok(extension.decompress(payload, fin).await?)
    }

    fn dispatch_close(&mut self, meta: FrameMeta, payload: Bytes) -> Result<()> {
        if !payload.is_empty() && payload.len() < MIN_CLOSE_PAYLOAD_SIZE {
            return Err(ProtocolError::CloseFrameTooShort.into());
        }
        let code = if payload.len() >= MIN_CLOSE_PAYLOAD_SIZE {
            u16::from_be_bytes([payload[0], payload[1]])
        } else {
            DEFAULT_CLOSE_CODE
        };
        if !is_valid_close_code(code) {
            return Err(ProtocolError::InvalidCloseCode(code).into());
        }
        let reason = if payload.len() > MIN_CLOSE_PAYLOAD_SIZE {
            let reason = &payload[MIN_CLOSE_PAYLOAD_SIZE..];
            if !(self.validator)(reason) {
                return Err(ProtocolError::InvalidUtf8.into());
            }
            String::from_utf8_lossy(reason).into_owned()
        } else {
            String::new()
        };

        self.handler.on_close(code, reason, CloseMeta { masked: meta.masked });
        self.clear_state();
        self.halted = true;
        Ok(())
    }

    /// The single error path: reset, halt, report once
    fn fail(&mut self, err: Error) {
        if self.check_dead() {
            return;
        }
        let code = err.close_code();
        debug!(error = %err, code = ?code.map(|c| c.code()), "frame receiver error");
        self.clear_state();
        self.halted = true;
        self.handler.on_error(err, code);
        if code == Some(CloseCode::TooBig) {
            self.cleanup();
        }
    }

    fn clear_state(&mut self) {
        self.state = ParserState::default();
        self.fragmented_pool.reset(true);
        self.unfragmented_pool.reset(true);
        self.pending = None;
        self.overflow.clear();
        self.accumulator.clear();
        self.queue.clear();
        self.in_flight = None;
        self.message_len = 0;
    }
}

impl<H> fmt::Debug for FrameReceiver<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReceiver")
            .field("extensions", &self.extensions)
            .field("max_payload", &self.max_payload)
            .field("state", &self.state)
            .field("pending", &self.pending.as_ref().map(|read| read.step))
            .field("overflow_chunks", &self.overflow.len())
            .field("queued", &self.queue.len())
            .field("halted", &self.halted)
            .field("dead", &self.dead.load(Ordering::Acquire))
            .finish()
    }
}
