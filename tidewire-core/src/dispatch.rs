//! Codec hosting on a dedicated thread
//!
//! A [`CodecDispatcher`] owns every codec it opens in a session table and
//! runs them on its own OS thread, so compression never occupies the task
//! that drives a connection. Handles talk to it over a channel; each request
//! carries a oneshot for its reply, so replies find their caller without a
//! shared registry.

use crate::config::DeflateConfig;
use crate::deflate::{takeover_flags, Deflater, Inflater, Role};
use crate::error::{ExtensionError, Result};
use crate::extension::{Codec, CodecResult, Extension};
use crate::protocol::extensions::PERMESSAGE_DEFLATE;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Key of a codec hosted by a dispatcher
pub type SessionId = u64;

/// What a session should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// A [`Deflater`]
    Deflate {
        /// Compression level
        level: u32,
        /// LZ77 window as a power of two
        window_bits: u8,
        /// Reset the context after every message
        no_context_takeover: bool,
    },
    /// An [`Inflater`]
    Inflate {
        /// Reset the context after every message
        no_context_takeover: bool,
        /// Inflated size limit per message, 0 for unlimited
        max_size: usize,
    },
}

impl CodecKind {
    fn build(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Deflate {
                level,
                window_bits,
                no_context_takeover,
            } => Box::new(Deflater::new(level, window_bits, no_context_takeover)),
            CodecKind::Inflate {
                no_context_takeover,
                max_size,
            } => Box::new(Inflater::new(no_context_takeover, max_size)),
        }
    }
}

#[derive(Debug)]
enum Request {
    Open {
        kind: CodecKind,
        reply: oneshot::Sender<SessionId>,
    },
    Process {
        id: SessionId,
        data: Bytes,
        fin: bool,
        reply: oneshot::Sender<CodecResult>,
    },
    Flush {
        id: SessionId,
        reply: oneshot::Sender<CodecResult>,
    },
    Close {
        id: SessionId,
    },
}

/// Handle to a codec thread; clones share the same thread
///
/// The thread exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct CodecDispatcher {
    tx: mpsc::UnboundedSender<Request>,
}

impl CodecDispatcher {
    /// Start the codec thread
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("tidewire-codec".to_string())
            .spawn(move || serve(rx))?;
        Ok(Self { tx })
    }

    /// Open a session running a fresh codec
    pub async fn open(&self, kind: CodecKind) -> std::result::Result<SessionId, ExtensionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Open { kind, reply })?;
        rx.await.map_err(|_| ExtensionError::Unavailable)
    }

    /// Run `data` through a session's codec
    pub async fn process(&self, id: SessionId, data: Bytes, fin: bool) -> CodecResult {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Process { id, data, fin, reply })?;
        rx.await.map_err(|_| ExtensionError::Unavailable)?
    }

    /// Drain output a session's codec is holding
    pub async fn flush(&self, id: SessionId) -> CodecResult {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Flush { id, reply })?;
        rx.await.map_err(|_| ExtensionError::Unavailable)?
    }

    /// Close a session; unknown sessions are ignored
    pub fn close(&self, id: SessionId) {
        let _ = self.request(Request::Close { id });
    }

    fn request(&self, request: Request) -> std::result::Result<(), ExtensionError> {
        self.tx.send(request).map_err(|_| ExtensionError::Unavailable)
    }
}

fn serve(mut rx: mpsc::UnboundedReceiver<Request>) {
    let mut sessions: HashMap<SessionId, Box<dyn Codec>> = HashMap::new();
    let mut next_id: SessionId = 0;

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Open { kind, reply } => {
                next_id += 1;
                sessions.insert(next_id, kind.build());
                trace!(session = next_id, ?kind, "codec session opened");
                let _ = reply.send(next_id);
            }
            Request::Process { id, data, fin, reply } => {
                let result = match sessions.get_mut(&id) {
                    Some(codec) => codec.process(&data, fin),
                    None => Err(ExtensionError::SessionClosed(id)),
                };
                let _ = reply.send(result);
            }
            Request::Flush { id, reply } => {
                let result = match sessions.get_mut(&id) {
                    Some(codec) => codec.flush(),
                    None => Err(ExtensionError::SessionClosed(id)),
                };
                let _ = reply.send(result);
            }
            Request::Close { id } => {
                if let Some(mut codec) = sessions.remove(&id) {
                    codec.close();
                    trace!(session = id, "codec session closed");
                }
            }
        }
    }

    trace!(open_sessions = sessions.len(), "codec dispatcher stopped");
}

/// permessage-deflate whose codecs run on a [`CodecDispatcher`]
///
/// Dropping it closes both sessions.
#[derive(Debug)]
pub struct DispatchedDeflate {
    dispatcher: CodecDispatcher,
    deflate: SessionId,
    inflate: SessionId,
}

impl DispatchedDeflate {
    /// Open a compressor and a decompressor session for one side of a connection
    pub async fn open(dispatcher: &CodecDispatcher, config: &DeflateConfig, role: Role) -> Result<Self> {
        config.validate()?;
        let (ours, theirs) = takeover_flags(config, role);
        let deflate = dispatcher
            .open(CodecKind::Deflate {
                level: config.level,
                window_bits: config.window_bits,
                no_context_takeover: ours,
            })
            .await?;
        let inflate = match dispatcher
            .open(CodecKind::Inflate {
                no_context_takeover: theirs,
                max_size: config.max_inflated_size,
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                dispatcher.close(deflate);
                return Err(err.into());
            }
        };
        Ok(Self {
            dispatcher: dispatcher.clone(),
            deflate,
            inflate,
        })
    }

    /// Session ids as `(compressor, decompressor)`
    pub fn sessions(&self) -> (SessionId, SessionId) {
        (self.deflate, self.inflate)
    }
}

#[async_trait]
impl Extension for DispatchedDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    async fn compress(&mut self, data: Bytes, fin: bool) -> CodecResult {
        self.dispatcher.process(self.deflate, data, fin).await
    }

    async fn decompress(&mut self, data: Bytes, fin: bool) -> CodecResult {
        self.dispatcher.process(self.inflate, data, fin).await
    }

    async fn close(&mut self) {
        self.dispatcher.close(self.deflate);
        self.dispatcher.close(self.inflate);
    }
}

impl Drop for DispatchedDeflate {
    fn drop(&mut self) {
        self.dispatcher.close(self.deflate);
        self.dispatcher.close(self.inflate);
    }
}
