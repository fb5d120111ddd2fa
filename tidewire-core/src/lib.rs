//! # Tidewire Core
//!
//! WebSocket wire-protocol engine: the part of a WebSocket stack that sits
//! between an already upgraded byte stream and the application.
//!
//! - [`FrameReceiver`] parses frames incrementally, reassembles fragmented
//!   messages, validates them and hands them to a [`FrameHandler`]
//! - [`FrameSender`] frames outgoing messages, masking and compressing them
//!   as requested, and writes them to a [`TransportSink`]
//! - [`BufferPool`] keeps payload allocations down on the receive path
//! - permessage-deflate codecs, in process or hosted by a
//!   [`CodecDispatcher`](dispatch::CodecDispatcher) (feature `compression`)
//!
//! Handshakes, negotiation and connection lifecycle are left to the caller.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/tidewire-core/")]

// Core modules
pub mod config;
pub mod error;
pub mod extension;
pub mod frame;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod transport;

// Compression
#[cfg(feature = "compression")]
#[cfg_attr(docsrs, doc(cfg(feature = "compression")))]
pub mod deflate;
#[cfg(feature = "compression")]
#[cfg_attr(docsrs, doc(cfg(feature = "compression")))]
pub mod dispatch;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use error::{CloseCode, Error, Result};
pub use extension::{Extension, Extensions};
pub use frame::Frame;
pub use pool::BufferPool;
pub use protocol::Opcode;
pub use receiver::{FrameHandler, FrameReceiver, ReceiverEvent};
pub use sender::{Completion, FrameSender, SendOptions};
pub use transport::{IoSink, TransportSink};
