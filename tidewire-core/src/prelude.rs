//! Prelude module for Tidewire Core
//!
//! Re-exports the types a connection owner needs to wire up a receiver and
//! a sender.

pub use crate::config::{ReceiverConfig, SenderConfig};
pub use crate::error::{CloseCode, Error, ExtensionError, ProtocolError, Result};
pub use crate::extension::{Codec, Extension, Extensions};
pub use crate::frame::Frame;
pub use crate::protocol::Opcode;
pub use crate::receiver::{CloseMeta, ControlMeta, DataMeta, FrameHandler, FrameReceiver, ReceiverEvent};
pub use crate::sender::{Completion, ControlOptions, FrameSender, Payload, SendOptions};
pub use crate::transport::{pump, IoSink, TransportSink};

// Re-export commonly used external dependencies
pub use bytes::{Bytes, BytesMut};

// Feature-gated re-exports
#[cfg(feature = "compression")]
pub use crate::config::DeflateConfig;
#[cfg(feature = "compression")]
pub use crate::deflate::{PerMessageDeflate, Role};
#[cfg(feature = "compression")]
pub use crate::dispatch::{CodecDispatcher, DispatchedDeflate};

#[cfg(feature = "serde")]
pub use serde::{Deserialize, Serialize};
