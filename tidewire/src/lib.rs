//! # Tidewire
//!
//! Streaming WebSocket frame engine for tokio applications.
//!
//! Tidewire takes over once the HTTP upgrade is done: a [`FrameReceiver`]
//! turns raw bytes into messages and a [`FrameSender`] turns messages into
//! frames. Both sides share the negotiated [`Extensions`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidewire::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (read_half, write_half) = tokio::io::duplex(64 * 1024);
//!
//!     let mut receiver = FrameReceiver::new(Vec::<ReceiverEvent>::new());
//!     let mut sender = FrameSender::new(IoSink::new(write_half));
//!
//!     sender.send("hello", SendOptions::text().mask(true));
//!     sender.flush().await?;
//!     drop(sender);
//!
//!     pump(read_half, &mut receiver).await?;
//!     for event in receiver.handler() {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/tidewire/")]

// Re-export core components
pub use tidewire_core::*;

pub mod logging;

/// Prelude module with common imports
pub mod prelude {
    pub use tidewire_core::prelude::*;

    pub use crate::logging::init_logging;
}
