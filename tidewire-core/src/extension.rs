//! Negotiated payload extensions
//!
//! The engine never talks to a compression library directly. It holds an
//! [`Extensions`] registry keyed by the negotiated extension name and calls
//! the [`Extension`] capability found there; whether the codec runs inline or
//! on another task is up to the implementation.

use crate::error::ExtensionError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a codec call
pub type CodecResult = std::result::Result<Bytes, ExtensionError>;

/// Payload transform applied per message, e.g. permessage-deflate
#[async_trait]
pub trait Extension: Send {
    /// Registered extension name
    fn name(&self) -> &str;

    /// Transform an outgoing fragment; `fin` marks the last fragment of the message
    async fn compress(&mut self, data: Bytes, fin: bool) -> CodecResult;

    /// Reverse the transform for an incoming fragment
    async fn decompress(&mut self, data: Bytes, fin: bool) -> CodecResult;

    /// Release codec resources
    async fn close(&mut self) {}
}

/// One direction of a codec: the shape shared by compressors and decompressors
pub trait Codec: Send {
    /// Feed `input`; `fin` ends the current message
    fn process(&mut self, input: &[u8], fin: bool) -> CodecResult;

    /// Drain any output the codec is still holding
    fn flush(&mut self) -> CodecResult;

    /// Drop internal state; later calls fail or start fresh depending on the codec
    fn close(&mut self);
}

/// Shared handle to a negotiated extension
pub type SharedExtension = Arc<Mutex<Box<dyn Extension>>>;

/// Negotiated extensions of one connection, keyed by name
///
/// Cloning is cheap; the receiver and sender of a connection share the same
/// extension instances.
#[derive(Clone, Default)]
pub struct Extensions {
    entries: HashMap<String, SharedExtension>,
}

impl Extensions {
    /// Empty registry: nothing negotiated
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension under its own name
    pub fn insert(&mut self, extension: impl Extension + 'static) -> SharedExtension {
        let name = extension.name().to_string();
        let shared: SharedExtension = Arc::new(Mutex::new(Box::new(extension)));
        self.entries.insert(name, Arc::clone(&shared));
        shared
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.insert(extension);
        self
    }

    /// Look up a negotiated extension
    pub fn get(&self, name: &str) -> Option<&SharedExtension> {
        self.entries.get(name)
    }

    /// Check whether an extension was negotiated
    pub fn is_negotiated(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of negotiated extensions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was negotiated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every extension and empty the registry
    pub async fn close_all(&mut self) {
        for (_, extension) in self.entries.drain() {
            extension.lock().await.close().await;
        }
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Extensions used by tests across the crate

    use super::*;
    use crate::protocol::extensions::PERMESSAGE_DEFLATE;

    /// Reverses bytes on compress and decompress; yields to the runtime first
    #[derive(Debug, Default)]
    pub struct ReverseExtension {
        pub calls: Vec<(usize, bool)>,
    }

    #[async_trait]
    impl Extension for ReverseExtension {
        fn name(&self) -> &str {
            PERMESSAGE_DEFLATE
        }

        async fn compress(&mut self, data: Bytes, fin: bool) -> CodecResult {
            tokio::task::yield_now().await;
            self.calls.push((data.len(), fin));
            Ok(data.iter().rev().copied().collect::<Vec<u8>>().into())
        }

        async fn decompress(&mut self, data: Bytes, fin: bool) -> CodecResult {
            tokio::task::yield_now().await;
            self.calls.push((data.len(), fin));
            Ok(data.iter().rev().copied().collect::<Vec<u8>>().into())
        }
    }

    /// Fails every call
    #[derive(Debug, Default)]
    pub struct BrokenExtension;

    #[async_trait]
    impl Extension for BrokenExtension {
        fn name(&self) -> &str {
            PERMESSAGE_DEFLATE
        }

        async fn compress(&mut self, _data: Bytes, _fin: bool) -> CodecResult {
            Err(ExtensionError::Compress("broken".into()))
        }

        async fn decompress(&mut self, _data: Bytes, _fin: bool) -> CodecResult {
            Err(ExtensionError::Decompress("broken".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ReverseExtension;
    use super::*;
    use crate::protocol::extensions::PERMESSAGE_DEFLATE;

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut extensions = Extensions::new();
        assert!(extensions.is_empty());
        assert!(!extensions.is_negotiated(PERMESSAGE_DEFLATE));

        extensions.insert(ReverseExtension::default());
        assert!(extensions.is_negotiated(PERMESSAGE_DEFLATE));
        assert_eq!(extensions.len(), 1);

        let shared = extensions.get(PERMESSAGE_DEFLATE).unwrap();
        let out = shared
            .lock()
            .await
            .compress(Bytes::from_static(b"abc"), true)
            .await
            .unwrap();
        assert_eq!(&out[..], b"cba");
    }

    #[tokio::test]
    async fn test_clones_share_instances() {
        let extensions = Extensions::new().with(ReverseExtension::default());
        let other = extensions.clone();

        let a = extensions.get(PERMESSAGE_DEFLATE).unwrap();
        let b = other.get(PERMESSAGE_DEFLATE).unwrap();
        assert!(Arc::ptr_eq(a, b));
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let mut extensions = Extensions::new().with(ReverseExtension::default());
        extensions.close_all().await;
        assert!(extensions.is_empty());
    }
}
