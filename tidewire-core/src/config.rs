//! Engine configuration
//!
//! Plain configuration structs with builder-style setters. Each one can be
//! checked with `validate()` before the engine is constructed.

use crate::error::ConfigError;
use crate::protocol::constants::{DEFAULT_MERGE_THRESHOLD, DEFAULT_POOL_SIZE};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for a [`FrameReceiver`](crate::receiver::FrameReceiver)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReceiverConfig {
    /// Upper bound on the cumulative length of one message, 0 for unlimited
    ///
    /// Unlimited means a peer may announce messages of up to 4 GiB. Payloads
    /// over 1 MiB are buffered as their bytes arrive, so memory follows what
    /// the peer actually sends, but nothing stops it from sending that much.
    pub max_payload: usize,
    /// Initial size of the pool used for fragmented messages
    pub fragmented_pool_size: usize,
    /// Initial size of the pool used for single-frame messages
    pub unfragmented_pool_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_payload: 0,
            fragmented_pool_size: DEFAULT_POOL_SIZE,
            unfragmented_pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl ReceiverConfig {
    /// Set the maximum message payload
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set both initial pool sizes
    pub fn pool_size(mut self, size: usize) -> Self {
        self.fragmented_pool_size = size;
        self.unfragmented_pool_size = size;
        self
    }

    /// Check the configuration for values the receiver cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload > 0 && self.max_payload > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "max_payload".to_string(),
                value: self.max_payload.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a [`FrameSender`](crate::sender::FrameSender)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SenderConfig {
    /// Payloads smaller than this are copied next to their header and written once
    pub merge_threshold: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
        }
    }
}

impl SenderConfig {
    /// Set the merge threshold
    pub fn merge_threshold(mut self, merge_threshold: usize) -> Self {
        self.merge_threshold = merge_threshold;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Configuration for the permessage-deflate codecs
#[cfg(feature = "compression")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeflateConfig {
    /// Compression level, 0-9
    pub level: u32,
    /// LZ77 window of our compressor as a power of two, 9-15
    ///
    /// Inflating always uses the full 15-bit window, which decodes streams
    /// built with any smaller one.
    pub window_bits: u8,
    /// Reset the server-to-client context after every message
    pub server_no_context_takeover: bool,
    /// Reset the client-to-server context after every message
    pub client_no_context_takeover: bool,
    /// Fail decompression once a message inflates past this size, 0 for unlimited
    pub max_inflated_size: usize,
}

#[cfg(feature = "compression")]
impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            level: 6,
            window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            max_inflated_size: 0,
        }
    }
}

#[cfg(feature = "compression")]
impl DeflateConfig {
    /// Set the compression level
    pub fn level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Set the window bits
    pub fn window_bits(mut self, window_bits: u8) -> Self {
        self.window_bits = window_bits;
        self
    }

    /// Disable context takeover in both directions
    pub fn no_context_takeover(mut self) -> Self {
        self.server_no_context_takeover = true;
        self.client_no_context_takeover = true;
        self
    }

    /// Bound the inflated size of one message
    pub fn max_inflated_size(mut self, max: usize) -> Self {
        self.max_inflated_size = max;
        self
    }

    /// Check the configuration against what the deflate backend supports
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level > 9 {
            return Err(invalid("level", self.level));
        }
        // zlib refuses an 8-bit window for raw deflate
        if !(9..=15).contains(&self.window_bits) {
            return Err(invalid("window_bits", self.window_bits));
        }
        Ok(())
    }
}

#[cfg(feature = "compression")]
fn invalid(field: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_config_default() {
        let config = ReceiverConfig::default();
        assert_eq!(config.max_payload, 0);
        assert_eq!(config.fragmented_pool_size, 1024);
        assert_eq!(config.unfragmented_pool_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_receiver_config_builder() {
        let config = ReceiverConfig::default().max_payload(4096).pool_size(64);
        assert_eq!(config.max_payload, 4096);
        assert_eq!(config.fragmented_pool_size, 64);
        assert_eq!(config.unfragmented_pool_size, 64);
    }

    #[test]
    fn test_sender_config_default() {
        assert_eq!(SenderConfig::default().merge_threshold, 32768);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_deflate_config_validation() {
        assert!(DeflateConfig::default().validate().is_ok());
        assert!(DeflateConfig::default().window_bits(8).validate().is_err());
        assert!(DeflateConfig::default().window_bits(16).validate().is_err());
        assert!(DeflateConfig::default().window_bits(9).validate().is_ok());
        assert!(DeflateConfig::default().window_bits(12).validate().is_ok());
        assert!(DeflateConfig::default().level(10).validate().is_err());
        assert!(DeflateConfig::default().level(0).no_context_takeover().validate().is_ok());
    }
}
