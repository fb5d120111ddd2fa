//! permessage-deflate codecs
//!
//! Raw deflate (no zlib header) flushed with `Z_SYNC_FLUSH` after every
//! fragment. The empty stored block `00 00 ff ff` that ends each sync flush
//! is dropped from the last fragment of a message when compressing and put
//! back before the last fragment is inflated.

use crate::config::DeflateConfig;
use crate::error::{ConfigError, ExtensionError};
use crate::extension::{Codec, CodecResult, Extension};
use crate::protocol::extensions::PERMESSAGE_DEFLATE;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Trailer of a sync flush
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const MIN_OUTPUT_CHUNK: usize = 64;

/// Which end of the connection a codec pair serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted connection
    Server,
    /// Initiated connection
    Client,
}

/// Compressing half of permessage-deflate
#[derive(Debug)]
pub struct Deflater {
    inner: Option<Compress>,
    no_context_takeover: bool,
}

impl Deflater {
    /// Create a raw deflate compressor with a `window_bits` window (9-15)
    pub fn new(level: u32, window_bits: u8, no_context_takeover: bool) -> Self {
        Self {
            inner: Some(Compress::new_with_window_bits(Compression::new(level), false, window_bits)),
            no_context_takeover,
        }
    }

    fn sync_flush(compress: &mut Compress, out: &mut Vec<u8>) -> Result<(), ExtensionError> {
        // The flush is complete once deflate returns with output space to spare.
        loop {
            out.reserve(MIN_OUTPUT_CHUNK);
            compress
                .compress_vec(&[], out, FlushCompress::Sync)
                .map_err(|e| ExtensionError::Compress(e.to_string()))?;
            if out.len() < out.capacity() {
                return Ok(());
            }
        }
    }
}

impl Codec for Deflater {
    fn process(&mut self, input: &[u8], fin: bool) -> CodecResult {
        let compress = self
            .inner
            .as_mut()
            .ok_or_else(|| ExtensionError::Compress("compressor closed".into()))?;

        let mut out = Vec::with_capacity(input.len() / 2 + MIN_OUTPUT_CHUNK);
        let start = compress.total_in();
        loop {
            let consumed = (compress.total_in() - start) as usize;
            if consumed >= input.len() {
                break;
            }
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MIN_OUTPUT_CHUNK));
            }
            compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::None)
                .map_err(|e| ExtensionError::Compress(e.to_string()))?;
        }
        Self::sync_flush(compress, &mut out)?;

        if fin {
            if out.ends_with(&DEFLATE_TRAILER) {
                out.truncate(out.len() - DEFLATE_TRAILER.len());
            }
            // Nothing left to flush: send the header of an empty stored
            // block so the re-appended trailer still decodes.
            if out.is_empty() {
                out.push(0x00);
            }
            if self.no_context_takeover {
                compress.reset();
            }
        }
        Ok(Bytes::from(out))
    }

    fn flush(&mut self) -> CodecResult {
        let compress = self
            .inner
            .as_mut()
            .ok_or_else(|| ExtensionError::Compress("compressor closed".into()))?;
        let mut out = Vec::new();
        Self::sync_flush(compress, &mut out)?;
        Ok(Bytes::from(out))
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

/// Decompressing half of permessage-deflate
#[derive(Debug)]
pub struct Inflater {
    inner: Option<Decompress>,
    no_context_takeover: bool,
    max_size: usize,
    /// Inflated bytes of the current message
    message_len: usize,
}

impl Inflater {
    /// Create a raw deflate decompressor; `max_size` of 0 means unlimited
    pub fn new(no_context_takeover: bool, max_size: usize) -> Self {
        Self {
            inner: Some(Decompress::new(false)),
            no_context_takeover,
            max_size,
            message_len: 0,
        }
    }
}

impl Codec for Inflater {
    fn process(&mut self, input: &[u8], fin: bool) -> CodecResult {
        let decompress = self
            .inner
            .as_mut()
            .ok_or_else(|| ExtensionError::Decompress("decompressor closed".into()))?;

        let mut data = input.to_vec();
        if fin {
            data.extend_from_slice(&DEFLATE_TRAILER);
        }

        let mut out = Vec::with_capacity(data.len() * 2 + MIN_OUTPUT_CHUNK);
        let start = decompress.total_in();
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MIN_OUTPUT_CHUNK));
            }
            let consumed = (decompress.total_in() - start) as usize;
            let produced = decompress.total_out();
            let status = decompress
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| ExtensionError::Decompress(e.to_string()))?;

            let size = self.message_len + out.len();
            if self.max_size > 0 && size > self.max_size {
                self.message_len = 0;
                return Err(ExtensionError::TooLarge {
                    size,
                    max: self.max_size,
                });
            }

            let now_consumed = (decompress.total_in() - start) as usize;
            let stalled = now_consumed == consumed && decompress.total_out() == produced;
            if status == Status::StreamEnd
                || (now_consumed == data.len() && out.len() < out.capacity())
                || (stalled && out.len() < out.capacity())
            {
                break;
            }
        }

        if fin {
            self.message_len = 0;
            if self.no_context_takeover {
                decompress.reset(false);
            }
        } else {
            self.message_len += out.len();
        }
        Ok(Bytes::from(out))
    }

    fn flush(&mut self) -> CodecResult {
        if self.inner.is_none() {
            return Err(ExtensionError::Decompress("decompressor closed".into()));
        }
        Ok(Bytes::new())
    }

    fn close(&mut self) {
        self.inner = None;
        self.message_len = 0;
    }
}

/// In-process permessage-deflate extension
#[derive(Debug)]
pub struct PerMessageDeflate {
    deflater: Deflater,
    inflater: Inflater,
}

impl PerMessageDeflate {
    /// Build the codec pair for one side of a connection
    pub fn new(config: &DeflateConfig, role: Role) -> Result<Self, ConfigError> {
        config.validate()?;
        let (ours, theirs) = takeover_flags(config, role);
        Ok(Self {
            deflater: Deflater::new(config.level, config.window_bits, ours),
            inflater: Inflater::new(theirs, config.max_inflated_size),
        })
    }
}

/// `(own compressor resets, peer compressor resets)` per message
pub(crate) fn takeover_flags(config: &DeflateConfig, role: Role) -> (bool, bool) {
    match role {
        Role::Server => (config.server_no_context_takeover, config.client_no_context_takeover),
        Role::Client => (config.client_no_context_takeover, config.server_no_context_takeover),
    }
}

#[async_trait]
impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    async fn compress(&mut self, data: Bytes, fin: bool) -> CodecResult {
        self.deflater.process(&data, fin)
    }

    async fn decompress(&mut self, data: Bytes, fin: bool) -> CodecResult {
        self.inflater.process(&data, fin)
    }

    async fn close(&mut self) {
        self.deflater.close();
        self.inflater.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(deflater: &mut Deflater, inflater: &mut Inflater, fragments: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let fin = i + 1 == fragments.len();
            let compressed = deflater.process(fragment, fin).unwrap();
            out.extend_from_slice(&inflater.process(&compressed, fin).unwrap());
        }
        out
    }

    #[test]
    fn test_trailer_stripped_on_fin() {
        let mut deflater = Deflater::new(6, 15, false);
        let partial = deflater.process(b"hello", false).unwrap();
        assert!(partial.ends_with(&DEFLATE_TRAILER));
        let last = deflater.process(b" world", true).unwrap();
        assert!(!last.ends_with(&DEFLATE_TRAILER));
    }

    #[test]
    fn test_rfc_7692_sample() {
        // RFC 7692 section 7.2.3.1: "Hello" as one compressed message
        let mut inflater = Inflater::new(false, 0);
        let out = inflater
            .process(&[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00], true)
            .unwrap();
        assert_eq!(&out[..], b"Hello");
    }

    #[test]
    fn test_context_takeover_across_messages() {
        let mut deflater = Deflater::new(6, 15, false);
        let mut inflater = Inflater::new(false, 0);
        let message = b"a fairly repetitive message, a fairly repetitive message";
        let first = deflater.process(message, true).unwrap();
        let second = deflater.process(message, true).unwrap();
        assert!(second.len() < first.len());

        assert_eq!(&inflater.process(&first, true).unwrap()[..], &message[..]);
        assert_eq!(&inflater.process(&second, true).unwrap()[..], &message[..]);
    }

    #[test]
    fn test_no_context_takeover_messages_decode_independently() {
        let mut deflater = Deflater::new(6, 15, true);
        let message = b"independent message";
        let _ = deflater.process(message, true).unwrap();
        let second = deflater.process(message, true).unwrap();

        let mut fresh = Inflater::new(false, 0);
        assert_eq!(&fresh.process(&second, true).unwrap()[..], &message[..]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut inflater = Inflater::new(false, 0);
        let err = inflater.process(&[0xff, 0xff, 0xff, 0xff, 0xff], true).unwrap_err();
        assert!(matches!(err, ExtensionError::Decompress(_)));
    }

    #[test]
    fn test_max_inflated_size() {
        let mut deflater = Deflater::new(9, 15, false);
        let compressed = deflater.process(&vec![0u8; 10_000], true).unwrap();
        let mut inflater = Inflater::new(false, 4096);
        assert!(matches!(
            inflater.process(&compressed, true),
            Err(ExtensionError::TooLarge { max: 4096, .. })
        ));
    }

    #[test]
    fn test_closed_codecs_fail() {
        let mut deflater = Deflater::new(6, 15, false);
        deflater.close();
        assert!(deflater.process(b"x", true).is_err());

        let mut inflater = Inflater::new(false, 0);
        inflater.close();
        assert!(inflater.flush().is_err());
    }

    #[test]
    fn test_takeover_flags_follow_role() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            ..DeflateConfig::default()
        };
        assert_eq!(takeover_flags(&config, Role::Server), (true, false));
        assert_eq!(takeover_flags(&config, Role::Client), (false, true));
    }

    #[tokio::test]
    async fn test_extension_roundtrip() {
        let config = DeflateConfig::default();
        let mut server = PerMessageDeflate::new(&config, Role::Server).unwrap();
        let mut client = PerMessageDeflate::new(&config, Role::Client).unwrap();

        let wire = server.compress(Bytes::from_static(b"over the wire"), true).await.unwrap();
        let plain = client.decompress(wire, true).await.unwrap();
        assert_eq!(&plain[..], b"over the wire");
    }

    #[test]
    fn test_rejects_unsupported_window() {
        let config = DeflateConfig::default().window_bits(8);
        assert!(PerMessageDeflate::new(&config, Role::Client).is_err());
    }

    #[tokio::test]
    async fn test_small_window_roundtrip() {
        let config = DeflateConfig::default().window_bits(10);
        let mut server = PerMessageDeflate::new(&config, Role::Server).unwrap();
        let mut client = PerMessageDeflate::new(&config, Role::Client).unwrap();

        // Repeats sit further apart than a 10-bit window reaches.
        let block: Vec<u8> = (0..4000u32).map(|i| (i * 31 % 251) as u8).collect();
        let message = [block.clone(), block].concat();
        for _ in 0..2 {
            let wire = server.compress(Bytes::from(message.clone()), true).await.unwrap();
            let plain = client.decompress(wire, true).await.unwrap();
            assert_eq!(&plain[..], &message[..]);
        }
    }

    proptest! {
        #[test]
        fn prop_fragmented_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
        ) {
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(data.len() + 1)).collect();
            points.sort_unstable();
            let mut fragments: Vec<&[u8]> = Vec::new();
            let mut last = 0;
            for point in points {
                fragments.push(&data[last..point]);
                last = point;
            }
            fragments.push(&data[last..]);

            let mut deflater = Deflater::new(6, 15, false);
            let mut inflater = Inflater::new(false, 0);
            prop_assert_eq!(roundtrip(&mut deflater, &mut inflater, &fragments), data.clone());
            prop_assert_eq!(roundtrip(&mut deflater, &mut inflater, &[&data[..]]), data);
        }
    }
}
