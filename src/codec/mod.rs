use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
}

pub type CodecResult = Result<Vec<u8>, CodecError>;

/// Completion callback for a single byte-to-byte transform.  A codec may
/// invoke it before returning (synchronous) or hold it and fire it on a
/// later turn; both must be tolerated by every caller.
pub type Completion = Box<dyn FnOnce(CodecResult)>;

/// A named byte-to-byte transform pair.
pub trait Codec {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8], done: Completion);
    fn decompress(&self, data: &[u8], done: Completion);
}

/// Identity transform, the `"null"` codec.
pub struct NullCodec;

impl Codec for NullCodec {
    fn name(&self) -> &'static str {
        "null"
    }

    fn compress(&self, data: &[u8], done: Completion) {
        done(Ok(data.to_vec()));
    }

    fn decompress(&self, data: &[u8], done: Completion) {
        done(Ok(data.to_vec()));
    }
}

/// Raw deflate (RFC 1951, no zlib wrapper), the `"deflate"` codec.
pub struct DeflateCodec {
    level: Compression,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self { level: Compression::new(level.min(9)) }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self { level: Compression::default() }
    }
}

impl Codec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8], done: Completion) {
        let mut enc = DeflateEncoder::new(Vec::new(), self.level);
        let result = enc
            .write_all(data)
            .and_then(|_| enc.finish())
            .map_err(|e| CodecError::Compression(e.to_string()));
        done(result);
    }

    fn decompress(&self, data: &[u8], done: Completion) {
        let mut out = Vec::new();
        let result = DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map(|_| out)
            .map_err(|e| CodecError::Decompression(e.to_string()));
        done(result);
    }
}

/// Zstandard, registrable under the Avro 1.9+ name `"zstandard"`.  Not part
/// of the default registry.
pub struct ZstandardCodec {
    level: i32,
}

impl ZstandardCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstandardCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstandardCodec {
    fn name(&self) -> &'static str {
        "zstandard"
    }

    fn compress(&self, data: &[u8], done: Completion) {
        done(zstd::encode_all(data, self.level).map_err(|e| CodecError::Compression(e.to_string())));
    }

    fn decompress(&self, data: &[u8], done: Completion) {
        done(zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string())));
    }
}

/// Name-keyed codec registry.  Read-only shared configuration once a
/// stream has been built on it.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    entries: HashMap<String, Rc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry with no entries at all.
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    /// The default registry: `"null"` and `"deflate"`.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Rc::new(NullCodec));
        registry.register(Rc::new(DeflateCodec::default()));
        registry
    }

    pub fn register(&mut self, codec: Rc<dyn Codec>) {
        self.entries.insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Codec>> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn run<F: FnOnce(Completion)>(f: F) -> CodecResult {
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        f(Box::new(move |r| *out.borrow_mut() = Some(r)));
        let result = slot.borrow_mut().take();
        result.expect("codec completed synchronously")
    }

    #[test]
    fn test_null_is_identity() {
        let data = b"identity payload".to_vec();
        assert_eq!(run(|d| NullCodec.compress(&data, d)).unwrap(), data);
        assert_eq!(run(|d| NullCodec.decompress(&data, d)).unwrap(), data);
    }

    #[test]
    fn test_deflate_roundtrip() {
        let data = vec![7u8; 4096];
        let codec = DeflateCodec::default();
        let packed = run(|d| codec.compress(&data, d)).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = run(|d| codec.decompress(&packed, d)).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_deflate_rejects_garbage() {
        let codec = DeflateCodec::default();
        let result = run(|d| codec.decompress(&[0xFF, 0xFE, 0xFD, 0x00, 0x01], d));
        assert!(result.is_err());
    }

    #[test]
    fn test_zstandard_roundtrip() {
        let data = b"zstandard zstandard zstandard".repeat(64);
        let codec = ZstandardCodec::default();
        let packed = run(|d| codec.compress(&data, d)).unwrap();
        let unpacked = run(|d| codec.decompress(&packed, d)).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_standard_registry_contents() {
        let registry = CodecRegistry::standard();
        assert!(registry.get("null").is_some());
        assert!(registry.get("deflate").is_some());
        assert!(registry.get("zstandard").is_none());
        assert!(registry.get("snappy").is_none());
    }

    #[test]
    fn test_register_extra_codec() {
        let mut registry = CodecRegistry::standard();
        registry.register(Rc::new(ZstandardCodec::default()));
        assert!(registry.get("zstandard").is_some());
    }
}
