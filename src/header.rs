//! Container header wire record: magic, metadata map, sync marker.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::tap::Tap;

/// First four bytes of every container file.
pub const MAGIC: [u8; 4] = *b"Obj\x01";

/// Length of the per-file sync marker.
pub const SYNC_SIZE: usize = 16;

/// Metadata key holding the writer schema text.
pub const SCHEMA_KEY: &str = "avro.schema";

/// Metadata key naming the block compression codec.
pub const CODEC_KEY: &str = "avro.codec";

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("invalid magic bytes")]
    InvalidMagic,
}

/// The decoded (or to-be-encoded) container header.
///
/// Metadata is kept sorted so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub meta: BTreeMap<String, Vec<u8>>,
    pub sync: [u8; SYNC_SIZE],
}

impl Header {
    pub fn new(schema_json: &str, codec: &str, sync: [u8; SYNC_SIZE]) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(SCHEMA_KEY.to_string(), schema_json.as_bytes().to_vec());
        meta.insert(CODEC_KEY.to_string(), codec.as_bytes().to_vec());
        Self { meta, sync }
    }

    /// Codec name from metadata, defaulting to `"null"` when absent.
    pub fn codec_name(&self) -> String {
        self.meta
            .get(CODEC_KEY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_else(|| "null".to_string())
    }

    pub fn schema_json(&self) -> Option<&[u8]> {
        self.meta.get(SCHEMA_KEY).map(Vec::as_slice)
    }

    pub fn write(&self, tap: &mut Tap) {
        tap.write_fixed(&MAGIC);
        if !self.meta.is_empty() {
            tap.write_long(self.meta.len() as i64);
            for (key, value) in &self.meta {
                tap.write_string(key);
                tap.write_bytes(value);
            }
        }
        tap.write_long(0);
        tap.write_fixed(&self.sync);
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let meta_bound: usize = self
            .meta
            .iter()
            .map(|(k, v)| 20 + k.len() + v.len())
            .sum();
        let mut tap = Tap::with_capacity(MAGIC.len() + SYNC_SIZE + meta_bound + 20);
        self.write(&mut tap);
        tap.into_written()
    }

    /// Speculatively decode a header from `tap`.
    ///
    /// Returns `Ok(None)` on underflow with the position rolled back, so the
    /// caller can retry once more bytes arrive.  The magic is checked as
    /// soon as four bytes are available, before the metadata map is touched.
    pub fn try_read(tap: &mut Tap) -> Result<Option<Self>, HeaderError> {
        let start = tap.pos();

        let magic = tap.read_fixed(MAGIC.len());
        if !tap.is_valid() {
            tap.set_pos(start);
            return Ok(None);
        }
        if magic != MAGIC {
            tap.set_pos(start);
            return Err(HeaderError::InvalidMagic);
        }

        let mut meta = BTreeMap::new();
        loop {
            let mut n = tap.read_long();
            if !tap.is_valid() {
                tap.set_pos(start);
                return Ok(None);
            }
            if n == 0 {
                break;
            }
            if n < 0 {
                // Negative map block count: followed by the block byte size.
                n = n.wrapping_neg();
                let _ = tap.read_long();
            }
            for _ in 0..n {
                let key = tap.read_string();
                let value = tap.read_bytes();
                if !tap.is_valid() {
                    tap.set_pos(start);
                    return Ok(None);
                }
                meta.insert(key, value);
            }
        }

        let sync = tap.read_fixed(SYNC_SIZE);
        if !tap.is_valid() {
            tap.set_pos(start);
            return Ok(None);
        }
        let sync: [u8; SYNC_SIZE] = match sync.try_into() {
            Ok(s) => s,
            Err(_) => {
                tap.set_pos(start);
                return Ok(None);
            }
        };

        Ok(Some(Self { meta, sync }))
    }
}
