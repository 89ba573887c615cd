//! Streaming state machines — the four duplex record/byte streams.
//!
//! # Surface
//! Every stream exposes the same three-operation surface:
//!
//! - `write(unit, done)` accepts one unit (a value or a byte chunk) and a
//!   completion callback.  The callback is the backpressure mechanism: it
//!   is withheld until the stream has capacity for more input, and a
//!   producer must not write again before it fires.
//! - `read()` returns the next output unit, [`ReadOutcome::Pending`] when
//!   nothing is ready yet, or [`ReadOutcome::End`] once the stream has
//!   terminated.
//! - `finish()` marks the end of input.
//!
//! # Backpressure
//! [`RawDecoder`] holds at most one pending write callback and fires it
//! only from a read that ran out of bytes.  [`BlockEncoder`] attaches the
//! callback of a flush-triggering write to the block it produced and fires
//! it when that block is emitted.  [`BlockDecoder`] counts the blocks of
//! each incoming chunk and fires the chunk's callback only once every one
//! of them has been decompressed and consumed.  Withholding these
//! callbacks is sufficient to bound memory for arbitrarily long streams.
//!
//! # Errors
//! Fatal errors (bad magic, unknown codec, schema parse failure, sync
//! mismatch, codec failure) surface exactly once as an `Err`; afterwards
//! the stream is terminated and reads yield `End`.  A value that does not
//! match the encoder schema surfaces as an `Err` but leaves the stream
//! usable.  A stream truncated mid-record ends silently.

use std::cell::Cell;
use std::rc::Rc;

use thiserror::Error;

use crate::codec::{CodecError, CodecRegistry};
use crate::header::{Header, HeaderError, SYNC_SIZE};
use crate::schema::{SchemaError, Type, Value, ValueCodec, ValueError};
use crate::tap::{Tap, DEFAULT_BATCH_SIZE};

pub mod block;
pub mod raw;

pub use block::{BlockDecoder, BlockEncoder};
pub use raw::{RawDecoder, RawEncoder};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("unknown codec: {0}")]
    UnknownCodec(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid sync marker")]
    InvalidSync,
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("{name} codec error: {source}")]
    Codec {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("previous write still pending")]
    WritePending,
}

/// Completion callback handed to `write`; fired when the stream is ready
/// for more input.  It must not re-enter the stream synchronously.
pub type WriteDone = Box<dyn FnOnce()>;

/// Result of polling a stream for output.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome<T> {
    /// The next unit, in strict producer order.
    Item(T),
    /// Nothing ready yet — feed more input or fire a deferred codec
    /// completion, then poll again.
    Pending,
    /// The stream has terminated; no further units will appear.
    End,
}

/// One decoded unit: the deserialized value, or (with `decode = false`)
/// the raw encoded bytes of exactly one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<V> {
    Value(V),
    Raw(Vec<u8>),
}

/// Reads one record from a tap, either decoding it or passing its encoded
/// bytes through unchanged.
pub(crate) enum RecordReader<C> {
    Decode(C),
    Skip(C),
}

impl<C: ValueCodec> RecordReader<C> {
    pub(crate) fn read(&self, tap: &mut Tap) -> Decoded<C::Value> {
        match self {
            RecordReader::Decode(ty) => Decoded::Value(ty.read(tap)),
            RecordReader::Skip(ty) => {
                let start = tap.pos();
                ty.skip(tap);
                if tap.is_valid() {
                    Decoded::Raw(tap.buf()[start..tap.pos()].to_vec())
                } else {
                    Decoded::Raw(Vec::new())
                }
            }
        }
    }
}

/// What the decoder learned from the container header.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub codec: String,
    pub schema_json: Vec<u8>,
    pub header: Header,
}

/// Configuration for [`BlockEncoder`].
pub struct EncoderOptions {
    /// Scratch buffer size; blocks are flushed when a record overflows it.
    pub block_size: usize,
    /// Name of the compression codec, resolved against `codecs`.
    pub codec: String,
    pub codecs: CodecRegistry,
    /// Skip header emission — append mode.  Pass the original file's
    /// `sync_marker` alongside.
    pub omit_header: bool,
    /// Explicit sync marker; a fresh unique one is generated when absent.
    pub sync_marker: Option<[u8; SYNC_SIZE]>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BATCH_SIZE,
            codec: "null".to_string(),
            codecs: CodecRegistry::standard(),
            omit_header: false,
            sync_marker: None,
        }
    }
}

impl EncoderOptions {
    pub fn with_codec(name: &str) -> Self {
        Self { codec: name.to_string(), ..Self::default() }
    }
}

/// Configuration for [`BlockDecoder`].
pub struct DecoderOptions {
    /// When false, records are passed through as raw encoded bytes.
    pub decode: bool,
    pub codecs: CodecRegistry,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self { decode: true, codecs: CodecRegistry::standard() }
    }
}

// ── One-shot drivers ─────────────────────────────────────────────────────────

/// Encode `values` into a complete container file in memory.
///
/// Drives a [`BlockEncoder`] to completion; requires the configured codec
/// to complete synchronously (every codec in the standard registry does).
pub fn write_container(
    ty: Type,
    values: &[Value],
    opts: EncoderOptions,
) -> Result<Vec<u8>, StreamError> {
    let mut encoder = BlockEncoder::for_type(ty, opts);
    let mut out = Vec::new();

    for value in values {
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        encoder.write(value, Box::new(move || flag.set(true)))?;
        while !done.get() {
            match encoder.read()? {
                ReadOutcome::Item(chunk) => out.extend_from_slice(&chunk),
                ReadOutcome::Pending | ReadOutcome::End => break,
            }
        }
    }

    encoder.finish();
    loop {
        match encoder.read()? {
            ReadOutcome::Item(chunk) => out.extend_from_slice(&chunk),
            ReadOutcome::Pending | ReadOutcome::End => break,
        }
    }
    Ok(out)
}

/// Everything recovered from one container file.
pub struct DecodedContainer {
    /// Absent when the input ended before a complete header.
    pub metadata: Option<Metadata>,
    pub records: Vec<Decoded<Value>>,
}

/// Decode a complete in-memory container file.
///
/// Drives a [`BlockDecoder`] to completion; requires the codecs involved
/// to complete synchronously.
pub fn read_container(
    bytes: &[u8],
    opts: DecoderOptions,
) -> Result<DecodedContainer, StreamError> {
    let mut decoder = BlockDecoder::new(opts);
    decoder.write(bytes, Box::new(|| {}))?;
    decoder.finish();

    let mut records = Vec::new();
    loop {
        match decoder.read()? {
            ReadOutcome::Item(record) => records.push(record),
            ReadOutcome::Pending | ReadOutcome::End => break,
        }
    }
    Ok(DecodedContainer { metadata: decoder.metadata().cloned(), records })
}
