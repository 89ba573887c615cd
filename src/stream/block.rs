//! Container streams — header emission, sync-delimited compressed blocks.
//!
//! # Writer
//! [`BlockEncoder`] batches records into a scratch tap; when a record
//! overflows it, the filled prefix is submitted to the compression codec
//! with a monotonically assigned index and the buffer is recycled.  Codec
//! completions may arrive out of order; emission goes through an
//! [`OrderedQueue`] so the output byte stream is bit-identical to what
//! synchronous compression would have produced.  Each emitted block is
//! `count`, `length`, the (compressed) payload, then the sync marker.
//!
//! # Reader
//! [`BlockDecoder`] accumulates bytes until a complete header can be
//! decoded (magic, metadata map, sync marker), resolves the codec and the
//! writer schema, then speculatively reads as many complete blocks per
//! incoming chunk as the buffer allows.  Every block is dispatched for
//! decompression under its own index; decoded blocks are consumed in
//! index order.  The chunk's write callback is released only after all of
//! the chunk's blocks have been decompressed and handed downstream, which
//! bounds outstanding work to one chunk's worth.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use uuid::Uuid;

use crate::codec::{Codec, CodecRegistry};
use crate::header::{Header, SYNC_SIZE};
use crate::queue::{BlockData, OrderedQueue};
use crate::schema::{PrimitiveLoader, SchemaError, SchemaLoader, Type, ValueCodec};
use crate::stream::{
    Decoded, DecoderOptions, EncoderOptions, Metadata, ReadOutcome, RecordReader, StreamError,
    WriteDone,
};
use crate::tap::{long_bytes, Tap};

// ── Block wire record ────────────────────────────────────────────────────────

struct WireBlock {
    count: i64,
    data: Vec<u8>,
    sync: [u8; SYNC_SIZE],
}

/// Speculatively read one block record; on underflow the position is
/// rolled back and `None` is returned.
fn try_read_block(tap: &mut Tap) -> Option<WireBlock> {
    let start = tap.pos();
    let count = tap.read_long();
    let data = tap.read_bytes();
    let sync = tap.read_fixed(SYNC_SIZE);
    if !tap.is_valid() {
        tap.set_pos(start);
        return None;
    }
    let sync: [u8; SYNC_SIZE] = sync.try_into().ok()?;
    Some(WireBlock { count, data, sync })
}

// ── Encoder ──────────────────────────────────────────────────────────────────

struct EncoderShared {
    queue: OrderedQueue,
    /// Compressions submitted but not yet completed.
    pending: usize,
    /// Next block submission index.
    index: u64,
    failed: Option<StreamError>,
}

/// Record → container bytes.
pub struct BlockEncoder<C: ValueCodec> {
    ty: C,
    schema_json: String,
    codec_name: String,
    registry: CodecRegistry,
    codec: Option<Rc<dyn Codec>>,
    omit_header: bool,
    sync_marker: [u8; SYNC_SIZE],
    tap: Tap,
    block_count: i64,
    ready: VecDeque<Vec<u8>>,
    shared: Rc<RefCell<EncoderShared>>,
    started: bool,
    finished: bool,
    dead: bool,
}

impl BlockEncoder<Type> {
    /// Encoder for a built-in primitive type; the schema text is derived
    /// from the type itself.
    pub fn for_type(ty: Type, opts: EncoderOptions) -> Self {
        let schema_json = ty.canonical_json();
        Self::new(ty, schema_json, opts)
    }
}

impl<C: ValueCodec> BlockEncoder<C> {
    pub fn new(ty: C, schema_json: impl Into<String>, opts: EncoderOptions) -> Self {
        let sync_marker = opts
            .sync_marker
            .unwrap_or_else(|| Uuid::new_v4().into_bytes());
        Self {
            ty,
            schema_json: schema_json.into(),
            codec_name: opts.codec,
            registry: opts.codecs,
            codec: None,
            omit_header: opts.omit_header,
            sync_marker,
            tap: Tap::with_capacity(opts.block_size.max(1)),
            block_count: 0,
            ready: VecDeque::new(),
            shared: Rc::new(RefCell::new(EncoderShared {
                queue: OrderedQueue::new(),
                pending: 0,
                index: 0,
                failed: None,
            })),
            started: false,
            finished: false,
            dead: false,
        }
    }

    /// The marker delimiting every block of this stream.  Pass it to a
    /// later `omit_header` encoder to append to this file.
    pub fn sync_marker(&self) -> [u8; SYNC_SIZE] {
        self.sync_marker
    }

    /// Accept one value.  `done` fires immediately unless the value
    /// triggered a block flush, in which case it travels with the block
    /// and fires when that block is emitted downstream.
    pub fn write(&mut self, value: &C::Value, done: WriteDone) -> Result<(), StreamError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        if self.dead {
            return Ok(());
        }
        if !self.started {
            self.start()?;
        }

        let start = self.tap.pos();
        if let Err(e) = self.ty.write(&mut self.tap, value) {
            self.tap.set_pos(start);
            done();
            return Err(e.into());
        }

        let mut done = Some(done);
        if !self.tap.is_valid() {
            let need = self.tap.pos() - start;
            if start > 0 {
                self.flush_chunk(start, done.take());
            }
            if need > self.tap.len() {
                self.tap.grow(need * 2);
            } else {
                self.tap.set_pos(0);
            }
            self.ty.write(&mut self.tap, value)?;
            debug_assert!(self.tap.is_valid(), "record exceeds reallocated buffer");
        }
        self.block_count += 1;
        if let Some(done) = done {
            done();
        }
        Ok(())
    }

    /// Mark end of input, flushing the final partial block.
    pub fn finish(&mut self) {
        if self.dead || self.finished {
            return;
        }
        if self.block_count > 0 {
            let len = self.tap.pos();
            self.flush_chunk(len, None);
        }
        self.finished = true;
    }

    pub fn read(&mut self) -> Result<ReadOutcome<Vec<u8>>, StreamError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        if self.dead {
            return Ok(ReadOutcome::End);
        }
        if let Some(chunk) = self.ready.pop_front() {
            return Ok(ReadOutcome::Item(chunk));
        }

        let popped = self.shared.borrow_mut().queue.pop();
        if let Some(mut data) = popped {
            self.ready.push_back(long_bytes(data.count));
            self.ready.push_back(long_bytes(data.buf.len() as i64));
            let buf = std::mem::take(&mut data.buf);
            self.ready.push_back(buf);
            self.ready.push_back(self.sync_marker.to_vec());
            if !self.finished {
                // Release the flush-triggering write; while finishing
                // there is nothing left upstream to unblock.
                data.release();
            }
            if let Some(chunk) = self.ready.pop_front() {
                return Ok(ReadOutcome::Item(chunk));
            }
        }

        let shared = self.shared.borrow();
        if self.finished && shared.pending == 0 && shared.queue.is_empty() {
            Ok(ReadOutcome::End)
        } else {
            Ok(ReadOutcome::Pending)
        }
    }

    /// Resolve the codec and emit the header.  Runs on the first value.
    fn start(&mut self) -> Result<(), StreamError> {
        let codec = match self.registry.get(&self.codec_name) {
            Some(codec) => codec,
            None => {
                self.dead = true;
                return Err(StreamError::UnknownCodec(self.codec_name.clone()));
            }
        };
        self.codec = Some(codec);
        if !self.omit_header {
            let header = Header::new(&self.schema_json, &self.codec_name, self.sync_marker);
            self.ready.push_back(header.to_bytes());
            tracing::debug!(codec = %self.codec_name, "container header emitted");
        }
        self.started = true;
        Ok(())
    }

    /// Submit `tap.buf[..len]` to the codec under a fresh index.
    fn flush_chunk(&mut self, len: usize, done: Option<WriteDone>) {
        let codec = match &self.codec {
            Some(codec) => Rc::clone(codec),
            None => return,
        };
        let data = self.tap.buf()[..len].to_vec();
        let count = self.block_count;
        self.block_count = 0;

        // Increment before invoking the codec: a synchronous completion
        // must already see itself counted.
        let index = {
            let mut shared = self.shared.borrow_mut();
            let index = shared.index;
            shared.index += 1;
            shared.pending += 1;
            index
        };
        tracing::trace!(index, bytes = data.len(), records = count, "block submitted");

        let shared = Rc::clone(&self.shared);
        let name = self.codec_name.clone();
        codec.compress(&data, Box::new(move |result| {
            let mut s = shared.borrow_mut();
            s.pending -= 1;
            match result {
                Ok(buf) => s.queue.push(BlockData::new(index, buf, count, done)),
                Err(source) => {
                    if s.failed.is_none() {
                        s.failed = Some(StreamError::Codec { name, source });
                    }
                }
            }
        }));
    }

    fn take_failure(&mut self) -> Option<StreamError> {
        let failed = self.shared.borrow_mut().failed.take();
        if failed.is_some() {
            self.dead = true;
        }
        failed
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

struct DecoderShared {
    queue: OrderedQueue,
    /// Decompressions dispatched but not yet completed.
    open: usize,
    /// Next block submission index.
    index: u64,
    failed: Option<StreamError>,
}

/// Counts down the obligations of one write chunk: one per dispatched
/// block plus one for the write path itself.  The chunk's write callback
/// fires when the count reaches zero.
struct ChunkGate {
    remaining: usize,
    done: Option<WriteDone>,
}

fn release_gate(gate: &Rc<RefCell<ChunkGate>>) {
    let done = {
        let mut g = gate.borrow_mut();
        g.remaining -= 1;
        if g.remaining == 0 {
            g.done.take()
        } else {
            None
        }
    };
    if let Some(done) = done {
        done();
    }
}

type DecodedItem<L> = Decoded<<<L as SchemaLoader>::Codec as ValueCodec>::Value>;

/// Container bytes → record.
pub struct BlockDecoder<L: SchemaLoader = PrimitiveLoader> {
    loader: L,
    registry: CodecRegistry,
    decode: bool,
    tap: Tap,
    block_tap: Tap,
    reader: Option<RecordReader<L::Codec>>,
    codec: Option<Rc<dyn Codec>>,
    codec_name: String,
    sync_marker: [u8; SYNC_SIZE],
    metadata: Option<Metadata>,
    metadata_listener: Option<Box<dyn FnOnce(&Metadata)>>,
    shared: Rc<RefCell<DecoderShared>>,
    header_done: bool,
    finished: bool,
    dead: bool,
}

impl BlockDecoder<PrimitiveLoader> {
    /// Decoder with the built-in primitive schema loader.
    pub fn new(opts: DecoderOptions) -> Self {
        Self::with_loader(PrimitiveLoader, opts)
    }
}

impl<L: SchemaLoader> BlockDecoder<L> {
    pub fn with_loader(loader: L, opts: DecoderOptions) -> Self {
        Self {
            loader,
            registry: opts.codecs,
            decode: opts.decode,
            tap: Tap::new(Vec::new()),
            block_tap: Tap::new(Vec::new()),
            reader: None,
            codec: None,
            codec_name: String::new(),
            sync_marker: [0; SYNC_SIZE],
            metadata: None,
            metadata_listener: None,
            shared: Rc::new(RefCell::new(DecoderShared {
                queue: OrderedQueue::new(),
                open: 0,
                index: 0,
                failed: None,
            })),
            header_done: false,
            finished: false,
            dead: false,
        }
    }

    /// Observation hook fired once, when the header has been decoded.
    pub fn on_metadata(&mut self, listener: impl FnOnce(&Metadata) + 'static) {
        self.metadata_listener = Some(Box::new(listener));
    }

    /// What the header said, once it has been decoded.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Accept one chunk of container bytes.
    ///
    /// During the header phase the callback fires immediately — the
    /// decoder always wants more bytes until the header is complete.
    /// Afterwards it fires once every block of this chunk has been
    /// decompressed and consumed downstream.
    pub fn write(&mut self, chunk: &[u8], done: WriteDone) -> Result<(), StreamError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        if self.dead {
            return Ok(());
        }
        self.tap.feed(chunk);

        if !self.header_done {
            match Header::try_read(&mut self.tap) {
                Ok(None) => {
                    done();
                    return Ok(());
                }
                Err(e) => {
                    self.dead = true;
                    return Err(e.into());
                }
                Ok(Some(header)) => {
                    if let Err(e) = self.accept_header(header) {
                        self.dead = true;
                        return Err(e);
                    }
                    // Residual bytes after the header flow straight into
                    // the block phase below.
                }
            }
        }

        let codec = match &self.codec {
            Some(codec) => Rc::clone(codec),
            None => return Ok(()),
        };
        let gate = Rc::new(RefCell::new(ChunkGate { remaining: 1, done: Some(done) }));

        while let Some(block) = try_read_block(&mut self.tap) {
            if block.sync != self.sync_marker {
                self.dead = true;
                return Err(StreamError::InvalidSync);
            }
            gate.borrow_mut().remaining += 1;

            // Count the dispatch before invoking the codec; a synchronous
            // completion must already see itself counted.
            let index = {
                let mut shared = self.shared.borrow_mut();
                let index = shared.index;
                shared.index += 1;
                shared.open += 1;
                index
            };
            tracing::trace!(index, bytes = block.data.len(), "block dispatched");

            let shared = Rc::clone(&self.shared);
            let block_gate = Rc::clone(&gate);
            let name = self.codec_name.clone();
            codec.decompress(&block.data, Box::new(move |result| {
                let mut s = shared.borrow_mut();
                s.open -= 1;
                match result {
                    Ok(buf) => {
                        let consumed_gate = Rc::clone(&block_gate);
                        s.queue.push(BlockData::new(
                            index,
                            buf,
                            block.count,
                            Some(Box::new(move || release_gate(&consumed_gate))),
                        ));
                    }
                    Err(source) => {
                        if s.failed.is_none() {
                            s.failed = Some(StreamError::Codec { name, source });
                        }
                        drop(s);
                        release_gate(&block_gate);
                    }
                }
            }));
        }

        // The write path's own decrement: a chunk with no complete block
        // releases its callback here and now.
        release_gate(&gate);
        Ok(())
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn read(&mut self) -> Result<ReadOutcome<DecodedItem<L>>, StreamError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        if self.dead {
            return Ok(ReadOutcome::End);
        }
        loop {
            if self.block_tap.remaining() > 0 {
                let reader = match &self.reader {
                    Some(reader) => reader,
                    None => return Ok(ReadOutcome::Pending),
                };
                let start = self.block_tap.pos();
                let item = reader.read(&mut self.block_tap);
                if self.block_tap.is_valid() {
                    return Ok(ReadOutcome::Item(item));
                }
                // A record running past the end of its block: corrupted
                // payload.  Same silent disposition as truncation.
                self.block_tap.set_pos(start);
                self.dead = true;
                return Ok(ReadOutcome::End);
            }

            let popped = self.shared.borrow_mut().queue.pop();
            match popped {
                Some(mut data) => {
                    // Consuming the block releases its share of the
                    // originating chunk's write callback.
                    data.release();
                    let buf = std::mem::take(&mut data.buf);
                    self.block_tap.reset(buf);
                }
                None => {
                    let shared = self.shared.borrow();
                    return if self.finished && shared.open == 0 && shared.queue.is_empty() {
                        Ok(ReadOutcome::End)
                    } else {
                        Ok(ReadOutcome::Pending)
                    };
                }
            }
        }
    }

    fn accept_header(&mut self, header: Header) -> Result<(), StreamError> {
        let name = header.codec_name();
        let codec = self
            .registry
            .get(&name)
            .ok_or_else(|| StreamError::UnknownCodec(name.clone()))?;
        let schema_json = header
            .schema_json()
            .ok_or_else(|| SchemaError::Invalid("missing avro.schema metadata entry".into()))?
            .to_vec();
        let ty = self.loader.load(&schema_json)?;

        self.reader = Some(if self.decode {
            RecordReader::Decode(ty)
        } else {
            RecordReader::Skip(ty)
        });
        self.codec = Some(codec);
        self.codec_name = name.clone();
        self.sync_marker = header.sync;
        self.header_done = true;
        tracing::debug!(codec = %name, "container header decoded");

        let metadata = Metadata { codec: name, schema_json, header };
        if let Some(listener) = self.metadata_listener.take() {
            listener(&metadata);
        }
        self.metadata = Some(metadata);
        Ok(())
    }

    fn take_failure(&mut self) -> Option<StreamError> {
        let failed = self.shared.borrow_mut().failed.take();
        if failed.is_some() {
            self.dead = true;
        }
        failed
    }
}
