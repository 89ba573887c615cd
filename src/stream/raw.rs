//! Frame-less streams: a continuous record sequence with no header, no
//! block framing and no sync markers.

use std::collections::VecDeque;

use crate::schema::ValueCodec;
use crate::stream::{Decoded, ReadOutcome, RecordReader, StreamError, WriteDone};
use crate::tap::{Tap, DEFAULT_BATCH_SIZE};

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Record → bytes, batched through one scratch tap.
///
/// Values accumulate in the scratch buffer until one overflows it; the
/// filled prefix is then emitted downstream and the value is rewritten
/// into the emptied (possibly reallocated) buffer.  A record larger than
/// the whole buffer forces a single reallocation to twice its encoded
/// size, so the pathological case converges in one resize.
pub struct RawEncoder<C: ValueCodec> {
    ty: C,
    tap: Tap,
    ready: VecDeque<Vec<u8>>,
    finished: bool,
}

impl<C: ValueCodec> RawEncoder<C> {
    pub fn new(ty: C) -> Self {
        Self::with_batch_size(ty, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(ty: C, batch_size: usize) -> Self {
        Self {
            ty,
            tap: Tap::with_capacity(batch_size.max(1)),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Accept one value.  Never exerts backpressure: memory is bounded by
    /// the batch buffer plus whatever downstream has not yet drained.
    ///
    /// A value that does not match the schema surfaces an error and is
    /// dropped; the encoder stays usable.
    pub fn write(&mut self, value: &C::Value) -> Result<(), StreamError> {
        let start = self.tap.pos();
        if let Err(e) = self.ty.write(&mut self.tap, value) {
            self.tap.set_pos(start);
            return Err(e.into());
        }
        if self.tap.is_valid() {
            return Ok(());
        }

        // Overflow: emit the filled prefix, make room, write again.
        let need = self.tap.pos() - start;
        if start > 0 {
            self.ready.push_back(self.tap.buf()[..start].to_vec());
        }
        if need > self.tap.len() {
            self.tap.grow(need * 2);
        } else {
            self.tap.set_pos(0);
        }
        self.ty.write(&mut self.tap, value)?;
        debug_assert!(self.tap.is_valid(), "record exceeds reallocated buffer");
        Ok(())
    }

    /// Mark end of input; the final partial batch is emitted as-is.
    pub fn finish(&mut self) {
        if self.tap.pos() > 0 {
            let tap = std::mem::replace(&mut self.tap, Tap::new(Vec::new()));
            self.ready.push_back(tap.into_written());
        }
        self.finished = true;
    }

    pub fn read(&mut self) -> Result<ReadOutcome<Vec<u8>>, StreamError> {
        match self.ready.pop_front() {
            Some(chunk) => Ok(ReadOutcome::Item(chunk)),
            None if self.finished => Ok(ReadOutcome::End),
            None => Ok(ReadOutcome::Pending),
        }
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Bytes → record, driven by write/read backpressure.
///
/// Incoming chunks accumulate in one tap; each read speculatively decodes
/// a record and rolls back on underflow.  The stored write callback is
/// fired only from such a stalled read — that withheld callback is the
/// entire backpressure mechanism, and there is never more than one.
pub struct RawDecoder<C: ValueCodec> {
    reader: RecordReader<C>,
    tap: Tap,
    write_done: Option<WriteDone>,
    finished: bool,
}

impl<C: ValueCodec> RawDecoder<C> {
    pub fn new(ty: C) -> Self {
        Self::with_mode(ty, true)
    }

    /// `decode = false` passes each record through as raw encoded bytes.
    pub fn with_mode(ty: C, decode: bool) -> Self {
        Self {
            reader: if decode { RecordReader::Decode(ty) } else { RecordReader::Skip(ty) },
            tap: Tap::new(Vec::new()),
            write_done: None,
            finished: false,
        }
    }

    /// Accept one chunk.  `done` fires once the decoder has drained enough
    /// to want more input; writing again before that is an error.
    pub fn write(&mut self, chunk: &[u8], done: WriteDone) -> Result<(), StreamError> {
        if self.write_done.is_some() {
            return Err(StreamError::WritePending);
        }
        self.tap.feed(chunk);
        self.write_done = Some(done);
        Ok(())
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn read(&mut self) -> Result<ReadOutcome<Decoded<C::Value>>, StreamError> {
        if self.tap.remaining() == 0 {
            return Ok(self.stall());
        }
        let start = self.tap.pos();
        let item = self.reader.read(&mut self.tap);
        if self.tap.is_valid() {
            return Ok(ReadOutcome::Item(item));
        }
        // Partial record: roll back and wait for the rest.
        self.tap.set_pos(start);
        Ok(self.stall())
    }

    fn stall(&mut self) -> ReadOutcome<Decoded<C::Value>> {
        if self.finished {
            // Residual bytes of a truncated record are discarded silently.
            return ReadOutcome::End;
        }
        if let Some(done) = self.write_done.take() {
            done();
        }
        ReadOutcome::Pending
    }
}
