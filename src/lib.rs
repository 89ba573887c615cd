pub mod codec;
pub mod header;
pub mod queue;
pub mod schema;
pub mod stream;
pub mod tap;

pub use codec::{Codec, CodecRegistry};
pub use header::{Header, MAGIC, SYNC_SIZE};
pub use queue::{BlockData, OrderedQueue};
pub use schema::{PrimitiveLoader, SchemaLoader, Type, Value, ValueCodec};
pub use stream::{
    read_container, write_container, BlockDecoder, BlockEncoder, Decoded, DecodedContainer,
    DecoderOptions, EncoderOptions, Metadata, RawDecoder, RawEncoder, ReadOutcome, StreamError,
    WriteDone,
};
pub use tap::Tap;
