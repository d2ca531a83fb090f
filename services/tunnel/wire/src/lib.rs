//! Wire protocol for the tunnel transport.
//!
//! This crate holds everything that touches bytes on the wire and nothing that
//! touches sockets: chunk framing, labelled-stream packing of several messages
//! into one packet, the HTTP control headers, the socket preamble, and the
//! [`FramedBuffer`] segment accumulator with its [`BufferPool`].
//!
//! ## Wire Format
//!
//! ```text
//! chunk           := magic(0xC7) len:i32le final:u8 payload[len]
//! framed message  := chunk* (last chunk has final = 1)
//! labelled stream := (0x01 framed message)* 0x00
//!
//! socket open     := version:u8 kind:u8 name:string
//! http request    := magic(0x4D) version:u8 kind:u8 peer:uuid type:u8 seq:i32
//!                    [name:string host:i32 if version >= 1] body
//! http response   := magic(0x4D) server:string seq:i32 type:u8
//!                    [host:i32 if version > 0] body
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod framed;
pub mod header;
pub mod labelled;
pub mod preamble;
pub mod primitives;

// Re-export main types
pub use chunk::{
    frame_bytes, frame_reader, framed_len, unframe, ChunkDecoder, ChunkHeader, CHUNK_HEADER_SIZE,
    CHUNK_MAGIC, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use error::WireError;
pub use framed::{BufferPool, FramedBuffer, PooledBuf, ReadMode, DEFAULT_POOL_BUFFER_SIZE};
pub use header::{
    ConnectionKind, PacketType, RequestHeader, ResponseHeader, HTTP_MAGIC, WIRE_VERSION,
};
pub use labelled::{pack_labelled, unpack_labelled, LabelledReader, LabelledWriter};
pub use preamble::{HandshakeMsg, Hello, Preamble};
