//! Protocol module - records, preamble, and the client framing decoders.
//!
//! This module implements the byte-level side of the framing protocol:
//! - varint lengths and quota-checked strings
//! - record encoding and a general record decoder
//! - the connection preamble
//! - duplex and singleton client decoders, plus the chunked body codec

mod chunked;
mod decoder;
mod duplex_decoder;
mod preamble;
mod record;
mod singleton_decoder;
mod string_decoder;
pub mod varint;
mod wire_format;

pub use chunked::{encode_chunk, ChunkDecoder, ChunkState, CHUNK_TERMINATOR};
pub use decoder::{ClientFramingDecoder, ClientFramingState, DecodeResult};
pub use duplex_decoder::ClientDuplexDecoder;
pub use preamble::Preamble;
pub use record::{
    encode_string, single_byte, validate_mode, validate_preamble_ack, validate_record_type,
    validate_version, Record, RecordDecoder,
};
pub use singleton_decoder::ClientSingletonDecoder;
pub use string_decoder::{StringDecoder, StringKind};
pub use wire_format::{
    faults, FramingMode, KnownEncoding, RecordType, MAX_CONTENT_TYPE_SIZE, MAX_FAULT_SIZE,
    MAX_IDENTITY_SIZE, MAX_VIA_SIZE, VERSION_MAJOR, VERSION_MINOR,
};
