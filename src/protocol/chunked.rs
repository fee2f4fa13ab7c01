//! Chunked envelope body codec.
//!
//! An unsized envelope body is a sequence of chunks, each a varint length
//! followed by that many bytes, terminated by a zero-length chunk:
//! ```text
//! ┌────────┬───────────┬────────┬───────────┬──────┐
//! │ varint │ N bytes   │ varint │ M bytes   │ 0x00 │
//! └────────┴───────────┴────────┴───────────┴──────┘
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{FramingError, Result};
use crate::protocol::decoder::DecodeResult;
use crate::protocol::varint::{self, IntDecoder};

/// Terminator written after the last data chunk.
pub const CHUNK_TERMINATOR: [u8; 1] = [0x00];

/// Append one data chunk to `buf`.
///
/// Empty data writes nothing, so it can never be mistaken for the terminator.
pub fn encode_chunk(data: &[u8], buf: &mut BytesMut) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    varint::encode_into(varint::checked_len(data.len())?, buf);
    buf.put_slice(data);
    Ok(())
}

/// States of the chunk decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    ReadingEnvelopeChunkSize,
    ChunkStart,
    ReadingEnvelopeBytes,
    ChunkEnd,
    EnvelopeEnd,
    End,
}

impl ChunkState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingEnvelopeChunkSize => "ReadingEnvelopeChunkSize",
            Self::ChunkStart => "ChunkStart",
            Self::ReadingEnvelopeBytes => "ReadingEnvelopeBytes",
            Self::ChunkEnd => "ChunkEnd",
            Self::EnvelopeEnd => "EnvelopeEnd",
            Self::End => "End",
        }
    }
}

/// Incremental decoder for a chunked envelope body.
///
/// Like the client framing decoders it advances one state per call; the
/// bytes consumed in `ReadingEnvelopeBytes` are body data.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
    size_decoder: IntDecoder,
    chunk_size: usize,
    bytes_needed: usize,
    stream_position: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::ReadingEnvelopeChunkSize,
            size_decoder: IntDecoder::new(),
            chunk_size: 0,
            bytes_needed: 0,
            stream_position: 0,
        }
    }

    #[inline]
    pub fn current_state(&self) -> ChunkState {
        self.state
    }

    #[inline]
    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    /// Size of the current chunk, valid from `ChunkStart` on.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes of the current chunk not yet consumed.
    #[inline]
    pub fn chunk_bytes_remaining(&self) -> usize {
        self.bytes_needed
    }

    /// Advance by one state, consuming a prefix of `buf`.
    pub fn decode(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        let state = self.state;
        match self.step(buf) {
            Ok(result) => {
                self.stream_position += result.consumed() as u64;
                Ok(result)
            }
            Err(e) => Err(FramingError::decode_at(self.stream_position, state.name(), e)),
        }
    }

    fn step(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        match self.state {
            ChunkState::ReadingEnvelopeChunkSize => {
                if buf.is_empty() {
                    return Ok(DecodeResult::NeedMoreData);
                }
                let consumed = self.size_decoder.decode(buf)?;
                if let Some(size) = self.size_decoder.value() {
                    self.size_decoder.reset();
                    self.chunk_size = size as usize;
                    self.bytes_needed = size as usize;
                    self.state = if size == 0 {
                        ChunkState::EnvelopeEnd
                    } else {
                        ChunkState::ChunkStart
                    };
                }
                Ok(DecodeResult::Progress(consumed))
            }
            ChunkState::ChunkStart => {
                self.state = ChunkState::ReadingEnvelopeBytes;
                Ok(DecodeResult::Progress(0))
            }
            ChunkState::ReadingEnvelopeBytes => {
                if buf.is_empty() {
                    return Ok(DecodeResult::NeedMoreData);
                }
                let take = self.bytes_needed.min(buf.len());
                self.bytes_needed -= take;
                if self.bytes_needed == 0 {
                    self.state = ChunkState::ChunkEnd;
                }
                Ok(DecodeResult::Progress(take))
            }
            ChunkState::ChunkEnd => {
                self.state = ChunkState::ReadingEnvelopeChunkSize;
                Ok(DecodeResult::Progress(0))
            }
            ChunkState::EnvelopeEnd => {
                self.state = ChunkState::End;
                Ok(DecodeResult::Progress(0))
            }
            ChunkState::End => Err(FramingError::FramingEnded),
        }
    }
}
