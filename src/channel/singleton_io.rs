//! Chunked envelope I/O for singleton exchanges.
//!
//! [`ChunkedWriter`] frames a request body as
//! `UnsizedEnvelope {chunk}* 0x00 End`. [`ChunkedReader`] walks a
//! [`ClientSingletonDecoder`] to the reply envelope, strips the chunk
//! framing from the body with a [`ChunkDecoder`] and reads the closing
//! `End`.
//!
//! Reads pull whatever the connection returns, so one read can span a chunk
//! boundary, or the end of the body and the `End` record. Unconsumed bytes
//! stay in the reader's buffer and are decoded on the next step.

use bytes::{Bytes, BytesMut};

use super::InputBuffer;
use crate::error::{FramingError, Result};
use crate::protocol::{
    encode_chunk, single_byte, ChunkDecoder, ChunkState, ClientFramingDecoder,
    ClientFramingState, ClientSingletonDecoder, DecodeResult, RecordType, CHUNK_TERMINATOR,
};
use crate::timeout::TimeoutHelper;
use crate::transport::Connection;

/// Writes one chunked request envelope.
pub(crate) struct ChunkedWriter<'a> {
    connection: &'a dyn Connection,
    chunk_size: usize,
    buffer: BytesMut,
}

impl<'a> ChunkedWriter<'a> {
    /// Start an envelope; the record type goes out with the first chunk.
    pub(crate) fn begin(connection: &'a dyn Connection, chunk_size: usize) -> Self {
        let mut buffer = BytesMut::with_capacity(chunk_size.saturating_add(8));
        buffer.extend_from_slice(&single_byte(RecordType::UnsizedEnvelope));
        Self {
            connection,
            chunk_size: chunk_size.max(1),
            buffer,
        }
    }

    /// Write `data` as one or more chunks of at most `chunk_size` bytes.
    pub(crate) async fn write(&mut self, data: &[u8], helper: &TimeoutHelper) -> Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            encode_chunk(chunk, &mut self.buffer)?;
            let pending = self.buffer.split();
            self.connection
                .write(&pending, false, helper.remaining()?)
                .await?;
        }
        Ok(())
    }

    /// Terminate the body and end the session, flushing everything.
    pub(crate) async fn finish(mut self, helper: &TimeoutHelper) -> Result<()> {
        self.buffer.extend_from_slice(&CHUNK_TERMINATOR);
        self.buffer.extend_from_slice(&single_byte(RecordType::End));
        self.connection
            .write(&self.buffer, true, helper.remaining()?)
            .await
    }
}

/// Reads one chunked reply envelope.
pub(crate) struct ChunkedReader<'a> {
    connection: &'a dyn Connection,
    input: InputBuffer,
    max_message_size: usize,
}

impl<'a> ChunkedReader<'a> {
    pub(crate) fn new(connection: &'a dyn Connection, read_size: usize, max_message_size: usize) -> Self {
        Self {
            connection,
            input: InputBuffer::new(read_size),
            max_message_size,
        }
    }

    /// Bytes read past the end of the reply.
    #[inline]
    pub(crate) fn leftover(&self) -> usize {
        self.input.len()
    }

    /// Step `decoder` until it reaches `target`.
    async fn advance_to(
        &mut self,
        decoder: &mut ClientSingletonDecoder,
        target: ClientFramingState,
        helper: &TimeoutHelper,
    ) -> Result<()> {
        while decoder.current_state() != target {
            if decoder.current_state() == ClientFramingState::End {
                return Err(FramingError::Protocol(
                    "server ended the exchange without a reply".into(),
                ));
            }
            match decoder.decode(self.input.pending())? {
                DecodeResult::NeedMoreData => {
                    let state = decoder.current_state().name();
                    self.input.fill(self.connection, state, helper).await?;
                }
                DecodeResult::Progress(n) => self.input.advance(n),
                DecodeResult::Fault { consumed, fault } => {
                    self.input.advance(consumed);
                    tracing::debug!(fault = %fault, "server replied with a fault");
                    return Err(FramingError::from_fault(&fault));
                }
            }
        }
        Ok(())
    }

    /// Read the reply: envelope record, chunked body, `End`.
    pub(crate) async fn read_reply(
        &mut self,
        decoder: &mut ClientSingletonDecoder,
        helper: &TimeoutHelper,
    ) -> Result<Bytes> {
        self.advance_to(decoder, ClientFramingState::EnvelopeStart, helper)
            .await?;
        let body = self.read_body(helper).await?;
        decoder.finish_envelope()?;
        self.advance_to(decoder, ClientFramingState::End, helper)
            .await?;
        Ok(body)
    }

    async fn read_body(&mut self, helper: &TimeoutHelper) -> Result<Bytes> {
        let mut chunks = ChunkDecoder::new();
        let mut body = BytesMut::new();
        loop {
            let before = chunks.current_state();
            match chunks.decode(self.input.pending())? {
                DecodeResult::NeedMoreData => {
                    self.input.fill(self.connection, before.name(), helper).await?;
                    continue;
                }
                result => {
                    let data = self.input.split_to(result.consumed());
                    if before == ChunkState::ReadingEnvelopeBytes {
                        if body.len() + data.len() > self.max_message_size {
                            return Err(FramingError::MessageTooLarge {
                                size: (body.len() + chunks.chunk_bytes_remaining() + data.len())
                                    as u64,
                                max: self.max_message_size as u64,
                            });
                        }
                        body.extend_from_slice(&data);
                    }
                }
            }
            if chunks.current_state() == ChunkState::End {
                return Ok(body.freeze());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::error::ErrorCategory;
    use crate::protocol::{faults, Record};

    const TIMEOUT: Duration = Duration::from_secs(1);

    /// Serves scripted bytes at most `per_read` at a time and records writes.
    struct ScriptedConnection {
        incoming: Mutex<VecDeque<u8>>,
        per_read: usize,
        written: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl ScriptedConnection {
        fn new(incoming: &[u8], per_read: usize) -> Self {
            Self {
                incoming: Mutex::new(incoming.iter().copied().collect()),
                per_read,
                written: Mutex::new(Vec::new()),
            }
        }

        fn written_bytes(&self) -> Vec<u8> {
            self.written.lock().iter().flat_map(|(b, _)| b.clone()).collect()
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut incoming = self.incoming.lock();
            let n = buf.len().min(self.per_read).min(incoming.len());
            for slot in buf.iter_mut().take(n) {
                if let Some(byte) = incoming.pop_front() {
                    *slot = byte;
                }
            }
            Ok(n)
        }

        async fn write(&self, buf: &[u8], immediate: bool, _timeout: Duration) -> Result<()> {
            self.written.lock().push((buf.to_vec(), immediate));
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn abort(&self) {}
    }

    /// Ack, unsized envelope with a 10-byte body as chunks [4, 6], End.
    fn reply_bytes() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x0B, 0x05]);
        encode_chunk(b"0123", &mut buf).unwrap();
        encode_chunk(b"456789", &mut buf).unwrap();
        buf.extend_from_slice(&CHUNK_TERMINATOR);
        buf.extend_from_slice(&[0x07]);
        buf.to_vec()
    }

    async fn read_with(per_read: usize, read_size: usize) -> (Bytes, usize, ClientFramingState) {
        let connection = ScriptedConnection::new(&reply_bytes(), per_read);
        let mut reader = ChunkedReader::new(&connection, read_size, 1024);
        let mut decoder = ClientSingletonDecoder::new();
        let body = reader
            .read_reply(&mut decoder, &TimeoutHelper::new(TIMEOUT))
            .await
            .unwrap();
        (body, reader.leftover(), decoder.current_state())
    }

    #[tokio::test]
    async fn test_reply_one_byte_per_read() {
        let (body, leftover, state) = read_with(1, 64).await;
        assert_eq!(&body[..], b"0123456789");
        assert_eq!(leftover, 0);
        assert_eq!(state, ClientFramingState::End);
    }

    #[tokio::test]
    async fn test_reply_reads_at_chunk_boundaries() {
        // ack + record + size + first chunk = 7 bytes; then one past it.
        for per_read in [7, 8, 3, 64] {
            let (body, leftover, state) = read_with(per_read, 64).await;
            assert_eq!(&body[..], b"0123456789", "per_read {per_read}");
            assert_eq!(leftover, 0);
            assert_eq!(state, ClientFramingState::End);
        }
    }

    #[tokio::test]
    async fn test_reply_with_small_read_buffer() {
        let (body, _, _) = read_with(64, 5).await;
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_trailing_bytes_are_left_over() {
        let mut bytes = reply_bytes();
        bytes.extend_from_slice(b"xyz");
        let connection = ScriptedConnection::new(&bytes, 64);
        let mut reader = ChunkedReader::new(&connection, 64, 1024);
        let mut decoder = ClientSingletonDecoder::new();
        reader
            .read_reply(&mut decoder, &TimeoutHelper::new(TIMEOUT))
            .await
            .unwrap();
        assert_eq!(reader.leftover(), 3);
    }

    #[tokio::test]
    async fn test_reply_fault() {
        let mut bytes = vec![0x0B];
        bytes.extend_from_slice(&Record::Fault(faults::SERVER_TOO_BUSY.into()).to_bytes().unwrap());
        bytes.push(0x07);
        let connection = ScriptedConnection::new(&bytes, 2);
        let mut reader = ChunkedReader::new(&connection, 64, 1024);
        let mut decoder = ClientSingletonDecoder::new();
        let err = reader
            .read_reply(&mut decoder, &TimeoutHelper::new(TIMEOUT))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ServerTooBusy);
    }

    #[tokio::test]
    async fn test_reply_too_large() {
        let connection = ScriptedConnection::new(&reply_bytes(), 64);
        let mut reader = ChunkedReader::new(&connection, 64, 8);
        let mut decoder = ClientSingletonDecoder::new();
        let err = reader
            .read_reply(&mut decoder, &TimeoutHelper::new(TIMEOUT))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Quota);
    }

    #[tokio::test]
    async fn test_premature_eof() {
        let bytes = reply_bytes();
        let connection = ScriptedConnection::new(&bytes[..6], 64);
        let mut reader = ChunkedReader::new(&connection, 64, 1024);
        let mut decoder = ClientSingletonDecoder::new();
        let err = reader
            .read_reply(&mut decoder, &TimeoutHelper::new(TIMEOUT))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[tokio::test]
    async fn test_writer_frames_request() {
        let connection = ScriptedConnection::new(&[], 1);
        let helper = TimeoutHelper::new(TIMEOUT);
        let mut writer = ChunkedWriter::begin(&connection, 4);
        writer.write(b"0123456789", &helper).await.unwrap();
        writer.finish(&helper).await.unwrap();

        let mut expected = vec![0x05];
        encode_chunk_into(&mut expected, b"0123");
        encode_chunk_into(&mut expected, b"4567");
        encode_chunk_into(&mut expected, b"89");
        expected.extend_from_slice(&[0x00, 0x07]);
        assert_eq!(connection.written_bytes(), expected);

        let writes = connection.written.lock();
        assert!(writes.last().unwrap().1, "final write must be immediate");
        assert!(writes[..writes.len() - 1].iter().all(|(_, immediate)| !immediate));
    }

    #[tokio::test]
    async fn test_writer_empty_body() {
        let connection = ScriptedConnection::new(&[], 1);
        let helper = TimeoutHelper::new(TIMEOUT);
        let mut writer = ChunkedWriter::begin(&connection, 4);
        writer.write(b"", &helper).await.unwrap();
        writer.finish(&helper).await.unwrap();
        assert_eq!(connection.written_bytes(), vec![0x05, 0x00, 0x07]);
    }

    fn encode_chunk_into(out: &mut Vec<u8>, data: &[u8]) {
        let mut buf = BytesMut::new();
        encode_chunk(data, &mut buf).unwrap();
        out.extend_from_slice(&buf);
    }
}
