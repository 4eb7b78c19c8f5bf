//! Length-delimited frames for byte-pipe transports
//!
//! Frame layout:
//! - Bytes 0-3: Batch length (LE)
//! - Bytes 4+: One encoded batch

use bytes::{Buf, BufMut, Bytes, BytesMut};

use operant_core::DecodeError;

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum batch size carried by one frame
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Wrap one encoded batch in a frame
pub fn frame(batch: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + batch.len());
    buf.put_u32_le(batch.len() as u32);
    buf.put_slice(batch);
    buf.freeze()
}

/// Accumulates stream bytes and yields whole frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the pipe
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete batch, if one is buffered.
    ///
    /// An oversized length prefix is an error; the decoder should be
    /// discarded afterwards since the stream is out of sync.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DecodeError::FrameTooLarge(len));
        }

        if self.buf.len() < FRAME_HEADER_SIZE + len {
            self.buf.reserve(FRAME_HEADER_SIZE + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}
