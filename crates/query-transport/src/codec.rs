//! Length-prefixed frame codec
//!
//! Every frame on the wire is a 4-byte big-endian length followed by that
//! many payload bytes. The codec knows nothing about payload contents.

use crate::error::{Result, TransportError};
use crate::memory::{BufferAccount, MemoryKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length field preceding each frame
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Largest payload accepted by default (signed 32-bit length field)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = i32::MAX as usize;

/// Codec turning a byte stream into frames and frames into a byte stream
///
/// When an account is attached, the read buffer is charged to the pooled
/// allocator before it grows, so a connection that would push the process
/// past its memory limit fails to decode instead of buffering more.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
    account: Option<BufferAccount>,
}

impl FrameCodec {
    /// Create a codec with the default maximum frame length
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            account: None,
        }
    }

    /// Set the maximum payload length
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length.min(u32::MAX as usize);
        self
    }

    /// Charge buffered bytes to the given account
    pub fn with_account(mut self, account: BufferAccount) -> Self {
        self.account = Some(account);
        self
    }

    /// Get the maximum payload length
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Get the attached account
    pub fn account(&self) -> Option<&BufferAccount> {
        self.account.as_ref()
    }

    fn charge_read_buffer(&self, bytes: usize) -> Result<()> {
        match &self.account {
            Some(account) => account.track(MemoryKind::Direct, bytes),
            None => Ok(()),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_FIELD_SIZE {
            self.charge_read_buffer(src.capacity())?;
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_FIELD_SIZE];
        header.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_length,
            });
        }

        let needed = LENGTH_FIELD_SIZE + len;
        if src.len() < needed {
            self.charge_read_buffer(needed.max(src.capacity()))?;
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let frame = src.split_to(len).freeze();
        self.charge_read_buffer(src.capacity())?;
        Ok(Some(frame))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_length,
            });
        }

        dst.reserve(LENGTH_FIELD_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
