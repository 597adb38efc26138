//! Length-prefixed framing
//!
//! Frame = \[LEN:4\]\[PAYLOAD:LEN\] optionally followed by \[LEN:4\] again.
//! The repeated length catches stream corruption; a mismatch is fatal to
//! the connection carrying it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use odb_core::{OdbError, OdbResult};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on a single frame's payload
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Encode one frame
pub fn encode_frame(payload: &[u8], extra_size_check: bool) -> Bytes {
    let trailer = if extra_size_check { LENGTH_PREFIX_SIZE } else { 0 };
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len() + trailer);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    if extra_size_check {
        buf.put_u32_le(payload.len() as u32);
    }
    buf.freeze()
}

/// Reassembles frames from arbitrarily chunked reads
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    extra_size_check: bool,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(extra_size_check: bool) -> Self {
        FrameDecoder {
            buf: BytesMut::new(),
            extra_size_check,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if any
    pub fn next_frame(&mut self) -> OdbResult<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let len = declared as usize;
        if len > self.max_frame_size {
            return Err(OdbError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let trailer = if self.extra_size_check { LENGTH_PREFIX_SIZE } else { 0 };
        if self.buf.len() < LENGTH_PREFIX_SIZE + len + trailer {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buf.split_to(len).freeze();

        if self.extra_size_check {
            let repeated = self.buf.get_u32_le();
            if repeated != declared {
                return Err(OdbError::Corruption { declared, repeated });
            }
        }

        Ok(Some(payload))
    }

    /// Drain every complete frame
    pub fn drain(&mut self) -> OdbResult<Vec<Bytes>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
