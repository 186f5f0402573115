//! Optional zlib compression envelope
//!
//! With a non-negative threshold `t`, every frame body is wrapped in a
//! compression envelope before the outer length prefix:
//!
//! ```text
//! body.len() >  t :  varint(uncompressed_len) + deflate(body)
//! body.len() <= t :  varint(0)               + body
//! ```
//!
//! A body of exactly `t` bytes goes out uncompressed; `t + 1` bytes goes out
//! compressed. A threshold of `-1` disables the stage entirely and the outer
//! length prefix is the only framing. Inbound, a declared uncompressed
//! length that the inflated data does not match is a protocol error.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::codec;
use crate::error::{ProtocolError, Result};

/// Sentinel threshold that disables the compression stage.
pub const COMPRESSION_DISABLED: i32 = -1;

/// Upper bound on a declared uncompressed length, guarding against
/// decompression bombs.
const MAX_UNCOMPRESSED_LEN: usize = 1 << 23;

/// One direction's compression stage. Stateless apart from the threshold;
/// installed on a pipeline once negotiation fixes the threshold.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStage {
    threshold: i32,
}

impl CompressionStage {
    pub fn new(threshold: i32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Whether a body of `len` bytes leaves compressed.
    pub fn compresses(&self, len: usize) -> bool {
        self.threshold >= 0 && len > self.threshold as usize
    }

    /// Wraps an outbound frame body in the compression envelope.
    pub fn encode(&self, body: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        if self.compresses(body.len()) {
            codec::write_var_int(&mut out, body.len() as i32);
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            out.extend_from_slice(&encoder.finish()?);
        } else {
            codec::write_var_int(&mut out, 0);
            out.extend_from_slice(body);
        }
        Ok(out.freeze())
    }

    /// Unwraps an inbound compression envelope into the frame body.
    pub fn decode(&self, mut frame: Bytes) -> Result<Bytes> {
        let declared = codec::read_var_int(&mut frame)?;
        if declared == 0 {
            return Ok(frame);
        }
        if declared < 0 || declared as usize > MAX_UNCOMPRESSED_LEN {
            return Err(ProtocolError::MalformedFrame("bad uncompressed length"));
        }
        let declared = declared as usize;
        let mut body = Vec::with_capacity(declared);
        ZlibDecoder::new(&frame[..])
            .take(MAX_UNCOMPRESSED_LEN as u64 + 1)
            .read_to_end(&mut body)?;
        if body.len() != declared {
            return Err(ProtocolError::CompressionSizeMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok(Bytes::from(body))
    }
}
