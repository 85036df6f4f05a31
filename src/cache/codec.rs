//! Frame compression with optional XOR delta against the previous frame.

use std::io;

use super::format::{CodecTag, CompressionType};

/// Errors from decoding a cached frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Decompression failed: {0}")]
    Decompress(#[from] io::Error),
    #[error("Decoded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Compress data using LZ4 block format (no size prefix).
#[cfg(feature = "lz4")]
pub fn compress_lz4(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(data)
}

/// Decompress LZ4 block data into `output`, returning the decoded length.
#[cfg(feature = "lz4")]
pub fn decompress_lz4(data: &[u8], output: &mut [u8]) -> io::Result<usize> {
    lz4_flex::block::decompress_into(data, output)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Fallback when LZ4 is not available.
#[cfg(not(feature = "lz4"))]
pub fn compress_lz4(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(not(feature = "lz4"))]
pub fn decompress_lz4(data: &[u8], output: &mut [u8]) -> io::Result<usize> {
    store_raw(data, output)
}

fn store_raw(data: &[u8], output: &mut [u8]) -> io::Result<usize> {
    let output_len = output.len();
    let dst = output.get_mut(..data.len()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame of {} bytes overflows {} byte buffer", data.len(), output_len),
        )
    })?;
    dst.copy_from_slice(data);
    Ok(data.len())
}

/// XOR `src` into `dst` eight bytes at a time.
pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in (&mut dst_words).zip(&mut src_words) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        d.copy_from_slice(&(u64::from_ne_bytes(a) ^ u64::from_ne_bytes(b)).to_ne_bytes());
    }
    for (d, s) in dst_words
        .into_remainder()
        .iter_mut()
        .zip(src_words.remainder())
    {
        *d ^= s;
    }
}

/// Encoder/decoder for fixed-size frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    pub compression: CompressionType,
    /// XOR against the previous frame when one is supplied.
    pub delta: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compression: CompressionType::default(),
            delta: cfg!(feature = "delta"),
        }
    }
}

impl FrameCodec {
    pub fn new(compression: CompressionType, delta: bool) -> Self {
        Self { compression, delta }
    }

    /// Tag naming this encoding in cache file names.
    pub fn tag(&self) -> CodecTag {
        CodecTag {
            compression: self.compression,
            delta: self.delta,
        }
    }

    fn delta_base<'a>(&self, previous: Option<&'a [u8]>, len: usize) -> Option<&'a [u8]> {
        previous.filter(|p| self.delta && p.len() == len)
    }

    /// Encode one raw frame. Decoding must be given the same `previous`.
    pub fn encode(&self, raw: &[u8], previous: Option<&[u8]>) -> Vec<u8> {
        match self.delta_base(previous, raw.len()) {
            Some(previous) => {
                let mut diff = raw.to_vec();
                xor_in_place(&mut diff, previous);
                self.compress(&diff)
            }
            None => self.compress(raw),
        }
    }

    /// Decode one frame into exactly `out_size` bytes.
    pub fn decode(
        &self,
        compressed: &[u8],
        previous: Option<&[u8]>,
        out_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let mut output = vec![0u8; out_size];
        let written = match self.compression {
            CompressionType::None => store_raw(compressed, &mut output)?,
            CompressionType::Lz4 => decompress_lz4(compressed, &mut output)?,
        };
        if written != out_size {
            return Err(CodecError::SizeMismatch {
                expected: out_size,
                actual: written,
            });
        }
        if let Some(previous) = self.delta_base(previous, out_size) {
            xor_in_place(&mut output, previous);
        }
        Ok(output)
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        match self.compression {
            CompressionType::None => data.to_vec(),
            CompressionType::Lz4 => compress_lz4(data),
        }
    }
}
