// Sources:
// - https://learn.microsoft.com/openspecs/windows_protocols/ms-xca/5655f4a3-6ba4-489b-959f-e1f407c52f15
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/compression.html

//! LZNT1, the block codec behind NTFS compressed attributes.
//!
//! A compression unit is stored as a sequence of chunks, each describing
//! 4 KiB of output:
//!
//! * a 2-byte header: bits 0-11 are the chunk data length minus one,
//!   bits 12-14 the signature (3), bit 15 set when the chunk is compressed;
//! * compressed chunks are groups of one flag byte followed by eight
//!   elements: a literal byte (flag bit 0) or a 16-bit copy token (flag bit
//!   1) whose length/displacement split widens the displacement as the
//!   output position inside the chunk grows.
//!
//! A zero header, or the end of the input, ends the block. Output not
//! produced by any chunk is zero.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NtfsError, Result};

/// Uncompressed bytes described by one chunk.
pub const CHUNK_SIZE: usize = 4096;

const SIGNATURE: u16 = 0x3000;
const COMPRESSED_FLAG: u16 = 0x8000;
const MIN_MATCH: usize = 3;

/// Decompressor contract the stream reader depends on.
pub trait Decompressor {
    /// Size of the block produced by one call (`unit clusters * cluster size`).
    fn set_block_size(&mut self, block_size: usize);

    /// Decompress one self-contained block from `input` into the first
    /// block-size bytes of `output`. Returns the bytes of real output (the
    /// rest of the block is zero-filled).
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Default)]
pub struct Lznt1 {
    block_size: usize,
}

impl Lznt1 {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Decompressor for Lznt1 {
    fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if output.len() < self.block_size {
            return Err(NtfsError::Decompression(format!(
                "output of {} bytes cannot hold a {} byte block",
                output.len(),
                self.block_size
            )));
        }
        decompress_block(input, &mut output[..self.block_size])
    }
}

/// Decompress chunks from `input` until `output` is full, a zero header is
/// met or the input runs out.
pub fn decompress_block(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let mut in_pos = 0;
    let mut out_pos = 0;
    let mut produced_end = 0;

    while in_pos + 2 <= input.len() && out_pos < output.len() {
        let header = LittleEndian::read_u16(&input[in_pos..]);
        if header == 0 {
            break;
        }
        if header & 0x7000 != SIGNATURE {
            return Err(NtfsError::Decompression(format!(
                "bad chunk signature in header 0x{header:04X} at offset {in_pos}"
            )));
        }
        in_pos += 2;

        let chunk_len = (header & 0x0FFF) as usize + 1;
        let chunk_end = in_pos + chunk_len;
        if chunk_end > input.len() {
            return Err(NtfsError::Decompression(format!(
                "chunk of {chunk_len} bytes at offset {in_pos} overruns input of {} bytes",
                input.len()
            )));
        }
        let chunk = &input[in_pos..chunk_end];
        let dest_end = (out_pos + CHUNK_SIZE).min(output.len());
        let dest = &mut output[out_pos..dest_end];

        let produced = if header & COMPRESSED_FLAG != 0 {
            decompress_chunk(chunk, dest)?
        } else {
            let n = chunk.len().min(dest.len());
            dest[..n].copy_from_slice(&chunk[..n]);
            n
        };
        dest[produced..].fill(0);

        produced_end = out_pos + produced;
        out_pos = dest_end;
        in_pos = chunk_end;
    }

    output[out_pos..].fill(0);
    Ok(produced_end)
}

/// Bits of a copy token holding the length when the output position inside
/// the chunk is `position` (at least 1).
fn length_bits(position: usize) -> u32 {
    let mut bits = 12;
    let mut p = position - 1;
    while p >= 0x10 {
        bits -= 1;
        p >>= 1;
    }
    bits
}

fn decompress_chunk(chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
    let mut i = 0;
    let mut o = 0;

    while i < chunk.len() {
        let flags = chunk[i];
        i += 1;
        for bit in 0..8 {
            if i >= chunk.len() {
                break;
            }
            if flags & (1 << bit) == 0 {
                if o >= dest.len() {
                    return Err(NtfsError::Decompression("literal overflows chunk".into()));
                }
                dest[o] = chunk[i];
                o += 1;
                i += 1;
                continue;
            }

            if i + 2 > chunk.len() {
                return Err(NtfsError::Decompression("truncated copy token".into()));
            }
            if o == 0 {
                return Err(NtfsError::Decompression(
                    "copy token at start of chunk".into(),
                ));
            }
            let token = LittleEndian::read_u16(&chunk[i..]);
            i += 2;

            let bits = length_bits(o);
            let length = (token & ((1 << bits) - 1)) as usize + MIN_MATCH;
            let displacement = (token >> bits) as usize + 1;
            if displacement > o || o + length > dest.len() {
                return Err(NtfsError::Decompression(format!(
                    "copy token (disp {displacement}, len {length}) invalid at position {o}"
                )));
            }
            // byte by byte: source and destination may overlap
            for k in 0..length {
                dest[o + k] = dest[o + k - displacement];
            }
            o += length;
        }
    }
    Ok(o)
}

/// Compress `input` into LZNT1 chunks (greedy longest match). Chunks that do
/// not shrink are stored raw.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + 2);
    for chunk in input.chunks(CHUNK_SIZE) {
        let packed = compress_chunk(chunk);
        if packed.len() < chunk.len() {
            out.extend_from_slice(&(SIGNATURE | COMPRESSED_FLAG | (packed.len() - 1) as u16).to_le_bytes());
            out.extend_from_slice(&packed);
        } else {
            out.extend_from_slice(&(SIGNATURE | (chunk.len() - 1) as u16).to_le_bytes());
            out.extend_from_slice(chunk);
        }
    }
    out
}

fn compress_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len());
    let mut pos = 0;

    while pos < chunk.len() {
        let flag_at = out.len();
        out.push(0u8);
        for bit in 0..8 {
            if pos >= chunk.len() {
                break;
            }
            match longest_match(chunk, pos) {
                Some((length, displacement)) => {
                    let bits = length_bits(pos);
                    let token = (((displacement - 1) as u16) << bits) | (length - MIN_MATCH) as u16;
                    out.extend_from_slice(&token.to_le_bytes());
                    out[flag_at] |= 1 << bit;
                    pos += length;
                }
                None => {
                    out.push(chunk[pos]);
                    pos += 1;
                }
            }
        }
    }
    out
}

fn longest_match(chunk: &[u8], pos: usize) -> Option<(usize, usize)> {
    if pos == 0 {
        return None;
    }
    let bits = length_bits(pos);
    let max_len = ((1usize << bits) + MIN_MATCH - 1).min(chunk.len() - pos);
    let max_disp = (1usize << (16 - bits)).min(pos);
    if max_len < MIN_MATCH {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for displacement in 1..=max_disp {
        let start = pos - displacement;
        let mut len = 0;
        while len < max_len && chunk[start + len] == chunk[pos + len] {
            len += 1;
        }
        if len >= MIN_MATCH && best.is_none_or(|(l, _)| len > l) {
            best = Some((len, displacement));
            if len == max_len {
                break;
            }
        }
    }
    best
}
