// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (Data Runs)
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/data_runs.html

//! Encoding and decoding of one data-run ("mapping pair") entry.
//!
//! Layout of an entry:
//! `[header][count: count_bytes LE unsigned][delta: offset_bytes LE signed]`
//! where the header's low nibble is `count_bytes` and its high nibble is
//! `offset_bytes`. A header with `count_bytes == 0` terminates the run list.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{NtfsError, Result};
use crate::fragment::Fragment;

/// Widest field an entry may carry (one 64-bit accumulator).
pub const MAX_FIELD_BYTES: usize = 8;

/// Decode the entry at `offset`. Returns the fragment (its `starting_vcn` is
/// left at 0 for the caller to assign) and the number of bytes consumed.
///
/// A terminator decodes to a fragment with `cluster_count == 0` and consumes
/// one byte.
pub fn decode_one(buffer: &[u8], previous_lcn: u64, offset: usize) -> Result<(Fragment, usize)> {
    let header = *buffer.get(offset).ok_or(NtfsError::TruncatedRunList {
        offset,
        bound: buffer.len(),
    })?;
    let count_bytes = (header & 0x0F) as usize;
    let offset_bytes = (header >> 4) as usize;

    if count_bytes == 0 {
        return Ok((Fragment::default(), 1));
    }
    if count_bytes > MAX_FIELD_BYTES || offset_bytes > MAX_FIELD_BYTES {
        return Err(NtfsError::MalformedRunHeader { offset, header });
    }

    let consumed = 1 + count_bytes + offset_bytes;
    if offset + consumed > buffer.len() {
        return Err(NtfsError::TruncatedRunList {
            offset: offset + consumed,
            bound: buffer.len(),
        });
    }

    let count_start = offset + 1;
    let cluster_count =
        LittleEndian::read_uint(&buffer[count_start..count_start + count_bytes], count_bytes);

    let lcn = if offset_bytes == 0 {
        0
    } else {
        let delta_start = count_start + count_bytes;
        // read_int sign-extends from the top bit of the last byte read
        let delta =
            LittleEndian::read_int(&buffer[delta_start..delta_start + offset_bytes], offset_bytes);
        previous_lcn
            .checked_add_signed(delta)
            .ok_or(NtfsError::MalformedRunHeader { offset, header })?
    };

    Ok((
        Fragment {
            starting_vcn: 0,
            cluster_count,
            lcn,
            compressed_filler_clusters: 0,
        },
        consumed,
    ))
}

/// Encode `fragment` as a single wire entry relative to `previous_lcn`.
///
/// Only the real clusters are emitted: a logical-form filler is the caller's
/// business (see [`crate::fragment::save`]).
pub fn encode_one(fragment: &Fragment, previous_lcn: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + 2 * MAX_FIELD_BYTES);
    encode_into(&mut out, fragment.cluster_count, fragment.lcn, previous_lcn)?;
    Ok(out)
}

/// Append one wire entry for `cluster_count` clusters at `lcn` (0 = sparse).
pub(crate) fn encode_into(
    out: &mut Vec<u8>,
    cluster_count: u64,
    lcn: u64,
    previous_lcn: u64,
) -> Result<()> {
    if cluster_count == 0 {
        return Err(NtfsError::CorruptRunList(
            "cannot encode a run of zero clusters".into(),
        ));
    }
    let count_bytes = unsigned_width(cluster_count);
    let (delta, offset_bytes) = delta_field(lcn, previous_lcn)?;

    out.push(((offset_bytes as u8) << 4) | count_bytes as u8);
    out.write_uint::<LittleEndian>(cluster_count, count_bytes)?;
    if offset_bytes > 0 {
        out.write_int::<LittleEndian>(delta, offset_bytes)?;
    }
    Ok(())
}

/// Size in bytes of the entry [`encode_into`] would produce.
pub(crate) fn encoded_len(cluster_count: u64, lcn: u64, previous_lcn: u64) -> Result<usize> {
    let (_, offset_bytes) = delta_field(lcn, previous_lcn)?;
    Ok(1 + unsigned_width(cluster_count) + offset_bytes)
}

fn delta_field(lcn: u64, previous_lcn: u64) -> Result<(i64, usize)> {
    if lcn == 0 {
        return Ok((0, 0));
    }
    let delta = i64::try_from(lcn as i128 - previous_lcn as i128).map_err(|_| {
        NtfsError::CorruptRunList(format!(
            "LCN delta {lcn} - {previous_lcn} does not fit in 64 bits"
        ))
    })?;
    // a real run never moves by zero, but width 0 would mark it sparse
    Ok((delta, signed_width(delta).max(1)))
}

/// Minimum bytes for a count field: 0 for 0, else the smallest `n` with
/// `value < 0x80 << 8 * (n - 1)`.
pub fn unsigned_width(value: u64) -> usize {
    if value == 0 {
        return 0;
    }
    (1..=MAX_FIELD_BYTES)
        .find(|n| value < 0x80u64 << (8 * (n - 1)))
        .unwrap_or(MAX_FIELD_BYTES)
}

/// Minimum bytes for a two's-complement delta field.
pub fn signed_width(value: i64) -> usize {
    if value == 0 {
        return 0;
    }
    let value = value as i128;
    (1..=MAX_FIELD_BYTES)
        .find(|n| {
            let bound = 0x80i128 << (8 * (n - 1));
            value >= -bound && value < bound
        })
        .unwrap_or(MAX_FIELD_BYTES)
}
