//! Whole run lists: parsing a sequence of data-run entries into [`Fragment`]s
//! and serializing fragments back to the exact NTFS byte layout.

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error::{NtfsError, Result};
use crate::varrun;

/// One decoded data run: a range of virtual clusters mapped onto the volume.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Fragment {
    /// First virtual cluster covered. Assigned while parsing.
    pub starting_vcn: u64,
    /// Clusters of real (possibly compressed) data.
    pub cluster_count: u64,
    /// Physical start cluster, `0` for a sparse run.
    pub lcn: u64,
    /// Virtual clusters following the real ones that have no backing. Only
    /// non-zero once compressed pairs have been compacted.
    pub compressed_filler_clusters: u8,
}

impl Fragment {
    pub fn is_sparse(&self) -> bool {
        self.lcn == 0
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_filler_clusters != 0
    }

    /// Clusters this fragment spans in the virtual stream.
    /// Saturates; [`LogicalStream`](crate::stream::LogicalStream) rejects
    /// fragments that get anywhere near that.
    pub fn virtual_cluster_count(&self) -> u64 {
        self.cluster_count
            .saturating_add(u64::from(self.compressed_filler_clusters))
    }

    /// One past the last VCN covered (saturating).
    pub fn next_vcn(&self) -> u64 {
        self.starting_vcn.saturating_add(self.virtual_cluster_count())
    }

    /// Bytes this fragment occupies once serialized after a run located at
    /// `previous_lcn`, including the synthetic filler run.
    pub fn wire_byte_length(&self, previous_lcn: u64) -> Result<usize> {
        let mut len = varrun::encoded_len(self.cluster_count, self.lcn, previous_lcn)?;
        if self.is_compressed() {
            len += varrun::encoded_len(u64::from(self.compressed_filler_clusters), 0, 0)?;
        }
        Ok(len)
    }
}

/// Running totals threaded through a run-list walk.
#[derive(Debug, Clone, Copy)]
struct RunCursor {
    offset: usize,
    previous_lcn: u64,
    vcn: u64,
}

impl RunCursor {
    fn new(offset: usize, starting_vcn: u64) -> Self {
        Self {
            offset,
            previous_lcn: 0,
            vcn: starting_vcn,
        }
    }

    /// Decode the next entry. `None` once the terminator is reached.
    fn next(&mut self, bounded: &[u8]) -> Result<Option<Fragment>> {
        let (mut fragment, used) = varrun::decode_one(bounded, self.previous_lcn, self.offset)?;
        self.offset += used;
        if fragment.cluster_count == 0 {
            return Ok(None);
        }
        fragment.starting_vcn = self.vcn;
        self.vcn = self.vcn.checked_add(fragment.cluster_count).ok_or_else(|| {
            NtfsError::CorruptRunList(format!("VCN overflow at fragment {:?}", fragment))
        })?;
        if !fragment.is_sparse() {
            self.previous_lcn = fragment.lcn;
        }
        Ok(Some(fragment))
    }
}

/// Parse the run list starting at `offset`, reading no further than
/// `offset + max_length`, and check it covers exactly
/// `declared_starting_vcn..=declared_ending_vcn`.
///
/// A stream with no clusters declares `ending_vcn == starting_vcn - 1`
/// (wrapping, so `u64::MAX` when starting at 0).
pub fn parse_fragments(
    buffer: &[u8],
    max_length: usize,
    offset: usize,
    declared_starting_vcn: u64,
    declared_ending_vcn: u64,
) -> Result<Vec<Fragment>> {
    let (fragments, next_vcn) =
        parse_fragments_lenient(buffer, max_length, offset, declared_starting_vcn)?;

    let actual_start = fragments
        .first()
        .map_or(declared_starting_vcn, |f| f.starting_vcn);
    let actual_end = next_vcn.wrapping_sub(1);
    if actual_start != declared_starting_vcn || actual_end != declared_ending_vcn {
        error!(
            "Run list VCN range {}..={} disagrees with attribute range {}..={}",
            actual_start, actual_end, declared_starting_vcn, declared_ending_vcn
        );
        return Err(NtfsError::RunListVcnMismatch {
            declared_start: declared_starting_vcn,
            declared_end: declared_ending_vcn,
            actual_start,
            actual_end,
        });
    }
    Ok(fragments)
}

/// Parse without the declared-range check. Returns the fragments and the
/// VCN one past the last one.
pub fn parse_fragments_lenient(
    buffer: &[u8],
    max_length: usize,
    offset: usize,
    starting_vcn: u64,
) -> Result<(Vec<Fragment>, u64)> {
    let bound = offset.saturating_add(max_length).min(buffer.len());
    if offset >= bound {
        warn!("Empty run-list window at offset {}", offset);
        return Err(NtfsError::TruncatedRunList { offset, bound });
    }
    let bounded = &buffer[..bound];

    let mut cursor = RunCursor::new(offset, starting_vcn);
    let mut fragments = Vec::new();
    while let Some(fragment) = cursor.next(bounded)? {
        fragments.push(fragment);
    }
    debug!(
        "Parsed {} fragment(s) from {} run-list bytes",
        fragments.len(),
        cursor.offset - offset
    );
    Ok((fragments, cursor.vcn))
}

/// Bytes [`save`] will write for `fragments`, terminator included.
pub fn get_save_length(fragments: &[Fragment]) -> Result<usize> {
    let mut previous_lcn = 0;
    let mut len = 1;
    for fragment in fragments {
        len += fragment.wire_byte_length(previous_lcn)?;
        if !fragment.is_sparse() {
            previous_lcn = fragment.lcn;
        }
    }
    Ok(len)
}

/// Serialize `fragments` into `buffer` at `offset`. Compressed fragments are
/// expanded back into their compressed run plus a sparse filler run.
/// Returns the number of bytes written.
pub fn save(buffer: &mut [u8], offset: usize, fragments: &[Fragment]) -> Result<usize> {
    let bytes = to_bytes(fragments)?;
    let end = offset + bytes.len();
    if end > buffer.len() {
        return Err(NtfsError::TruncatedRunList {
            offset: end,
            bound: buffer.len(),
        });
    }
    buffer[offset..end].copy_from_slice(&bytes);
    Ok(bytes.len())
}

/// Serialize `fragments` into a fresh, terminated byte vector.
pub fn to_bytes(fragments: &[Fragment]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(get_save_length(fragments)?);
    let mut previous_lcn = 0;
    for fragment in fragments {
        varrun::encode_into(&mut out, fragment.cluster_count, fragment.lcn, previous_lcn)?;
        if !fragment.is_sparse() {
            previous_lcn = fragment.lcn;
        }
        if fragment.is_compressed() {
            varrun::encode_into(
                &mut out,
                u64::from(fragment.compressed_filler_clusters),
                0,
                previous_lcn,
            )?;
        }
    }
    out.push(0x00);
    Ok(out)
}

/// Check that `fragments` tile the virtual stream without gaps or overlaps.
pub fn check_contiguous(fragments: &[Fragment]) -> Result<()> {
    for pair in fragments.windows(2) {
        if pair[1].starting_vcn != pair[0].next_vcn() {
            return Err(NtfsError::CorruptRunList(format!(
                "fragment at VCN {} does not follow fragment ending at VCN {}",
                pair[1].starting_vcn,
                pair[0].next_vcn()
            )));
        }
    }
    Ok(())
}
