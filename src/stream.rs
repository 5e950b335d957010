//! Random access over the virtual byte space described by a fragment list.
//!
//! Every request is split along fragment (and compression unit) boundaries
//! and each piece is served by one of three paths: zero fill for sparse
//! runs, a plain disk read, or an LZNT1 decompression of a whole
//! compression unit.
//!
//! A stream is synchronous and keeps its own cursor. The fragment list is
//! shared read-only (`Arc<[Fragment]>`), so many streams can be opened over
//! the same attribute, each with its own disk handle.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::disk::{DiskHandle, DiskReader};
use crate::error::{NtfsError, Result};
use crate::fragment::{self, Fragment};
use crate::lznt1::{Decompressor, Lznt1};

/// Geometry of one non-resident attribute, as declared by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub cluster_size: u64,
    /// Clusters per compression unit, 0 when the attribute is not compressed.
    pub compression_unit_clusters: u64,
    /// Logical length of the stream in bytes.
    pub length: u64,
    /// Bytes actually written; everything after reads as zero.
    pub initialized_length: u64,
}

impl StreamGeometry {
    pub fn new(cluster_size: u64, compression_unit_clusters: u64, length: u64) -> Self {
        Self {
            cluster_size,
            compression_unit_clusters,
            length,
            initialized_length: length,
        }
    }

    pub fn with_initialized_length(mut self, initialized_length: u64) -> Self {
        self.initialized_length = initialized_length.min(self.length);
        self
    }

    fn unit_bytes(&self) -> u64 {
        self.compression_unit_clusters * self.cluster_size
    }
}

/// Where one request lands inside a fragment.
enum Extent {
    Sparse,
    Direct { disk_offset: u64 },
    Compressed {
        unit_vcn: u64,
        lcn: u64,
        real_clusters: u64,
        offset_in_unit: u64,
    },
}

pub struct LogicalStream<'a, D: DiskReader> {
    disk: Option<DiskHandle<'a, D>>,
    fragments: Arc<[Fragment]>,
    geometry: StreamGeometry,
    position: u64,
    decompressor: Box<dyn Decompressor + Send>,
    packed: Vec<u8>,
    unit: Vec<u8>,
    unit_vcn: Option<u64>,
}

impl<'a, D: DiskReader> LogicalStream<'a, D> {
    /// Stream that owns `disk` and drops it on [`close`](Self::close).
    pub fn owned(
        disk: D,
        fragments: impl Into<Arc<[Fragment]>>,
        geometry: StreamGeometry,
    ) -> Result<Self> {
        Self::with_handle(DiskHandle::Owned(disk), fragments.into(), geometry)
    }

    /// Stream over a disk that stays usable by its owner once the stream is
    /// closed or dropped.
    pub fn borrowed(
        disk: &'a mut D,
        fragments: impl Into<Arc<[Fragment]>>,
        geometry: StreamGeometry,
    ) -> Result<Self> {
        Self::with_handle(DiskHandle::Borrowed(disk), fragments.into(), geometry)
    }

    pub fn with_handle(
        disk: DiskHandle<'a, D>,
        fragments: Arc<[Fragment]>,
        geometry: StreamGeometry,
    ) -> Result<Self> {
        if geometry.cluster_size == 0 {
            return Err(NtfsError::CorruptRunList("cluster size of zero".into()));
        }
        validate_layout(&fragments, &geometry)?;
        debug!(
            "Stream of {} bytes over {} fragment(s), {} byte clusters, unit {} clusters, {} disk",
            geometry.length,
            fragments.len(),
            geometry.cluster_size,
            geometry.compression_unit_clusters,
            if disk.is_owned() { "owned" } else { "borrowed" },
        );
        Ok(Self {
            disk: Some(disk),
            fragments,
            geometry,
            position: 0,
            decompressor: Box::new(Lznt1::new(geometry.unit_bytes() as usize)),
            packed: Vec::new(),
            unit: Vec::new(),
            unit_vcn: None,
        })
    }

    /// Replace the LZNT1 codec, e.g. with an instrumented one.
    pub fn with_decompressor(mut self, mut decompressor: Box<dyn Decompressor + Send>) -> Self {
        decompressor.set_block_size(self.geometry.unit_bytes() as usize);
        self.decompressor = decompressor;
        self
    }

    pub fn len(&self) -> u64 {
        self.geometry.length
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn geometry(&self) -> &StreamGeometry {
        &self.geometry
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn is_closed(&self) -> bool {
        self.disk.is_none()
    }

    /// Release the disk handle. An owned disk is dropped here.
    pub fn close(&mut self) {
        if let Some(handle) = self.disk.take() {
            debug!(
                "Closing stream ({} disk)",
                if handle.is_owned() { "dropping owned" } else { "releasing borrowed" }
            );
        }
        self.unit_vcn = None;
    }

    /// Move the cursor; the target must lie within `0..=len()`.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.geometry.length as i128 + delta as i128,
        };
        if target < 0 || target > self.geometry.length as i128 {
            return Err(NtfsError::OutOfRange {
                target,
                length: self.geometry.length,
            });
        }
        self.position = target as u64;
        Ok(self.position)
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns 0 at the end of
    /// the stream; a short count means the device ran out.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.disk.is_none() {
            return Err(NtfsError::StreamClosed);
        }
        let mut done = 0;
        while done < buf.len() && self.position < self.geometry.length {
            let remaining = self.geometry.length - self.position;
            let want = (buf.len() - done).min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let produced = self.read_piece(&mut buf[done..done + want])?;
            if produced == 0 {
                break;
            }
            done += produced;
            self.position += produced as u64;
        }
        Ok(done)
    }

    /// Read exactly `buf.len()` bytes at `offset`, leaving the cursor after
    /// them.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        let got = self.read(buf)?;
        if got != buf.len() {
            return Err(NtfsError::DiskReadShortfall {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// The stream is read-only.
    pub fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(NtfsError::Unsupported("write to a read-only NTFS stream"))
    }

    /// Serve the start of `out` from the fragment under the cursor.
    fn read_piece(&mut self, out: &mut [u8]) -> Result<usize> {
        let pos = self.position;
        if pos >= self.geometry.initialized_length {
            out.fill(0);
            return Ok(out.len());
        }
        let initialized = self.geometry.initialized_length - pos;
        let (extent, available) = self.locate(pos)?;
        let n = (out.len() as u64).min(initialized).min(available) as usize;
        let out = &mut out[..n];

        match extent {
            Extent::Sparse => {
                out.fill(0);
                Ok(n)
            }
            Extent::Direct { disk_offset } => {
                let disk = self.disk.as_mut().ok_or(NtfsError::StreamClosed)?;
                let got = disk.get_mut().read_bytes(out, disk_offset)?;
                if got < n {
                    warn!(
                        "Short disk read at 0x{:X}: {} of {} bytes",
                        disk_offset, got, n
                    );
                }
                Ok(got)
            }
            Extent::Compressed {
                unit_vcn,
                lcn,
                real_clusters,
                offset_in_unit,
            } => self.read_compressed(unit_vcn, lcn, real_clusters, offset_in_unit, out),
        }
    }

    /// Find the fragment covering byte `pos`. Returns how to read it and how
    /// many bytes that path can serve in one go.
    fn locate(&self, pos: u64) -> Result<(Extent, u64)> {
        let cs = self.geometry.cluster_size;
        let fragment = self
            .fragments
            .iter()
            .find(|f| f.starting_vcn * cs <= pos && pos < f.next_vcn() * cs)
            .ok_or_else(|| {
                error!("No fragment maps stream offset {}", pos);
                NtfsError::CorruptRunList(format!("no fragment maps stream offset {pos}"))
            })?;

        let offset_in_fragment = pos - fragment.starting_vcn * cs;
        let fragment_bytes = fragment.virtual_cluster_count() * cs;

        if fragment.is_sparse() {
            return Ok((Extent::Sparse, fragment_bytes - offset_in_fragment));
        }
        if !fragment.is_compressed() {
            return Ok((
                Extent::Direct {
                    disk_offset: fragment.lcn * cs + offset_in_fragment,
                },
                fragment_bytes - offset_in_fragment,
            ));
        }

        // Only the last unit of a compressed fragment is compressed; the
        // units before it are fully backed and stored as is.
        let unit_clusters = self.geometry.compression_unit_clusters;
        let unit_bytes = unit_clusters * cs;
        let units = fragment.virtual_cluster_count().div_ceil(unit_clusters);
        let unit_index = offset_in_fragment / unit_bytes;
        let offset_in_unit = offset_in_fragment % unit_bytes;

        if unit_index + 1 < units {
            return Ok((
                Extent::Direct {
                    disk_offset: fragment.lcn * cs + offset_in_fragment,
                },
                unit_bytes - offset_in_unit,
            ));
        }

        let unit_start = unit_index * unit_clusters;
        let real_clusters = fragment
            .cluster_count
            .checked_sub(unit_start)
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                NtfsError::CorruptRunList(format!(
                    "compressed fragment at VCN {} has no data in its last unit",
                    fragment.starting_vcn
                ))
            })?;
        let unit_virtual = (fragment.virtual_cluster_count() - unit_start) * cs;
        Ok((
            Extent::Compressed {
                unit_vcn: fragment.starting_vcn + unit_start,
                lcn: fragment.lcn + unit_start,
                real_clusters,
                offset_in_unit,
            },
            unit_virtual - offset_in_unit,
        ))
    }

    fn read_compressed(
        &mut self,
        unit_vcn: u64,
        lcn: u64,
        real_clusters: u64,
        offset_in_unit: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let cs = self.geometry.cluster_size;
        let unit_bytes = self.geometry.unit_bytes() as usize;
        let offset_in_unit = offset_in_unit as usize;

        if self.unit_vcn == Some(unit_vcn) {
            out.copy_from_slice(&self.unit[offset_in_unit..offset_in_unit + out.len()]);
            return Ok(out.len());
        }

        let packed_len = (real_clusters * cs) as usize;
        self.packed.resize(packed_len, 0);
        let disk = self.disk.as_mut().ok_or(NtfsError::StreamClosed)?;
        let got = disk.get_mut().read_bytes(&mut self.packed, lcn * cs)?;
        if got < packed_len {
            warn!(
                "Compressed extent at LCN {} is short: {} of {} bytes",
                lcn, got, packed_len
            );
            return Ok(0);
        }

        if offset_in_unit == 0 && out.len() == unit_bytes {
            self.decompressor.decompress(&self.packed, out)?;
            return Ok(out.len());
        }

        self.unit.resize(unit_bytes, 0);
        self.unit_vcn = None;
        self.decompressor.decompress(&self.packed, &mut self.unit)?;
        self.unit_vcn = Some(unit_vcn);
        out.copy_from_slice(&self.unit[offset_in_unit..offset_in_unit + out.len()]);
        Ok(out.len())
    }
}

fn validate_layout(fragments: &[Fragment], geometry: &StreamGeometry) -> Result<()> {
    let cs = geometry.cluster_size;
    geometry
        .compression_unit_clusters
        .checked_mul(cs)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(|| {
            NtfsError::CorruptRunList(format!(
                "compression unit of {} clusters of {} bytes",
                geometry.compression_unit_clusters, cs
            ))
        })?;

    // every byte offset the reader derives must fit in a u64
    for f in fragments {
        let span = f
            .cluster_count
            .checked_add(u64::from(f.compressed_filler_clusters));
        let byte_end = |start: u64| {
            span.and_then(|n| start.checked_add(n))
                .and_then(|end| end.checked_mul(cs))
        };
        if byte_end(f.starting_vcn).is_none() || (!f.is_sparse() && byte_end(f.lcn).is_none()) {
            error!("Fragment {:?} overflows with {} byte clusters", f, cs);
            return Err(NtfsError::CorruptRunList(format!(
                "fragment at VCN {} of {} clusters at LCN {} exceeds the addressable range",
                f.starting_vcn, f.cluster_count, f.lcn
            )));
        }
    }

    if let Some(first) = fragments.first() {
        if first.starting_vcn != 0 {
            return Err(NtfsError::CorruptRunList(format!(
                "stream starts at VCN {} instead of 0",
                first.starting_vcn
            )));
        }
    }
    fragment::check_contiguous(fragments)?;
    if geometry.compression_unit_clusters == 0 && fragments.iter().any(Fragment::is_compressed) {
        return Err(NtfsError::CorruptRunList(
            "compressed fragment in an attribute without compression unit".into(),
        ));
    }
    Ok(())
}

impl<D: DiskReader> Read for LogicalStream<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        LogicalStream::read(self, buf).map_err(io::Error::from)
    }
}

impl<D: DiskReader> Seek for LogicalStream<'_, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        LogicalStream::seek(self, pos).map_err(io::Error::from)
    }
}

impl<D: DiskReader> Write for LogicalStream<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        LogicalStream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
