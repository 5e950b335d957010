// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Read-only NTFS access built around data runs: decoding and encoding of
//! run lists, their logical (compression-aware) form, and a random-access
//! stream over the clusters they describe, with LZNT1 decompression.

use std::collections::HashSet;
use std::io::{Read, Seek};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod compact;
pub mod disk;
pub mod error;
pub mod fragment;
pub mod lznt1;
pub mod mft;
pub mod pbs;
pub mod stream;
pub mod varrun;

pub use cache::{CacheKey, RecordCache};
pub use compact::{compact_compressed_fragments, compact_fragment_list};
pub use disk::{DiskHandle, DiskReader, SeekDisk};
pub use error::{NtfsError, Result};
pub use fragment::{Fragment, get_save_length, parse_fragments, save};
pub use stream::{LogicalStream, StreamGeometry};

use mft::{Attribute, AttributeListEntry, AttributeType, DirectoryEntry, MFTRecord, NonResidentHeader};
use pbs::PartitionBootSector;

/// Library-side knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct NtfsOptions {
    /// Parsed records kept in memory, 0 to disable.
    pub record_cache_capacity: usize,
    /// Reject run lists that disagree with their attribute's VCN range.
    pub verify_vcn_ranges: bool,
}

impl Default for NtfsOptions {
    fn default() -> Self {
        Self {
            record_cache_capacity: 256,
            verify_vcn_ranges: true,
        }
    }
}

/// Where the bytes of one attribute stream live.
#[derive(Debug, Clone)]
pub enum StreamData {
    Resident(Vec<u8>),
    NonResident {
        fragments: Vec<Fragment>,
        geometry: StreamGeometry,
    },
}

pub struct NTFS<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    disk: SeekDisk<T>,
    options: NtfsOptions,
    mft: Option<(Arc<[Fragment]>, StreamGeometry)>, // $MFT's own $DATA layout
    cache: RecordCache<MFTRecord>,
}

impl<T: Read + Seek> NTFS<T> {
    /// Create a new NTFS Object
    pub fn new(body: T) -> Result<Self> {
        Self::with_options(body, NtfsOptions::default())
    }

    pub fn with_options(body: T, options: NtfsOptions) -> Result<Self> {
        let mut disk = SeekDisk::new(body)?;
        let mut sector = vec![0u8; PartitionBootSector::SIZE];
        let got = disk.read_bytes(&mut sector, 0)?;
        if got < sector.len() {
            return Err(NtfsError::DiskReadShortfall {
                offset: 0,
                wanted: sector.len(),
                got,
            });
        }
        let pbs = PartitionBootSector::from_bytes(&sector)?;
        info!(
            "NTFS volume: {} byte clusters, {} byte records, $MFT at 0x{:X}",
            pbs.cluster_size(),
            pbs.file_record_size(),
            pbs.mft_address()
        );
        Ok(Self {
            pbs,
            disk,
            options,
            mft: None,
            cache: RecordCache::new(options.record_cache_capacity),
        })
    }

    pub fn options(&self) -> &NtfsOptions {
        &self.options
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn sector_size(&self) -> usize {
        self.pbs.bytes_per_sector as usize
    }

    fn geometry_of(&self, non_resident: &NonResidentHeader) -> Result<StreamGeometry> {
        Ok(StreamGeometry::new(
            self.pbs.cluster_size(),
            non_resident.compression_unit_clusters()?,
            non_resident.real_size,
        )
        .with_initialized_length(non_resident.initialized_size))
    }

    fn attribute_fragments(&self, non_resident: &NonResidentHeader, run_list: &[u8]) -> Result<Vec<Fragment>> {
        if self.options.verify_vcn_ranges {
            non_resident.fragments(run_list)
        } else {
            non_resident.fragments_lenient(run_list)
        }
    }

    /// Load the $MFT layout if not loaded yet.
    fn ensure_mft(&mut self) -> Result<(Arc<[Fragment]>, StreamGeometry)> {
        if let Some((fragments, geometry)) = &self.mft {
            return Ok((fragments.clone(), *geometry));
        }
        debug!("Loading $MFT layout from record 0");

        // record 0 is always in the first extent
        let rec_size = self.pbs.file_record_size() as usize;
        let mut buf = vec![0u8; rec_size];
        let offset = self.pbs.mft_address();
        let got = self.disk.read_bytes(&mut buf, offset)?;
        if got < rec_size {
            return Err(NtfsError::DiskReadShortfall {
                offset,
                wanted: rec_size,
                got,
            });
        }
        let rec0 = MFTRecord::from_bytes_with_sector_size(&buf, Some(0), self.sector_size())?;

        let (non_resident, run_list) = rec0
            .stream_attributes(AttributeType::Data, "")
            .into_iter()
            .find_map(|a| match a {
                Attribute::NonResident {
                    non_resident,
                    run_list,
                    ..
                } if non_resident.lowest_vcn == 0 => Some((non_resident, run_list)),
                _ => None,
            })
            .ok_or_else(|| NtfsError::NotFound("non-resident $DATA in $MFT record 0".into()))?;

        let geometry = self.geometry_of(non_resident)?;
        let first: Arc<[Fragment]> = self.attribute_fragments(non_resident, run_list)?.into();
        self.mft = Some((first.clone(), geometry));

        // A fragmented $MFT continues in extension records, which the first
        // extent is enough to reach.
        if !rec0
            .stream_attributes(AttributeType::AttributeList, "")
            .is_empty()
        {
            if let StreamData::NonResident { fragments, .. } =
                self.locate_stream(&rec0, AttributeType::Data, "")?
            {
                debug!("$MFT spans {} fragment(s) after attribute list", fragments.len());
                self.mft = Some((fragments.into(), geometry));
            }
        }
        let (fragments, geometry) = self.mft.clone().unwrap_or((first, geometry));
        debug!(
            "$MFT: {} bytes in {} fragment(s)",
            geometry.length,
            fragments.len()
        );
        Ok((fragments, geometry))
    }

    pub fn mft_records_count(&mut self) -> Result<u64> {
        let (_, geometry) = self.ensure_mft()?;
        Ok(geometry.length / self.pbs.file_record_size() as u64)
    }

    /// Fragments of $MFT's unnamed $DATA attribute.
    pub fn mft_fragments(&mut self) -> Result<Vec<Fragment>> {
        Ok(self.ensure_mft()?.0.to_vec())
    }

    pub fn get_file_id(&mut self, file_id: u64) -> Result<MFTRecord> {
        let key = CacheKey::record(file_id);
        if let Some(rec) = self.cache.get(&key) {
            debug!("MFT entry {} served from cache", file_id);
            return Ok(rec);
        }
        let (fragments, geometry) = self.ensure_mft()?;

        let rec_size = self.pbs.file_record_size() as u64;
        let offset = file_id
            .checked_mul(rec_size)
            .filter(|off| {
                off.checked_add(rec_size)
                    .is_some_and(|end| end <= geometry.length)
            })
            .ok_or_else(|| NtfsError::NotFound(format!("MFT entry {file_id}")))?;

        let mut buf = vec![0u8; rec_size as usize];
        let mut mft = LogicalStream::borrowed(&mut self.disk, fragments, geometry)?;
        mft.read_exact_at(offset, &mut buf)?;
        mft.close();

        debug!("MFT entry {} read from $MFT offset 0x{:X}", file_id, offset);
        let rec = MFTRecord::from_bytes_with_sector_size(&buf, Some(file_id), self.sector_size())?;
        self.cache.insert(key, rec.clone());
        Ok(rec)
    }

    /// Whole value of one attribute instance.
    fn attribute_value(&mut self, attr: &Attribute) -> Result<Vec<u8>> {
        match attr {
            Attribute::Resident { value, .. } => Ok(value.clone()),
            Attribute::NonResident {
                non_resident,
                run_list,
                ..
            } => {
                let fragments = self.attribute_fragments(non_resident, run_list)?;
                let geometry = self.geometry_of(non_resident)?;
                let mut out = zeroed(geometry.length)?;
                let mut stream = LogicalStream::borrowed(&mut self.disk, fragments, geometry)?;
                stream.read_exact_at(0, &mut out)?;
                Ok(out)
            }
        }
    }

    fn attribute_list(&mut self, record: &MFTRecord) -> Result<Vec<AttributeListEntry>> {
        let Some(list) = record
            .stream_attributes(AttributeType::AttributeList, "")
            .first()
            .map(|a| (*a).clone())
        else {
            return Ok(Vec::new());
        };
        let raw = self.attribute_value(&list)?;
        AttributeListEntry::parse_all(&raw)
    }

    /// Gather every instance of `attr_type:name`, following the attribute
    /// list into extension records, and join them into one layout.
    pub fn locate_stream(
        &mut self,
        record: &MFTRecord,
        attr_type: AttributeType,
        name: &str,
    ) -> Result<StreamData> {
        let mut instances: Vec<Attribute> = record
            .stream_attributes(attr_type, name)
            .into_iter()
            .cloned()
            .collect();

        let mut seen: HashSet<u64> = instances
            .iter()
            .filter_map(|a| match a {
                Attribute::NonResident { non_resident, .. } => Some(non_resident.lowest_vcn),
                Attribute::Resident { .. } => None,
            })
            .collect();
        for entry in self.attribute_list(record)? {
            let wanted = entry.attr_type == attr_type
                && entry.name.as_deref().unwrap_or("") == name
                && entry.record != record.id;
            if !wanted || seen.contains(&entry.lowest_vcn) {
                continue;
            }
            let extension = self.get_file_id(entry.record)?;
            for attr in extension.stream_attributes(attr_type, name) {
                if let Attribute::NonResident { non_resident, .. } = attr {
                    if non_resident.lowest_vcn == entry.lowest_vcn {
                        seen.insert(entry.lowest_vcn);
                        instances.push(attr.clone());
                    }
                }
            }
        }

        if let Some(Attribute::Resident { value, .. }) = instances.first() {
            return Ok(StreamData::Resident(value.clone()));
        }

        let mut parts: Vec<(&NonResidentHeader, &Vec<u8>)> = instances
            .iter()
            .filter_map(|a| match a {
                Attribute::NonResident {
                    non_resident,
                    run_list,
                    ..
                } => Some((non_resident, run_list)),
                Attribute::Resident { .. } => None,
            })
            .collect();
        parts.sort_by_key(|(nr, _)| nr.lowest_vcn);

        let Some((head, _)) = parts.first() else {
            return Err(NtfsError::NotFound(format!(
                "{:?} stream '{}' in MFT entry {}",
                attr_type, name, record.id
            )));
        };
        let geometry = self.geometry_of(head)?;

        let mut fragments = Vec::new();
        for (non_resident, run_list) in &parts {
            fragments.extend(self.attribute_fragments(non_resident, run_list)?);
        }
        compact_fragment_list(&mut fragments);
        fragment::check_contiguous(&fragments)?;
        debug!(
            "Stream {:?}:'{}' of entry {}: {} instance(s), {} fragment(s)",
            attr_type,
            name,
            record.id,
            parts.len(),
            fragments.len()
        );
        Ok(StreamData::NonResident {
            fragments,
            geometry,
        })
    }

    /// Logical fragments of the `$DATA` stream called `stream_name` ("" for
    /// the unnamed one). Empty for a resident stream.
    pub fn data_fragments(&mut self, record: &MFTRecord, stream_name: &str) -> Result<Vec<Fragment>> {
        match self.locate_stream(record, AttributeType::Data, stream_name)? {
            StreamData::Resident(_) => Ok(Vec::new()),
            StreamData::NonResident { fragments, .. } => Ok(fragments),
        }
    }

    /// Random access to a non-resident `$DATA` stream. The stream borrows
    /// the volume's disk until it is dropped.
    pub fn open_data_stream(
        &mut self,
        record: &MFTRecord,
        stream_name: &str,
    ) -> Result<LogicalStream<'_, SeekDisk<T>>> {
        match self.locate_stream(record, AttributeType::Data, stream_name)? {
            StreamData::Resident(_) => Err(NtfsError::Unsupported(
                "resident $DATA has no cluster stream",
            )),
            StreamData::NonResident {
                fragments,
                geometry,
            } => LogicalStream::borrowed(&mut self.disk, fragments, geometry),
        }
    }

    /// Read the unnamed $DATA stream of `record` and return its raw bytes.
    pub fn read_file(&mut self, record: &MFTRecord) -> Result<Vec<u8>> {
        self.read_stream(record, "")
    }

    /// Read a whole named (or unnamed, with "") $DATA stream.
    pub fn read_stream(&mut self, record: &MFTRecord, stream_name: &str) -> Result<Vec<u8>> {
        match self.locate_stream(record, AttributeType::Data, stream_name)? {
            StreamData::Resident(value) => Ok(value),
            StreamData::NonResident {
                fragments,
                geometry,
            } => {
                let mut out = zeroed(geometry.length)?;
                let mut stream = LogicalStream::borrowed(&mut self.disk, fragments, geometry)?;
                stream.read_exact_at(0, &mut out)?;
                Ok(out)
            }
        }
    }

    /// Read `length` bytes from the unnamed $DATA stream of `record`,
    /// starting at `offset`. Holes (sparse clusters) are returned as 0x00.
    pub fn read_file_slice(&mut self, record: &MFTRecord, offset: u64, length: usize) -> Result<Vec<u8>> {
        match self.locate_stream(record, AttributeType::Data, "")? {
            StreamData::Resident(value) => {
                if offset >= value.len() as u64 || length == 0 {
                    return Ok(Vec::new());
                }
                let start = offset as usize;
                let end = (start + length).min(value.len());
                Ok(value[start..end].to_vec())
            }
            StreamData::NonResident {
                fragments,
                geometry,
            } => {
                if offset >= geometry.length || length == 0 {
                    return Ok(Vec::new());
                }
                let wanted = (length as u64).min(geometry.length - offset) as usize;
                let mut out = vec![0u8; wanted];
                let mut stream = LogicalStream::borrowed(&mut self.disk, fragments, geometry)?;
                stream.read_exact_at(offset, &mut out)?;
                Ok(out)
            }
        }
    }

    /// Convenience wrapper: read the first `length` bytes of the file.
    pub fn read_file_prefix(&mut self, record: &MFTRecord, length: usize) -> Result<Vec<u8>> {
        self.read_file_slice(record, 0, length)
    }

    /// List every child entry of the directory whose MFT record is `dir_id`.
    /// Works for both small (resident) and large (non-resident) directories.
    pub fn list_dir(&mut self, dir_id: u64) -> Result<Vec<DirectoryEntry>> {
        let rec = self.get_file_id(dir_id)?;
        if !rec.is_dir() {
            return Err(NtfsError::NotFound(format!("directory at MFT entry {dir_id}")));
        }
        let mut entries = rec.directory_entries().unwrap_or_default();

        let has_allocation = !rec
            .stream_attributes(AttributeType::IndexAllocation, "$I30")
            .is_empty();
        if has_allocation {
            info!("Directory {} uses non-resident index – walking it", dir_id);
            if let StreamData::NonResident {
                fragments,
                geometry,
            } = self.locate_stream(&rec, AttributeType::IndexAllocation, "$I30")?
            {
                let idx_rec_size = rec.index_record_size(self.pbs.index_record_size()) as usize;
                let sector_size = self.sector_size();
                let mut buf = vec![0u8; idx_rec_size];
                let mut index = LogicalStream::borrowed(&mut self.disk, fragments, geometry)?;

                let mut offset = 0u64;
                while offset + idx_rec_size as u64 <= geometry.length {
                    index.read_exact_at(offset, &mut buf)?;
                    if let Some(found) = parse_index_record(&mut buf, sector_size, offset) {
                        entries.extend(found);
                    }
                    offset += idx_rec_size as u64;
                }
            }
        }

        let mut seen = HashSet::<(u64, String)>::new();
        entries.retain(|e| seen.insert((e.file_id, e.name.clone())));

        Ok(entries)
    }

    /// Record of the entry called `name` (case-insensitive) inside directory
    /// `dir_id`.
    pub fn lookup(&mut self, dir_id: u64, name: &str) -> Result<MFTRecord> {
        let key = CacheKey::named(dir_id, name);
        if let Some(rec) = self.cache.get(&key) {
            debug!("'{}' in directory {} served from cache", name, dir_id);
            return Ok(rec);
        }
        let wanted = name.to_uppercase();
        let entry = self
            .list_dir(dir_id)?
            .into_iter()
            .find(|e| e.name.to_uppercase() == wanted)
            .ok_or_else(|| NtfsError::NotFound(format!("'{name}' in directory {dir_id}")))?;
        let rec = self.get_file_id(entry.file_id)?;
        self.cache.insert(key, rec.clone());
        Ok(rec)
    }
}

/// Zero-filled buffer for a whole stream. The length comes from disk, so an
/// allocation failure is reported instead of aborting.
fn zeroed(length: u64) -> Result<Vec<u8>> {
    let invalid = || NtfsError::InvalidRecord(format!("stream of {length} bytes cannot be buffered"));
    let len = usize::try_from(length).map_err(|_| invalid())?;
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| invalid())?;
    out.resize(len, 0);
    Ok(out)
}

/// Entries of one `INDX` record, `None` when the record is unused or torn.
fn parse_index_record(buf: &mut [u8], sector_size: usize, offset: u64) -> Option<Vec<DirectoryEntry>> {
    if buf.len() < 0x20 || &buf[0..4] != b"INDX" {
        debug!("No INDX record at index offset 0x{:X}", offset);
        return None;
    }
    let usa_off = LittleEndian::read_u16(&buf[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&buf[6..8]) as usize;
    if let Err(e) = mft::apply_fixups(buf, usa_off, usa_count, sector_size) {
        warn!("Skipping index record at offset 0x{:X}: {}", offset, e);
        return None;
    }
    // INDEX_HEADER starts at 0x18, its offsets are relative to it
    let entries_offset = LittleEndian::read_u32(&buf[0x18..0x1C]) as usize;
    let entries_size = LittleEndian::read_u32(&buf[0x1C..0x20]) as usize;
    Some(mft::parse_index_entries(
        buf,
        0x18 + entries_offset,
        0x18 + entries_size,
    ))
}
