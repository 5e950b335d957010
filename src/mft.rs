// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::DateTime;
use log::{debug, error, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::compact::compact_compressed_fragments;
use crate::error::{NtfsError, Result};
use crate::fragment::{self, Fragment};

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub signature: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: u64,
    pub next_attr_id: u16,
}

/// Common header part for resident & non‑resident attributes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeHeaderCommon {
    pub attr_type: AttributeType,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
}

impl AttributeHeaderCommon {
    pub const FLAG_COMPRESSED: u16 = 0x0001;
    pub const FLAG_ENCRYPTED: u16 = 0x4000;
    pub const FLAG_SPARSE: u16 = 0x8000;

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::FLAG_COMPRESSED != 0
    }

    /// Same type and same (possibly empty) name.
    pub fn is_stream(&self, attr_type: AttributeType, name: &str) -> bool {
        self.attr_type == attr_type && self.name.as_deref().unwrap_or("") == name
    }
}

/// Additional 8‑byte header present only when the attribute is resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub resident_flags: u8, // 0 = indexed ($I30), 1 = normal
}

/// Additional header present only when the attribute is non‑resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    /// log2 of the clusters per compression unit, 0 when not compressed.
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
    /// Present on compressed attributes only.
    pub compressed_size: Option<u64>,
}

impl NonResidentHeader {
    /// Largest compression unit exponent accepted. Windows only writes 4;
    /// beyond 8 the filler of a unit no longer fits a fragment's `u8`.
    pub const MAX_COMPRESSION_UNIT: u16 = 8;

    pub fn compression_unit_clusters(&self) -> Result<u64> {
        match self.compression_unit {
            0 => Ok(0),
            exp if exp <= Self::MAX_COMPRESSION_UNIT => Ok(1u64 << exp),
            exp => Err(NtfsError::InvalidRecord(format!(
                "compression unit of 2^{} clusters",
                exp
            ))),
        }
    }

    /// Decode `run_list` against this header's VCN range. Compressed
    /// attributes come back in logical form (filler folded in).
    pub fn fragments(&self, run_list: &[u8]) -> Result<Vec<Fragment>> {
        let mut fragments = fragment::parse_fragments(
            run_list,
            run_list.len(),
            0,
            self.lowest_vcn,
            self.highest_vcn,
        )?;
        compact_compressed_fragments(&mut fragments, self.compression_unit_clusters()?);
        Ok(fragments)
    }

    /// Like [`fragments`](Self::fragments) but tolerates a run list that
    /// disagrees with the declared `highest_vcn`.
    pub fn fragments_lenient(&self, run_list: &[u8]) -> Result<Vec<Fragment>> {
        let (mut fragments, next_vcn) =
            fragment::parse_fragments_lenient(run_list, run_list.len(), 0, self.lowest_vcn)?;
        if next_vcn.wrapping_sub(1) != self.highest_vcn {
            warn!(
                "Run list ends at VCN {} but attribute declares {}; continuing",
                next_vcn.wrapping_sub(1),
                self.highest_vcn
            );
        }
        compact_compressed_fragments(&mut fragments, self.compression_unit_clusters()?);
        Ok(fragments)
    }
}

/// High‑level representation of a single attribute (header + payload).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Attribute {
    Resident {
        header: AttributeHeaderCommon,
        resident: ResidentHeader,
        value: Vec<u8>,
    },
    NonResident {
        header: AttributeHeaderCommon,
        non_resident: NonResidentHeader,
        run_list: Vec<u8>,
    },
}

impl Attribute {
    pub fn header(&self) -> &AttributeHeaderCommon {
        match self {
            Attribute::Resident { header, .. } | Attribute::NonResident { header, .. } => header,
        }
    }

    /// Logical size of the attribute value.
    pub fn size(&self) -> u64 {
        match self {
            Attribute::Resident { resident, .. } => resident.value_length as u64,
            Attribute::NonResident { non_resident, .. } => non_resident.real_size,
        }
    }

    /// Fragments of a non-resident attribute, `None` for a resident one.
    pub fn fragments(&self) -> Option<Result<Vec<Fragment>>> {
        match self {
            Attribute::Resident { .. } => None,
            Attribute::NonResident {
                non_resident,
                run_list,
                ..
            } => Some(non_resident.fragments(run_list)),
        }
    }
}

/// Represents an Alternate Data Stream (named $DATA attribute).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataStream {
    pub name: String,
    pub size: u64,
    pub resident: bool,
}

/// One entry of an $ATTRIBUTE_LIST: where an attribute instance lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttributeListEntry {
    pub attr_type: AttributeType,
    pub lowest_vcn: u64,
    pub record: u64,
    pub record_seq: u16,
    pub id: u16,
    pub name: Option<String>,
}

impl AttributeListEntry {
    /// Parse the whole $ATTRIBUTE_LIST value.
    pub fn parse_all(raw: &[u8]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off + 0x1A <= raw.len() {
            let mut cur = Cursor::new(&raw[off..]);
            let type_code = cur.read_u32::<LittleEndian>()?;
            let entry_len = cur.read_u16::<LittleEndian>()? as usize;
            let name_len = cur.read_u8()? as usize;
            let name_off = cur.read_u8()? as usize;
            let lowest_vcn = cur.read_u64::<LittleEndian>()?;
            let reference = cur.read_u64::<LittleEndian>()?;
            let id = cur.read_u16::<LittleEndian>()?;
            if entry_len < 0x1A || off + entry_len > raw.len() {
                return Err(NtfsError::InvalidRecord(format!(
                    "attribute list entry of {entry_len} bytes at offset {off}"
                )));
            }
            let name = if name_len > 0 {
                let start = off + name_off;
                let end = start + name_len * 2;
                if end > off + entry_len {
                    return Err(NtfsError::InvalidRecord(
                        "attribute list name outside its entry".into(),
                    ));
                }
                Some(decode_utf16(&raw[start..end]))
            } else {
                None
            };
            out.push(AttributeListEntry {
                attr_type: AttributeType::from(type_code),
                lowest_vcn,
                record: reference & 0x0000_FFFF_FFFF_FFFF,
                record_seq: (reference >> 48) as u16,
                id,
                name,
            });
            off += entry_len;
        }
        Ok(out)
    }
}

/// A fully parsed MFT record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MFTRecord {
    pub id: u64,
    pub header: FileRecordHeader,
    pub attributes: Vec<Attribute>,
}

// At the end of every sector NTFS overwrites the last two bytes with the Update‑Sequence Number (USN).
pub(crate) fn apply_fixups(
    buf: &mut [u8],
    usa_offset: usize,
    usa_count: usize,
    sector_size: usize,
) -> Result<()> {
    if usa_offset + 2 * usa_count > buf.len() {
        warn!("Incomplete multi-sector transfer, corrupted record.");
        return Err(NtfsError::InvalidRecord("USA table outside record".into()));
    }
    if usa_count < 1 {
        return Ok(());
    }

    let usn = [buf[usa_offset], buf[usa_offset + 1]];

    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        if sector_end + 2 > buf.len() {
            return Err(NtfsError::InvalidRecord(format!(
                "sector {} ends after record",
                i
            )));
        }
        if buf[sector_end] != usn[0] || buf[sector_end + 1] != usn[1] {
            return Err(NtfsError::InvalidRecord(format!("bad USN at sector {}", i)));
        }
        let fix_pos = usa_offset + 2 * i;
        buf[sector_end] = buf[fix_pos];
        buf[sector_end + 1] = buf[fix_pos + 1];
    }
    debug!("Applied {} update sequence fixup(s).", usa_count - 1);
    Ok(())
}

impl MFTRecord {
    /// Parse a raw record (512 byte sectors).
    pub fn from_bytes(raw: &[u8], identifier: Option<u64>) -> Result<Self> {
        Self::from_bytes_with_sector_size(raw, identifier, 512)
    }

    pub fn from_bytes_with_sector_size(
        raw: &[u8],
        identifier: Option<u64>,
        sector_size: usize,
    ) -> Result<Self> {
        // we need a mutable copy so we can patch the USNs in‑place
        let mut buf = raw.to_vec();

        let header = parse_header(&mut Cursor::new(&buf))?;
        apply_fixups(
            &mut buf,
            header.usa_offset as usize,
            header.usa_count as usize,
            sector_size,
        )?;

        let in_use = (header.bytes_in_use as usize).min(buf.len()) as u64;
        let mut cursor = Cursor::new(&buf);
        cursor.set_position(header.attrs_offset.into());

        let mut attributes = Vec::new();
        loop {
            /* stop if fewer than 4 bytes remain */
            if cursor.position() + 4 > in_use {
                break;
            }
            let attr_type_num = cursor.read_u32::<LittleEndian>()?;
            if attr_type_num == 0xFFFFFFFF {
                break;
            }
            cursor.seek(SeekFrom::Current(-4))?;
            let attr = parse_attribute(&mut cursor, AttributeType::from(attr_type_num), in_use)?;
            attributes.push(attr);
        }

        Ok(MFTRecord {
            id: identifier.unwrap_or(0),
            header,
            attributes,
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.header.flags & 0x0001 != 0
    }

    pub fn is_dir(&self) -> bool {
        self.header.flags & 0x0002 != 0
    }

    /// Base record of an extension record, `None` for base records.
    pub fn base_record(&self) -> Option<u64> {
        let base = self.header.base_file_record & 0x0000_FFFF_FFFF_FFFF;
        (base != 0).then_some(base)
    }

    fn resident_value(&self, attr_type: AttributeType) -> Option<&Vec<u8>> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Resident { value, header, .. } if header.attr_type == attr_type => {
                Some(value)
            }
            _ => None,
        })
    }

    /// Every instance of the stream `attr_type:name` held by this record.
    pub fn stream_attributes(&self, attr_type: AttributeType, name: &str) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.header().is_stream(attr_type, name))
            .collect()
    }

    /// Parsed $ATTRIBUTE_LIST when it is resident, `None` when absent.
    /// A non-resident list is read by the volume layer.
    pub fn attribute_list(&self) -> Option<Result<Vec<AttributeListEntry>>> {
        self.resident_value(AttributeType::AttributeList)
            .map(|v| AttributeListEntry::parse_all(v))
    }

    /// List every $FILE_NAME attribute found (there may be 2 – long & DOS).
    pub fn file_names(&self) -> Vec<FileNameAttr> {
        self.attributes
            .iter()
            .filter_map(|a| {
                if let Attribute::Resident { value, header, .. } = a {
                    (header.attr_type == AttributeType::FileName)
                        .then(|| FileNameAttr::parse(value))
                } else {
                    None
                }
            })
            .flatten()
            .collect()
    }

    /// Return the first Win32 (or POSIX) name, falling back to any name.
    pub fn primary_name(&self) -> Option<String> {
        let names = self.file_names();
        names
            .iter()
            .find(|f| f.namespace != FileNameAttr::NAMESPACE_DOS)
            .or(names.first())
            .map(|f| f.name.clone())
    }

    /// Parent directory MFT reference (from the first $FILE_NAME attribute).
    pub fn parent_file_id(&self) -> Option<u64> {
        self.file_names().first().map(|f| f.parent_ref)
    }

    /// Extract Alternate Data Streams (named $DATA attributes).
    pub fn alternate_data_streams(&self) -> Vec<DataStream> {
        self.attributes
            .iter()
            .filter_map(|a| {
                let header = a.header();
                (header.attr_type == AttributeType::Data && header.name_length > 0).then(|| {
                    DataStream {
                        name: header.name.clone().unwrap_or_default(),
                        size: a.size(),
                        resident: matches!(a, Attribute::Resident { .. }),
                    }
                })
            })
            .collect()
    }

    /// Fetch directory entries held by the resident $INDEX_ROOT.
    pub fn directory_entries(&self) -> Option<Vec<DirectoryEntry>> {
        if !self.is_dir() {
            return None;
        }
        parse_index_root(self.resident_value(AttributeType::IndexRoot)?)
    }

    /// Size of an index‑record for large directories.
    pub fn index_record_size(&self, default: u32) -> u32 {
        if let Some(root) = self.resident_value(AttributeType::IndexRoot) {
            if root.len() >= 0x0C {
                let mut c = Cursor::new(root);
                c.set_position(8);
                if let Ok(sz) = c.read_u32::<LittleEndian>() {
                    if sz.is_power_of_two() && (512..=65_536).contains(&sz) {
                        return sz;
                    }
                }
            }
        }
        default
    }

    /// Serialize to JSON (uses `serde`).
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "header": &self.header,
            "attributes": &self.attributes,
            "file_names": self.file_names().into_iter().map(|f| f.to_json()).collect::<Vec<_>>(),
            "ads": self.alternate_data_streams(),
        })
    }
}

const RECORD_FLAGS: &[(u32, &str)] = &[
    (0x0001, "Allocated"),
    (0x0002, "Directory"),
    (0x0004, "System"),
    (0x0008, "Bad"),
];

const FILE_ATTRIBUTE_FLAGS: &[(u32, &str)] = &[
    (0x0001, "READONLY"),
    (0x0002, "HIDDEN"),
    (0x0004, "SYSTEM"),
    (0x0020, "ARCHIVE"),
    (0x0100, "TEMPORARY"),
    (0x0200, "SPARSE_FILE"),
    (0x0400, "REPARSE_POINT"),
    (0x0800, "COMPRESSED"),
    (0x1000, "OFFLINE"),
    (0x2000, "NOT_CONTENT_INDEXED"),
    (0x4000, "ENCRYPTED"),
];

fn flags_to_string(flags: u32, names: &[(u32, &str)]) -> String {
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "None".to_string()
    } else {
        set.join(" | ")
    }
}

impl fmt::Display for MFTRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entry = Table::new();
        entry.add_row(row!["MFT Entry", self.id]);
        entry.add_row(row![b -> "Sequence", self.header.sequence_number]);
        entry.add_row(row![b -> "$LogFile LSN", self.header.lsn]);
        entry.add_row(row![b -> "Flags", flags_to_string(self.header.flags.into(), RECORD_FLAGS)]);
        entry.add_row(row![b -> "Hard links", self.header.hard_link_count]);
        entry.add_row(row![b -> "Used / allocated", format!("{} / {}", self.header.bytes_in_use, self.header.bytes_allocated)]);
        if let Some(base) = self.base_record() {
            entry.add_row(row![b -> "Base record", base]);
        }
        if let Some(name) = self.primary_name() {
            entry.add_row(row![b -> "Name", name]);
        }
        if let Some(parent) = self.parent_file_id() {
            entry.add_row(row![b -> "Parent", parent]);
        }
        if let Some(si) = self
            .resident_value(AttributeType::StandardInformation)
            .and_then(|v| StandardInformation::from_bytes(v))
        {
            let t = &si.times;
            entry.add_row(row![b -> "Created", t.created]);
            entry.add_row(row![b -> "Modified", t.modified]);
            entry.add_row(row![b -> "MFT modified", t.mft_modified]);
            entry.add_row(row![b -> "Accessed", t.accessed]);
            entry.add_row(row![b -> "File attributes", flags_to_string(si.file_attrs, FILE_ATTRIBUTE_FLAGS)]);
        }
        writeln!(f, "{}", entry)?;

        let mut attrs = Table::new();
        attrs.add_row(row!["Type", "#", "Name", "Form", "Size", "VCNs"]);
        for a in &self.attributes {
            let header = a.header();
            let (form, vcns) = match a {
                Attribute::Resident { .. } => ("resident".to_string(), "‑".to_string()),
                Attribute::NonResident { non_resident, .. } => (
                    match non_resident.compression_unit_clusters() {
                        Ok(0) => "non‑resident".to_string(),
                        Ok(unit) => format!("compressed, {} cluster units", unit),
                        Err(_) => format!("bad compression unit 2^{}", non_resident.compression_unit),
                    },
                    format!("{}..={}", non_resident.lowest_vcn, non_resident.highest_vcn),
                ),
            };
            attrs.add_row(row![
                format!("{:?} (0x{:X})", header.attr_type, header.attr_type.code()),
                header.id,
                header.name.as_deref().unwrap_or(""),
                form,
                a.size(),
                vcns
            ]);
        }
        writeln!(f, "{}", attrs)?;

        for a in &self.attributes {
            let Some(fragments) = a.fragments() else {
                continue;
            };
            let header = a.header();
            write!(f, "Data runs of {:?}", header.attr_type)?;
            if let Some(name) = &header.name {
                write!(f, ":{}", name)?;
            }
            match fragments {
                Ok(fragments) => {
                    writeln!(f)?;
                    writeln!(f, "{}", fragments_to_string(&fragments, None))?;
                }
                Err(e) => writeln!(f, ": undecodable ({})", e)?,
            }
        }
        Ok(())
    }
}

/// Render a fragment list as a table (one row per run). The disk offset
/// column is left out when `cluster_size` is `None`.
pub fn fragments_to_string(fragments: &[Fragment], cluster_size: Option<u64>) -> String {
    let mut t = Table::new();
    let mut titles = row!["VCN", "Clusters", "Filler", "LCN", "Kind"];
    if cluster_size.is_some() {
        titles.add_cell(prettytable::Cell::new("Disk offset"));
    }
    t.add_row(titles);
    for f in fragments {
        let kind = if f.is_sparse() {
            "sparse"
        } else if f.is_compressed() {
            "compressed"
        } else {
            "data"
        };
        let mut r = row![
            f.starting_vcn,
            f.cluster_count,
            f.compressed_filler_clusters,
            if f.is_sparse() { "‑".to_string() } else { f.lcn.to_string() },
            kind
        ];
        if let Some(cs) = cluster_size {
            let disk = if f.is_sparse() {
                "‑".to_string()
            } else {
                format!("0x{:X}", f.lcn * cs)
            };
            r.add_cell(prettytable::Cell::new(&disk));
        }
        t.add_row(r);
    }
    t.to_string()
}

/*  Private helpers  */

fn parse_header<R: Read + Seek>(cursor: &mut R) -> Result<FileRecordHeader> {
    let mut signature = [0u8; 4];
    cursor.read_exact(&mut signature)?;
    if &signature != b"FILE" {
        error!(
            "Record signature is not 'FILE', found: {}",
            String::from_utf8_lossy(&signature)
        );
        return Err(NtfsError::InvalidRecord(
            "record signature is not 'FILE'".into(),
        ));
    }
    let usa_offset = cursor.read_u16::<LittleEndian>()?;
    let usa_count = cursor.read_u16::<LittleEndian>()?;
    let lsn = cursor.read_u64::<LittleEndian>()?;
    let sequence_number = cursor.read_u16::<LittleEndian>()?;
    let hard_link_count = cursor.read_u16::<LittleEndian>()?;
    let attrs_offset = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let bytes_in_use = cursor.read_u32::<LittleEndian>()?;
    let bytes_allocated = cursor.read_u32::<LittleEndian>()?;
    let base_file_record = cursor.read_u64::<LittleEndian>()?;
    let next_attr_id = cursor.read_u16::<LittleEndian>()?;
    Ok(FileRecordHeader {
        signature,
        usa_offset,
        usa_count,
        lsn,
        sequence_number,
        hard_link_count,
        attrs_offset,
        flags,
        bytes_in_use,
        bytes_allocated,
        base_file_record,
        next_attr_id,
    })
}

fn parse_attribute(
    cursor: &mut Cursor<&Vec<u8>>,
    attr_type: AttributeType,
    in_use: u64,
) -> Result<Attribute> {
    let start_pos = cursor.position();

    cursor.seek(SeekFrom::Current(4))?;
    let length = cursor.read_u32::<LittleEndian>()?;
    if length < 0x18 || start_pos + u64::from(length) > in_use {
        return Err(NtfsError::InvalidRecord(format!(
            "attribute {:?} at 0x{:X} has length {}",
            attr_type, start_pos, length
        )));
    }
    let end_pos = start_pos + u64::from(length);
    let buf: &[u8] = *cursor.get_ref();
    let slice = |offset: u64, len: u64| -> Result<&[u8]> {
        let from = start_pos + offset;
        let to = from + len;
        if to > end_pos {
            return Err(NtfsError::InvalidRecord(format!(
                "{:?} payload 0x{:X}..0x{:X} outside attribute ending at 0x{:X}",
                attr_type, from, to, end_pos
            )));
        }
        Ok(&buf[from as usize..to as usize])
    };

    let non_resident = cursor.read_u8()? != 0;
    let name_length = cursor.read_u8()?;
    let name_offset = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let id = cursor.read_u16::<LittleEndian>()?;

    let name = if name_length > 0 {
        Some(decode_utf16(slice(
            u64::from(name_offset),
            u64::from(name_length) * 2,
        )?))
    } else {
        None
    };

    let common = AttributeHeaderCommon {
        attr_type,
        length,
        non_resident,
        name_length,
        name_offset,
        flags,
        id,
        name,
    };

    let attr = if !non_resident {
        let value_length = cursor.read_u32::<LittleEndian>()?;
        let value_offset = cursor.read_u16::<LittleEndian>()?;
        let resident_flags = cursor.read_u8()?;
        let value = slice(u64::from(value_offset), u64::from(value_length))?.to_vec();
        Attribute::Resident {
            header: common,
            resident: ResidentHeader {
                value_length,
                value_offset,
                resident_flags,
            },
            value,
        }
    } else {
        let lowest_vcn = cursor.read_u64::<LittleEndian>()?;
        let highest_vcn = cursor.read_u64::<LittleEndian>()?;
        let mapping_pairs_offset = cursor.read_u16::<LittleEndian>()?;
        let compression_unit = cursor.read_u16::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?;
        let allocated_size = cursor.read_u64::<LittleEndian>()?;
        let real_size = cursor.read_u64::<LittleEndian>()?;
        let initialized_size = cursor.read_u64::<LittleEndian>()?;
        let compressed_size = if compression_unit != 0 && mapping_pairs_offset >= 0x48 {
            Some(cursor.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let run_list_len = u64::from(length).saturating_sub(u64::from(mapping_pairs_offset));
        let run_list = slice(u64::from(mapping_pairs_offset), run_list_len)?.to_vec();
        Attribute::NonResident {
            header: common,
            non_resident: NonResidentHeader {
                lowest_vcn,
                highest_vcn,
                mapping_pairs_offset,
                compression_unit,
                allocated_size,
                real_size,
                initialized_size,
                compressed_size,
            },
            run_list,
        }
    };

    cursor.set_position(end_pos);
    Ok(attr)
}

fn decode_utf16(raw: &[u8]) -> String {
    String::from_utf16_lossy(
        &raw.chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect::<Vec<_>>(),
    )
}

/// Attribute type codes. Codes this crate does not know are kept as
/// `Unknown` so their bytes survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    EaInformation,
    Ea,
    PropertySet,
    LoggedUtilityStream,
    Unknown(u32),
}

impl AttributeType {
    pub fn code(self) -> u32 {
        use AttributeType::*;
        match self {
            StandardInformation => 0x10,
            AttributeList => 0x20,
            FileName => 0x30,
            ObjectId => 0x40,
            SecurityDescriptor => 0x50,
            VolumeName => 0x60,
            VolumeInformation => 0x70,
            Data => 0x80,
            IndexRoot => 0x90,
            IndexAllocation => 0xA0,
            Bitmap => 0xB0,
            ReparsePoint => 0xC0,
            EaInformation => 0xD0,
            Ea => 0xE0,
            PropertySet => 0xF0,
            LoggedUtilityStream => 0x100,
            Unknown(code) => code,
        }
    }
}

impl From<u32> for AttributeType {
    fn from(value: u32) -> Self {
        use AttributeType::*;
        match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            other => {
                debug!("Unknown attribute type 0x{:X}", other);
                Unknown(other)
            }
        }
    }
}

/// 100 ns ticks between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_EPOCH: i128 = 116_444_736_000_000_000;

fn filetime_to_datetime(ft: u64) -> String {
    let ticks = i128::from(ft) - FILETIME_UNIX_EPOCH;
    let secs = ticks.div_euclid(10_000_000) as i64;
    let nanos = (ticks.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// The four FILETIMEs that open both $STANDARD_INFORMATION and $FILE_NAME
/// (after the parent reference for the latter).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: String,
    pub modified: String,
    pub mft_modified: String,
    pub accessed: String,
}

impl Timestamps {
    fn read(cur: &mut Cursor<&[u8]>) -> Option<Self> {
        let mut next = || cur.read_u64::<LittleEndian>().ok().map(filetime_to_datetime);
        Some(Self {
            created: next()?,
            modified: next()?,
            mft_modified: next()?,
            accessed: next()?,
        })
    }
}

/// Parsed $STANDARD_INFORMATION (covers v0 & v1, optionally v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardInformation {
    #[serde(flatten)]
    pub times: Timestamps,
    pub file_attrs: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
}

impl StandardInformation {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 0x30 {
            return None;
        }
        let mut cur = Cursor::new(raw);
        let times = Timestamps::read(&mut cur)?;
        let file_attrs = cur.read_u32::<LittleEndian>().ok()?;
        // owner and security ids only exist in the 0x48-byte NTFS 3.x layout
        cur.set_position(0x30);
        Some(Self {
            times,
            file_attrs,
            owner_id: cur.read_u32::<LittleEndian>().ok(),
            security_id: cur.read_u32::<LittleEndian>().ok(),
        })
    }
}

/// Parsed $FILE_NAME attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNameAttr {
    pub parent_ref: u64,
    pub parent_seq: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub name: String,
    pub namespace: u8,
    pub flags: u32,
    #[serde(flatten)]
    pub times: Timestamps,
}

impl FileNameAttr {
    pub const NAMESPACE_DOS: u8 = 2;

    pub(crate) fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 66 {
            return None;
        }
        let mut cur = Cursor::new(raw);
        let parent_raw = cur.read_u64::<LittleEndian>().ok()?;
        let parent_ref = parent_raw & 0x0000_FFFF_FFFF_FFFF;
        let parent_seq = (parent_raw >> 48) as u16;
        let times = Timestamps::read(&mut cur)?;
        let allocated_size = cur.read_u64::<LittleEndian>().ok()?;
        let real_size = cur.read_u64::<LittleEndian>().ok()?;
        let flags = cur.read_u32::<LittleEndian>().ok()?;
        cur.read_u32::<LittleEndian>().ok()?; // reparse value
        let name_len = cur.read_u8().ok()? as usize;
        let namespace = cur.read_u8().ok()?;
        let name_off = 66;
        if raw.len() < name_off + name_len * 2 {
            return None;
        }
        let name = decode_utf16(&raw[name_off..name_off + name_len * 2]);
        Some(Self {
            parent_ref,
            parent_seq,
            allocated_size,
            real_size,
            name,
            namespace,
            flags,
            times,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "parent": self.parent_ref,
            "allocated": self.allocated_size,
            "size": self.real_size,
            "created": self.times.created,
            "modified": self.times.modified,
            "mft_modified": self.times.mft_modified,
            "accessed": self.times.accessed,
            "flags": self.flags,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub file_id: u64,
    pub name: String,
    pub namespace: u8,
    pub flags: u8,
}

impl DirectoryEntry {
    pub const FLAG_LAST: u8 = 0x02;

    /// Parse one index entry. Returns the entry (`None` for the key-less
    /// last entry) and its length.
    pub fn from_slice(slice: &[u8]) -> Option<(Option<Self>, u8, usize)> {
        if slice.len() < 0x10 {
            return None;
        }
        let mut cur = Cursor::new(slice);
        let file_ref = cur.read_u64::<LittleEndian>().ok()?;
        let entry_len = cur.read_u16::<LittleEndian>().ok()? as usize;
        let key_len = cur.read_u16::<LittleEndian>().ok()? as usize;
        let flags = cur.read_u8().ok()?;
        if entry_len < 0x10 {
            return None;
        }
        let key_start = 0x10;
        if key_len == 0 || slice.len() < key_start + key_len {
            return Some((None, flags, entry_len));
        }
        let fname = FileNameAttr::parse(&slice[key_start..key_start + key_len])?;
        Some((
            Some(DirectoryEntry {
                file_id: file_ref & 0x0000_FFFF_FFFF_FFFF,
                name: fname.name,
                namespace: fname.namespace,
                flags,
            }),
            flags,
            entry_len,
        ))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Walk index entries in `raw[start..end]`, skipping "." and "..".
pub(crate) fn parse_index_entries(raw: &[u8], start: usize, end: usize) -> Vec<DirectoryEntry> {
    let end = end.min(raw.len());
    let mut off = start;
    let mut out = Vec::new();
    while off + 0x10 <= end {
        let Some((entry, flags, consumed)) = DirectoryEntry::from_slice(&raw[off..end]) else {
            break;
        };
        if let Some(entry) = entry {
            if entry.name != "." && entry.name != ".." {
                out.push(entry);
            }
        }
        if flags & DirectoryEntry::FLAG_LAST != 0 {
            break;
        }
        off += consumed;
    }
    out
}

fn parse_index_root(raw: &[u8]) -> Option<Vec<DirectoryEntry>> {
    if raw.len() < 0x20 {
        return None;
    }
    let mut cur = Cursor::new(raw);
    cur.set_position(0x10);
    let entries_offset = cur.read_u32::<LittleEndian>().ok()? as usize;
    let total_size = cur.read_u32::<LittleEndian>().ok()? as usize;
    let start = 0x10 + entries_offset;
    Some(parse_index_entries(raw, start, 0x10 + total_size))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builder for synthetic FILE records used across the crate's tests.
    pub(crate) struct RecordBuilder {
        attrs: Vec<u8>,
        flags: u16,
        base: u64,
        next_id: u16,
    }

    impl RecordBuilder {
        pub(crate) const SIZE: usize = 1024;

        pub(crate) fn new(flags: u16) -> Self {
            Self {
                attrs: Vec::new(),
                flags,
                base: 0,
                next_id: 0,
            }
        }

        pub(crate) fn extension_of(mut self, base: u64) -> Self {
            self.base = base;
            self
        }

        fn header(&mut self, code: u32, len: usize, non_resident: bool, name: &str) -> Vec<u8> {
            let mut a = vec![0u8; len];
            a[0..4].copy_from_slice(&code.to_le_bytes());
            a[4..8].copy_from_slice(&(len as u32).to_le_bytes());
            a[8] = non_resident as u8;
            a[9] = name.encode_utf16().count() as u8;
            a[14..16].copy_from_slice(&self.next_id.to_le_bytes());
            self.next_id += 1;
            a
        }

        pub(crate) fn resident(mut self, code: u32, name: &str, value: &[u8]) -> Self {
            let name16: Vec<u8> = name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
            let value_off = (0x18 + name16.len() + 7) & !7;
            let len = (value_off + value.len() + 7) & !7;
            let mut a = self.header(code, len, false, name);
            a[10..12].copy_from_slice(&0x18u16.to_le_bytes());
            a[0x18..0x18 + name16.len()].copy_from_slice(&name16);
            a[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
            a[20..22].copy_from_slice(&(value_off as u16).to_le_bytes());
            a[value_off..value_off + value.len()].copy_from_slice(value);
            self.attrs.extend(a);
            self
        }

        #[allow(clippy::too_many_arguments)]
        pub(crate) fn non_resident(
            mut self,
            code: u32,
            name: &str,
            lowest_vcn: u64,
            highest_vcn: u64,
            compression_unit: u16,
            size: u64,
            run_list: &[u8],
        ) -> Self {
            let name16: Vec<u8> = name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
            let fixed = if compression_unit != 0 { 0x48 } else { 0x40 };
            let runs_off = (fixed + name16.len() + 7) & !7;
            let len = (runs_off + run_list.len() + 7) & !7;
            let mut a = self.header(code, len, true, name);
            a[10..12].copy_from_slice(&(fixed as u16).to_le_bytes());
            a[fixed..fixed + name16.len()].copy_from_slice(&name16);
            if compression_unit != 0 {
                a[12..14].copy_from_slice(&AttributeHeaderCommon::FLAG_COMPRESSED.to_le_bytes());
            }
            a[0x10..0x18].copy_from_slice(&lowest_vcn.to_le_bytes());
            a[0x18..0x20].copy_from_slice(&highest_vcn.to_le_bytes());
            a[0x20..0x22].copy_from_slice(&(runs_off as u16).to_le_bytes());
            a[0x22..0x24].copy_from_slice(&compression_unit.to_le_bytes());
            a[0x28..0x30].copy_from_slice(&size.next_multiple_of(4096).to_le_bytes());
            a[0x30..0x38].copy_from_slice(&size.to_le_bytes());
            a[0x38..0x40].copy_from_slice(&size.to_le_bytes());
            a[runs_off..runs_off + run_list.len()].copy_from_slice(run_list);
            self.attrs.extend(a);
            self
        }

        /// Serialize with the update sequence array applied.
        pub(crate) fn build(self) -> Vec<u8> {
            let mut rec = vec![0u8; Self::SIZE];
            rec[0..4].copy_from_slice(b"FILE");
            rec[4..6].copy_from_slice(&0x30u16.to_le_bytes()); // usa offset
            rec[6..8].copy_from_slice(&3u16.to_le_bytes()); // usn + 2 sectors
            rec[0x10..0x12].copy_from_slice(&1u16.to_le_bytes());
            rec[0x12..0x14].copy_from_slice(&1u16.to_le_bytes());
            rec[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
            rec[0x16..0x18].copy_from_slice(&self.flags.to_le_bytes());
            rec[0x20..0x28].copy_from_slice(&self.base.to_le_bytes());
            let end = 0x38 + self.attrs.len();
            rec[0x38..end].copy_from_slice(&self.attrs);
            rec[end..end + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            rec[0x18..0x1C].copy_from_slice(&((end + 8) as u32).to_le_bytes());
            rec[0x1C..0x20].copy_from_slice(&(Self::SIZE as u32).to_le_bytes());

            // protect the tail of each sector with USN 0x0001
            rec[0x30..0x32].copy_from_slice(&1u16.to_le_bytes());
            for i in 1..=2usize {
                let tail = i * 512 - 2;
                let saved = [rec[tail], rec[tail + 1]];
                rec[0x30 + 2 * i..0x32 + 2 * i].copy_from_slice(&saved);
                rec[tail..tail + 2].copy_from_slice(&1u16.to_le_bytes());
            }
            rec
        }
    }

    pub(crate) fn file_name_value(parent: u64, name: &str, namespace: u8) -> Vec<u8> {
        let mut v = vec![0u8; 66];
        v[0..8].copy_from_slice(&(parent | (1u64 << 48)).to_le_bytes());
        v[64] = name.encode_utf16().count() as u8;
        v[65] = namespace;
        v.extend(name.encode_utf16().flat_map(|c| c.to_le_bytes()));
        v
    }

    #[test]
    fn record_with_compressed_data_attribute() {
        let raw = RecordBuilder::new(0x0001)
            .resident(0x30, "", &file_name_value(5, "notes.txt", 1))
            .non_resident(0x80, "", 0, 15, 4, 40_000, &[0x21, 0x02, 0xEF, 0x07, 0x01, 0x0E, 0x00])
            .build();
        let rec = MFTRecord::from_bytes(&raw, Some(42)).unwrap();
        assert_eq!(rec.id, 42);
        assert_eq!(rec.primary_name().as_deref(), Some("notes.txt"));
        assert_eq!(rec.parent_file_id(), Some(5));

        let data = rec.stream_attributes(AttributeType::Data, "");
        assert_eq!(data.len(), 1);
        assert!(data[0].header().is_compressed());
        let Attribute::NonResident { non_resident, .. } = data[0] else {
            panic!("expected non-resident $DATA");
        };
        assert_eq!(non_resident.compression_unit_clusters().unwrap(), 16);
        assert!(non_resident.compressed_size.is_some());

        let frags = data[0].fragments().unwrap().unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].lcn, 2031);
        assert_eq!(frags[0].compressed_filler_clusters, 14);
    }

    #[test]
    fn oversized_compression_unit_is_an_error() {
        let raw = RecordBuilder::new(0x0001)
            .non_resident(0x80, "", 0, 15, 64, 40_000, &[0x21, 0x02, 0xEF, 0x07, 0x01, 0x0E, 0x00])
            .build();
        let rec = MFTRecord::from_bytes(&raw, Some(7)).unwrap();
        let data = rec.stream_attributes(AttributeType::Data, "");
        let Attribute::NonResident { non_resident, .. } = data[0] else {
            panic!("expected non-resident $DATA");
        };
        assert!(matches!(
            non_resident.compression_unit_clusters(),
            Err(NtfsError::InvalidRecord(_))
        ));
        assert!(matches!(
            data[0].fragments(),
            Some(Err(NtfsError::InvalidRecord(_)))
        ));
        // the table still renders
        assert!(rec.to_string().contains("bad compression unit 2^64"));

        let edge = NonResidentHeader {
            compression_unit: NonResidentHeader::MAX_COMPRESSION_UNIT,
            ..non_resident.clone()
        };
        assert_eq!(edge.compression_unit_clusters().unwrap(), 256);
    }

    #[test]
    fn named_stream_and_unknown_type() {
        let raw = RecordBuilder::new(0x0001)
            .resident(0x80, "Zone.Identifier", b"[ZoneTransfer]")
            .resident(0x1234, "", b"opaque")
            .build();
        let rec = MFTRecord::from_bytes(&raw, None).unwrap();
        let ads = rec.alternate_data_streams();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].name, "Zone.Identifier");
        assert_eq!(ads[0].size, 14);
        assert_eq!(
            rec.attributes[1].header().attr_type,
            AttributeType::Unknown(0x1234)
        );
        assert_eq!(AttributeType::Unknown(0x1234).code(), 0x1234);
    }

    #[test]
    fn torn_sector_is_rejected() {
        let mut raw = RecordBuilder::new(0x0001).build();
        raw[1022] ^= 0xFF;
        assert!(matches!(
            MFTRecord::from_bytes(&raw, None),
            Err(NtfsError::InvalidRecord(_))
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut raw = RecordBuilder::new(0x0001).build();
        raw[0..4].copy_from_slice(b"BAAD");
        assert!(MFTRecord::from_bytes(&raw, None).is_err());
    }

    #[test]
    fn attribute_list_entries() {
        let mut raw = Vec::new();
        for (code, vcn, record) in [(0x10u32, 0u64, 7u64), (0x80, 0, 7), (0x80, 300, 12)] {
            let mut e = vec![0u8; 0x20];
            e[0..4].copy_from_slice(&code.to_le_bytes());
            e[4..6].copy_from_slice(&0x20u16.to_le_bytes());
            e[7] = 0x1A;
            e[8..16].copy_from_slice(&vcn.to_le_bytes());
            e[16..24].copy_from_slice(&(record | (3u64 << 48)).to_le_bytes());
            raw.extend(e);
        }
        let entries = AttributeListEntry::parse_all(&raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].attr_type, AttributeType::Data);
        assert_eq!(entries[2].lowest_vcn, 300);
        assert_eq!(entries[2].record, 12);
        assert_eq!(entries[2].record_seq, 3);
    }

    #[test]
    fn filetime_epoch() {
        assert_eq!(filetime_to_datetime(116_444_736_000_000_000), "1970-01-01T00:00:00+00:00");
    }
}
