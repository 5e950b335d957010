// Sources:
// - https://en.wikipedia.org/wiki/NTFS
// - https://flatcap.github.io/linux-ntfs/ntfs/files/boot.html

//! Parse an NTFS Partition-Boot-Sector and derive the volume geometry the
//! rest of the crate works with (cluster size, record sizes, $MFT location).

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::io::{Cursor, Read};

use crate::error::{NtfsError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: Vec<u8>, // x86 JMP + NOP
    pub oem_id: [u8; 8],           // "NTFS    "

    /* -- BIOS Parameter Block (BPB) – 0x0B-0x23 ------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub media_descriptor: u8,    // 0x15 (0xF8 = hard disk)
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C

    /* -- Extended BPB – 0x28-0x53 ---------------------------- */
    pub total_sectors: u64,           // 0x28
    pub mft_cluster: u64,             // 0x30
    pub mft_mirror_cluster: u64,      // 0x38
    pub clusters_per_file_record: i8, // 0x40  (negative: 2^-n bytes)
    pub clusters_per_index_buffer: i8, // 0x44
    pub volume_serial_number: u64,    // 0x48
    pub checksum: u32,                // 0x50

    pub end_of_sector_marker: u16, // 0x1FE (0xAA55)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
    pub const SIZE: usize = 512;
    /// Bounds for file record and index record sizes.
    pub const MIN_RECORD_SIZE: u32 = 256;
    pub const MAX_RECORD_SIZE: u32 = 64 * 1024;

    /// Parse the 512-byte sector into `PartitionBootSector`
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(NtfsError::InvalidBootSector(format!(
                "boot sector needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let mut c = Cursor::new(buf);

        macro_rules! read_array {
            ($len:expr) => {{
                let mut tmp = [0u8; $len];
                c.read_exact(&mut tmp)?;
                tmp
            }};
        }
        macro_rules! skip {
            ($len:expr) => {{
                c.set_position(c.position() + $len);
            }};
        }

        let jump_instruction = read_array!(3).to_vec();
        let oem_id = read_array!(8);
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        skip!(7); // reserved sectors, unused, unused
        let media_descriptor = c.read_u8()?;
        skip!(2);
        let sectors_per_track = c.read_u16::<LittleEndian>()?;
        let number_of_heads = c.read_u16::<LittleEndian>()?;
        let hidden_sectors = c.read_u32::<LittleEndian>()?;
        skip!(8);
        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        skip!(3);
        let clusters_per_index_buffer = c.read_i8()?;
        skip!(3);
        let volume_serial_number = c.read_u64::<LittleEndian>()?;
        let checksum = c.read_u32::<LittleEndian>()?;
        c.set_position(0x1FE);
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        let pbs = Self {
            jump_instruction,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            media_descriptor,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            clusters_per_index_buffer,
            volume_serial_number,
            checksum,
            end_of_sector_marker,
        };
        pbs.validate()?;
        Ok(pbs)
    }

    /// Check if the oem_id is valid
    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    fn validate(&self) -> Result<()> {
        if !self.oem_id_is_valid() {
            return Err(NtfsError::InvalidBootSector(format!(
                "OEM identifier is {:?}",
                String::from_utf8_lossy(&self.oem_id)
            )));
        }
        if !self.bytes_per_sector.is_power_of_two() || self.bytes_per_sector < 256 {
            return Err(NtfsError::InvalidBootSector(format!(
                "{} bytes per sector",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 {
            return Err(NtfsError::InvalidBootSector("zero sectors per cluster".into()));
        }
        let cluster_size = self.cluster_size();
        if Self::scaled_size(self.clusters_per_file_record, cluster_size).is_none() {
            return Err(NtfsError::InvalidBootSector(format!(
                "file record size field {}",
                self.clusters_per_file_record
            )));
        }
        if Self::scaled_size(self.clusters_per_index_buffer, cluster_size).is_none() {
            return Err(NtfsError::InvalidBootSector(format!(
                "index record size field {}",
                self.clusters_per_index_buffer
            )));
        }
        if self.mft_cluster.checked_mul(cluster_size).is_none() {
            return Err(NtfsError::InvalidBootSector(format!(
                "$MFT cluster {} is out of range",
                self.mft_cluster
            )));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Compute actual bytes per file-record segment
    pub fn file_record_size(&self) -> u32 {
        Self::scaled_size(self.clusters_per_file_record, self.cluster_size()).unwrap_or(1024)
    }

    /// Bytes per `INDX` record of a non-resident directory index.
    pub fn index_record_size(&self) -> u32 {
        Self::scaled_size(self.clusters_per_index_buffer, self.cluster_size()).unwrap_or(4096)
    }

    /// Positive: a count of clusters. Negative: log2 of the size in bytes.
    /// `None` unless the result is a power of two within the record bounds.
    fn scaled_size(raw: i8, cluster_size: u64) -> Option<u32> {
        let size = if raw > 0 {
            u64::from(raw.unsigned_abs()).checked_mul(cluster_size)?
        } else {
            1u64.checked_shl(u32::from(raw.unsigned_abs()))?
        };
        u32::try_from(size)
            .ok()
            .filter(|s| s.is_power_of_two())
            .filter(|s| (Self::MIN_RECORD_SIZE..=Self::MAX_RECORD_SIZE).contains(s))
    }

    /// Byte offset of $MFT inside the volume.
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster.saturating_mul(self.cluster_size())
    }

    pub fn mft_mirror_address(&self) -> u64 {
        self.mft_mirror_cluster.saturating_mul(self.cluster_size())
    }

    pub fn volume_size(&self) -> u64 {
        self.total_sectors.saturating_mul(self.bytes_per_sector as u64)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

impl fmt::Display for PartitionBootSector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = Table::new();
        t.add_row(row!["Partition Boot Sector"]);
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Cluster size", self.cluster_size()]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "Volume size", self.volume_size()]);
        t.add_row(row![b -> "$MFT cluster", format!("{} (0x{:X})", self.mft_cluster, self.mft_address())]);
        t.add_row(row![b -> "$MFTMirr cluster", format!("{} (0x{:X})", self.mft_mirror_cluster, self.mft_mirror_address())]);
        t.add_row(row![b -> "File record size", self.file_record_size()]);
        t.add_row(row![b -> "Index record size", self.index_record_size()]);
        t.add_row(row![b -> "Serial number", format!("{:016X}", self.volume_serial_number)]);
        write!(f, "{}", t)
    }
}

/// Build a minimal valid boot sector, for tests.
#[cfg(test)]
pub(crate) fn sample_boot_sector(
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    mft_cluster: u64,
    total_sectors: u64,
) -> Vec<u8> {
    let mut raw = vec![0u8; PartitionBootSector::SIZE];
    raw[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    raw[3..11].copy_from_slice(&PartitionBootSector::NTFS_OEM_ID);
    raw[0x0B..0x0D].copy_from_slice(&bytes_per_sector.to_le_bytes());
    raw[0x0D] = sectors_per_cluster;
    raw[0x15] = 0xF8;
    raw[0x28..0x30].copy_from_slice(&total_sectors.to_le_bytes());
    raw[0x30..0x38].copy_from_slice(&mft_cluster.to_le_bytes());
    raw[0x38..0x40].copy_from_slice(&(mft_cluster + 1).to_le_bytes());
    raw[0x40] = 0xF6; // -10 => 1024 byte records
    raw[0x44] = 0xF4; // -12 => 4096 byte index records
    raw[0x1FE..0x200].copy_from_slice(&0xAA55u16.to_le_bytes());
    raw
}
