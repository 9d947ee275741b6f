//! GUID partition table read from the device's first 34 sectors.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::debug;

use crate::protocol::constants::SECTOR_SIZE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const HEADER_OFFSET: usize = SECTOR_SIZE as usize;
const NAME_OFFSET: usize = 0x38;
const NAME_LEN: usize = 72;

#[derive(Error, Debug)]
pub enum GptError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("GPT signature not found")]
    InvalidSignature,
    #[error("Invalid partition entry size {0}")]
    InvalidEntrySize(u32),
    #[error("Malformed GPT: {0}")]
    Malformed(String),
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub type_guid: [u8; 16],
    pub first_sector: u64,
    pub last_sector: u64,
    pub attributes: u64,
}

impl Partition {
    pub fn size_in_sectors(&self) -> u64 {
        self.last_sector - self.first_sector + 1
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_sectors() * SECTOR_SIZE
    }
}

#[derive(Debug, Clone, Default)]
pub struct Gpt {
    pub partitions: Vec<Partition>,
}

impl Gpt {
    /// Parse a buffer that starts at sector 0.
    pub fn parse(data: &[u8]) -> Result<Self, GptError> {
        if data.len() < HEADER_OFFSET + 0x5C {
            return Err(GptError::BufferTooSmall {
                expected: HEADER_OFFSET + 0x5C,
                actual: data.len(),
            });
        }
        let header = &data[HEADER_OFFSET..];
        if &header[..8] != GPT_SIGNATURE {
            return Err(GptError::InvalidSignature);
        }

        let mut cursor = Cursor::new(&header[0x48..]);
        let entries_lba = cursor.read_u64::<LittleEndian>()?;
        let entry_count = cursor.read_u32::<LittleEndian>()?;
        let entry_size = cursor.read_u32::<LittleEndian>()?;
        if (entry_size as usize) < NAME_OFFSET + NAME_LEN {
            return Err(GptError::InvalidEntrySize(entry_size));
        }

        let table_start = entries_lba
            .checked_mul(SECTOR_SIZE)
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| GptError::Malformed(format!("entry table LBA {entries_lba} out of range")))?;
        let entry_size = entry_size as usize;
        let mut partitions = Vec::new();
        for i in 0..entry_count as usize {
            let Some(entry) = i
                .checked_mul(entry_size)
                .and_then(|off| table_start.checked_add(off))
                .and_then(|start| data.get(start..start.checked_add(entry_size)?))
            else {
                debug!(index = i, "Partition table extends beyond buffer");
                break;
            };
            if let Some(partition) = parse_entry(entry)? {
                partitions.push(partition);
            }
        }

        debug!(count = partitions.len(), "Parsed GPT");
        Ok(Self { partitions })
    }

    /// Look up a partition that may legitimately be absent.
    pub fn get_partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Look up a required partition.
    pub fn partition(&self, name: &str) -> Result<&Partition, GptError> {
        self.get_partition(name)
            .ok_or_else(|| GptError::PartitionNotFound(name.to_string()))
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.get_partition(name).is_some()
    }
}

fn parse_entry(entry: &[u8]) -> Result<Option<Partition>, GptError> {
    let mut type_guid = [0u8; 16];
    type_guid.copy_from_slice(&entry[..16]);
    if type_guid == [0u8; 16] {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&entry[0x20..]);
    let first_sector = cursor.read_u64::<LittleEndian>()?;
    let last_sector = cursor.read_u64::<LittleEndian>()?;
    let attributes = cursor.read_u64::<LittleEndian>()?;

    if last_sector < first_sector {
        return Err(GptError::Malformed(format!(
            "partition ends at sector {last_sector} before its start {first_sector}"
        )));
    }

    let units: Vec<u16> = entry[NAME_OFFSET..NAME_OFFSET + NAME_LEN]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();

    Ok(Some(Partition {
        name: String::from_utf16_lossy(&units),
        type_guid,
        first_sector,
        last_sector,
        attributes,
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::protocol::constants::GPT_READ_LEN;

    /// Build sectors 0..=33 holding a GPT with the given partitions.
    pub fn build_gpt(parts: &[(&str, u64, u64)]) -> Vec<u8> {
        let mut data = vec![0u8; GPT_READ_LEN];
        let h = 0x200;
        data[h..h + 8].copy_from_slice(b"EFI PART");
        data[h + 0x48..h + 0x50].copy_from_slice(&2u64.to_le_bytes());
        data[h + 0x50..h + 0x54].copy_from_slice(&128u32.to_le_bytes());
        data[h + 0x54..h + 0x58].copy_from_slice(&128u32.to_le_bytes());

        for (i, (name, first, last)) in parts.iter().enumerate() {
            let e = 0x400 + i * 128;
            data[e] = 0xA2; // any non-zero type GUID
            data[e + 0x20..e + 0x28].copy_from_slice(&first.to_le_bytes());
            data[e + 0x28..e + 0x30].copy_from_slice(&last.to_le_bytes());
            for (j, unit) in name.encode_utf16().enumerate() {
                data[e + 0x38 + j * 2..e + 0x3A + j * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::testing::build_gpt;
    use super::*;

    #[test]
    fn test_partition_sizes() {
        let gpt = Gpt::parse(&build_gpt(&[("EFIESP", 100, 103), ("MainOS", 2000, 2999)])).unwrap();
        assert_eq!(gpt.partitions.len(), 2);

        let efiesp = gpt.partition("EFIESP").unwrap();
        assert_eq!(efiesp.size_in_sectors(), 4);
        assert_eq!(efiesp.size_in_bytes(), 2048);
        assert_eq!(gpt.partition("MainOS").unwrap().size_in_sectors(), 1000);
    }

    #[test]
    fn test_absent_partition_any_vs_strict() {
        let gpt = Gpt::parse(&build_gpt(&[("EFIESP", 100, 103)])).unwrap();
        assert!(gpt.get_partition("Data").is_none());
        assert!(!gpt.has_partition("Data"));
        assert!(matches!(
            gpt.partition("Data"),
            Err(GptError::PartitionNotFound(name)) if name == "Data"
        ));
    }

    #[test]
    fn test_names_are_exact_match() {
        let gpt = Gpt::parse(&build_gpt(&[("MainOS", 1, 2)])).unwrap();
        assert!(gpt.get_partition("mainos").is_none());
    }

    #[test]
    fn test_entry_table_lba_overflow_rejected() {
        let mut data = build_gpt(&[("EFIESP", 100, 103)]);
        data[0x248..0x250].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(Gpt::parse(&data), Err(GptError::Malformed(_))));
    }

    #[test]
    fn test_entry_table_beyond_buffer_is_empty() {
        let mut data = build_gpt(&[("EFIESP", 100, 103)]);
        data[0x248..0x250].copy_from_slice(&1000u64.to_le_bytes());
        assert!(Gpt::parse(&data).unwrap().partitions.is_empty());
    }

    #[test]
    fn test_inverted_partition_rejected() {
        let data = build_gpt(&[("MainOS", 300, 100)]);
        assert!(matches!(Gpt::parse(&data), Err(GptError::Malformed(_))));
    }

    #[test]
    fn test_bad_signature() {
        let mut data = build_gpt(&[]);
        data[0x200] = b'X';
        assert!(matches!(Gpt::parse(&data), Err(GptError::InvalidSignature)));
        assert!(matches!(
            Gpt::parse(&[0u8; 16]),
            Err(GptError::BufferTooSmall { .. })
        ));
    }
}
