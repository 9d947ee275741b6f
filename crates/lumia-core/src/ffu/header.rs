//! Fixed binary headers of the custom FFU image.
//!
//! All multi-byte fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), HeaderError> {
    if data.len() < expected {
        return Err(HeaderError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Image header (24 bytes / 0x18), followed by the manifest text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub manifest_length: u32,
    pub chunk_size: u32,
}

impl ImageHeader {
    pub const SIZE: usize = 0x18;

    pub fn new(manifest_length: u32) -> Self {
        Self {
            manifest_length,
            chunk_size: CHUNK_SIZE as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0x00..], Self::SIZE as u32);
        buf[0x04..0x10].copy_from_slice(IMAGE_SIGNATURE);
        LittleEndian::write_u32(&mut buf[0x10..], self.manifest_length);
        LittleEndian::write_u32(&mut buf[0x14..], self.chunk_size);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        if &data[0x04..0x10] != IMAGE_SIGNATURE {
            return Err(HeaderError::InvalidSignature(
                String::from_utf8_lossy(&data[0x04..0x10]).into_owned(),
            ));
        }
        Ok(Self {
            manifest_length: LittleEndian::read_u32(&data[0x10..]),
            chunk_size: LittleEndian::read_u32(&data[0x14..]),
        })
    }
}

/// Store header (0xF8 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub update_type: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub full_flash_major_version: u16,
    pub full_flash_minor_version: u16,
    /// ASCII, at most 0xC0 bytes.
    pub platform_id: String,
    pub block_size: u32,
    pub write_descriptor_count: u32,
    pub write_descriptor_length: u32,
    pub validate_descriptor_count: u32,
    pub validate_descriptor_length: u32,
    pub initial_table_index: u32,
    pub initial_table_count: u32,
    pub flash_only_table_index: u32,
    pub flash_only_table_count: u32,
    pub final_table_index: u32,
    pub final_table_count: u32,
}

impl StoreHeader {
    pub const SIZE: usize = 0xF8;
    pub const PLATFORM_ID_OFFSET: usize = 0x0C;
    pub const PLATFORM_ID_LEN: usize = 0xC0;

    /// Header for a full-flash store with no validation descriptors.
    pub fn new(
        platform_id: &str,
        write_descriptor_count: u32,
        write_descriptor_length: u32,
        flash_only_table_index: u32,
    ) -> Self {
        let final_table_count = 0;
        Self {
            update_type: 0,
            major_version: 1,
            minor_version: 0,
            full_flash_major_version: 2,
            full_flash_minor_version: 0,
            platform_id: platform_id.to_string(),
            block_size: CHUNK_SIZE as u32,
            write_descriptor_count,
            write_descriptor_length,
            validate_descriptor_count: 0,
            validate_descriptor_length: 0,
            initial_table_index: 0,
            initial_table_count: 0,
            flash_only_table_index,
            flash_only_table_count: 1,
            final_table_index: write_descriptor_count - final_table_count,
            final_table_count,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0x00..], self.update_type);
        LittleEndian::write_u16(&mut buf[0x04..], self.major_version);
        LittleEndian::write_u16(&mut buf[0x06..], self.minor_version);
        LittleEndian::write_u16(&mut buf[0x08..], self.full_flash_major_version);
        LittleEndian::write_u16(&mut buf[0x0A..], self.full_flash_minor_version);

        let id = self.platform_id.as_bytes();
        // Keep one terminating NUL.
        let n = id.len().min(Self::PLATFORM_ID_LEN - 1);
        buf[Self::PLATFORM_ID_OFFSET..Self::PLATFORM_ID_OFFSET + n].copy_from_slice(&id[..n]);

        let fields = [
            self.block_size,
            self.write_descriptor_count,
            self.write_descriptor_length,
            self.validate_descriptor_count,
            self.validate_descriptor_length,
            self.initial_table_index,
            self.initial_table_count,
            self.flash_only_table_index,
            self.flash_only_table_count,
            self.final_table_index,
            self.final_table_count,
        ];
        let base = Self::PLATFORM_ID_OFFSET + Self::PLATFORM_ID_LEN;
        for (i, v) in fields.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[base + i * 4..], *v);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let id = &data[Self::PLATFORM_ID_OFFSET..Self::PLATFORM_ID_OFFSET + Self::PLATFORM_ID_LEN];
        let id_len = id.iter().position(|&b| b == 0).unwrap_or(id.len());
        let base = Self::PLATFORM_ID_OFFSET + Self::PLATFORM_ID_LEN;
        let field = |i: usize| LittleEndian::read_u32(&data[base + i * 4..]);
        Ok(Self {
            update_type: LittleEndian::read_u32(&data[0x00..]),
            major_version: LittleEndian::read_u16(&data[0x04..]),
            minor_version: LittleEndian::read_u16(&data[0x06..]),
            full_flash_major_version: LittleEndian::read_u16(&data[0x08..]),
            full_flash_minor_version: LittleEndian::read_u16(&data[0x0A..]),
            platform_id: String::from_utf8_lossy(&id[..id_len]).trim_end().to_string(),
            block_size: field(0),
            write_descriptor_count: field(1),
            write_descriptor_length: field(2),
            validate_descriptor_count: field(3),
            validate_descriptor_length: field(4),
            initial_table_index: field(5),
            initial_table_count: field(6),
            flash_only_table_index: field(7),
            flash_only_table_count: field(8),
            final_table_index: field(9),
            final_table_count: field(10),
        })
    }
}

/// Write descriptor: `{location count, chunk count}` then one
/// `{disk access method, chunk index}` pair per target location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDescriptor {
    pub chunk_count: u32,
    pub locations: Vec<u32>,
}

impl WriteDescriptor {
    /// Chunk index counted from the start of the disk.
    pub const DISK_ACCESS_BEGIN: u32 = 0;

    pub fn encoded_len(&self) -> usize {
        8 + self.locations.len() * 8
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut word = [0u8; 4];
        let mut push = |v: u32, out: &mut Vec<u8>| {
            LittleEndian::write_u32(&mut word, v);
            out.extend_from_slice(&word);
        };
        push(self.locations.len() as u32, out);
        push(self.chunk_count, out);
        for &location in &self.locations {
            push(Self::DISK_ACCESS_BEGIN, out);
            push(location, out);
        }
    }
}

/// Security header (32 bytes / 0x20), followed by catalog and hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityHeader {
    pub chunk_size_kb: u32,
    pub hash_algorithm: u32,
    pub catalog_size: u32,
    pub hash_table_size: u32,
}

impl SecurityHeader {
    pub const SIZE: usize = 0x20;

    pub fn new(catalog_size: u32, hash_table_size: u32) -> Self {
        Self {
            chunk_size_kb: CHUNK_SIZE_KB,
            hash_algorithm: HASH_ALGORITHM_SHA256,
            catalog_size,
            hash_table_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0x00..], Self::SIZE as u32);
        buf[0x04..0x10].copy_from_slice(SECURITY_SIGNATURE);
        LittleEndian::write_u32(&mut buf[0x10..], self.chunk_size_kb);
        LittleEndian::write_u32(&mut buf[0x14..], self.hash_algorithm);
        LittleEndian::write_u32(&mut buf[0x18..], self.catalog_size);
        LittleEndian::write_u32(&mut buf[0x1C..], self.hash_table_size);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        if &data[0x04..0x10] != SECURITY_SIGNATURE {
            return Err(HeaderError::InvalidSignature(
                String::from_utf8_lossy(&data[0x04..0x10]).into_owned(),
            ));
        }
        Ok(Self {
            chunk_size_kb: LittleEndian::read_u32(&data[0x10..]),
            hash_algorithm: LittleEndian::read_u32(&data[0x14..]),
            catalog_size: LittleEndian::read_u32(&data[0x18..]),
            hash_table_size: LittleEndian::read_u32(&data[0x1C..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_header_layout() {
        let bytes = ImageHeader::new(0x1234).to_bytes();
        assert_eq!(&bytes[0..4], &24u32.to_le_bytes());
        assert_eq!(&bytes[4..16], b"ImageFlash  ");
        assert_eq!(&bytes[0x10..0x14], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[0x14..0x18], &0x20000u32.to_le_bytes());
    }

    #[test]
    fn test_store_header_offsets() {
        let header = StoreHeader::new("Nokia.MSM8960.P4301.1", 7, 72, 3);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 0xF8);
        assert_eq!(&bytes[0x0C..0x0C + 21], b"Nokia.MSM8960.P4301.1");
        assert_eq!(&bytes[0xCC..0xD0], &0x20000u32.to_le_bytes());
        assert_eq!(&bytes[0xD0..0xD4], &7u32.to_le_bytes());
        assert_eq!(&bytes[0xD4..0xD8], &72u32.to_le_bytes());
        assert_eq!(&bytes[0xE8..0xEC], &3u32.to_le_bytes());
        assert_eq!(&bytes[0xF0..0xF4], &7u32.to_le_bytes());

        let parsed = StoreHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.validate_descriptor_count, 0);
    }

    #[test]
    fn test_store_header_truncates_long_platform_id() {
        let long = "X".repeat(0x100);
        let bytes = StoreHeader::new(&long, 1, 16, 0).to_bytes();
        assert_eq!(bytes[0x0C + 0xBF], 0);
        assert_eq!(&bytes[0xCC..0xD0], &0x20000u32.to_le_bytes());
    }

    #[test]
    fn test_write_descriptor_encoding() {
        let d = WriteDescriptor {
            chunk_count: 1,
            locations: vec![5, 9],
        };
        let mut out = Vec::new();
        d.write_to(&mut out);
        assert_eq!(out.len(), d.encoded_len());
        assert_eq!(
            out,
            [2u32, 1, 0, 5, 0, 9]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect::<Vec<u8>>()
        );
    }

    #[test]
    fn test_security_header_layout() {
        let bytes = SecurityHeader::new(0x1A0, 0x60).to_bytes();
        assert_eq!(&bytes[4..16], b"SignedImage ");
        assert_eq!(&bytes[0x10..0x14], &128u32.to_le_bytes());
        assert_eq!(&bytes[0x14..0x18], &32780u32.to_le_bytes());
        assert_eq!(SecurityHeader::from_bytes(&bytes).unwrap().catalog_size, 0x1A0);
        assert!(SecurityHeader::from_bytes(&[0u8; 0x20]).is_err());
    }
}
