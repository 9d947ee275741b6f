//! Phone info reply of the flash dialect.
//!
//! Body layout: app type, protocol major, protocol minor, sub-block count,
//! then `count` sub-blocks of `{id: u8, len: u16 BE, data}`.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::constants::*;
use super::response::ProtocolError;

/// Firmware-side program answering the flash dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAppType {
    Bootloader,
    FlashApp,
    PhoneInfoApp,
}

impl FlashAppType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            APP_TYPE_BOOTLOADER => Some(Self::Bootloader),
            APP_TYPE_FLASH => Some(Self::FlashApp),
            APP_TYPE_PHONE_INFO => Some(Self::PhoneInfoApp),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Bootloader => APP_TYPE_BOOTLOADER,
            Self::FlashApp => APP_TYPE_FLASH,
            Self::PhoneInfoApp => APP_TYPE_PHONE_INFO,
        }
    }
}

impl fmt::Display for FlashAppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "Bootloader"),
            Self::FlashApp => write!(f, "Flash app"),
            Self::PhoneInfoApp => write!(f, "Phone info app"),
        }
    }
}

/// Security flags from sub-block 0x0D.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityStatus {
    pub platform_secure_boot: bool,
    pub secure_ffu: bool,
    pub jtag_disabled: bool,
    pub rdc_present: bool,
    pub authenticated: bool,
    pub uefi_secure_boot: bool,
}

impl SecurityStatus {
    fn from_bytes(data: &[u8]) -> Self {
        let flag = |i: usize| data.get(i).is_some_and(|&b| b != 0);
        Self {
            platform_secure_boot: flag(0),
            secure_ffu: flag(1),
            jtag_disabled: flag(2),
            rdc_present: flag(3),
            authenticated: flag(4),
            uefi_secure_boot: flag(5),
        }
    }

    fn to_bytes(self) -> [u8; 6] {
        [
            self.platform_secure_boot as u8,
            self.secure_ffu as u8,
            self.jtag_disabled as u8,
            self.rdc_present as u8,
            self.authenticated as u8,
            self.uefi_secure_boot as u8,
        ]
    }
}

/// Parsed phone info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneInfo {
    pub app_type: FlashAppType,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Largest single USB transfer the device accepts.
    pub transfer_size: usize,
    /// Device-side buffer for V2 payload bursts.
    pub write_buffer_size: usize,
    pub emmc_sectors: u64,
    pub platform_id: String,
    pub sync_v2: bool,
    pub security: SecurityStatus,
}

impl Default for PhoneInfo {
    fn default() -> Self {
        Self {
            app_type: FlashAppType::FlashApp,
            protocol_major: 0,
            protocol_minor: 0,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            write_buffer_size: 0,
            emmc_sectors: 0,
            platform_id: String::new(),
            sync_v2: false,
            security: SecurityStatus::default(),
        }
    }
}

impl PhoneInfo {
    /// Parse the body of an info response.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let truncated = |expected: usize| ProtocolError::Truncated {
            command: "NOKV".into(),
            expected,
            actual: body.len(),
        };
        if body.len() < 4 {
            return Err(truncated(4));
        }

        let app_type =
            FlashAppType::from_byte(body[0]).ok_or_else(|| ProtocolError::SignatureMismatch {
                command: "NOKV".into(),
                actual: format!("app type {}", body[0]),
            })?;

        let mut info = PhoneInfo {
            app_type,
            protocol_major: body[1],
            protocol_minor: body[2],
            ..Default::default()
        };

        let count = body[3] as usize;
        let mut offset = 4;
        for _ in 0..count {
            if offset + 3 > body.len() {
                return Err(truncated(offset + 3));
            }
            let id = body[offset];
            let len = BigEndian::read_u16(&body[offset + 1..offset + 3]) as usize;
            let start = offset + 3;
            if start + len > body.len() {
                return Err(truncated(start + len));
            }
            let data = &body[start..start + len];
            info.apply_subblock(id, data);
            offset = start + len;
        }

        Ok(info)
    }

    fn apply_subblock(&mut self, id: u8, data: &[u8]) {
        match id {
            INFO_TRANSFER_SIZE if data.len() >= 4 => {
                self.transfer_size = BigEndian::read_u32(data) as usize;
            }
            INFO_WRITE_BUFFER_SIZE if data.len() >= 4 => {
                self.write_buffer_size = BigEndian::read_u32(data) as usize;
            }
            INFO_EMMC_SECTORS if data.len() >= 4 => {
                self.emmc_sectors = u64::from(BigEndian::read_u32(data));
            }
            INFO_PLATFORM_ID => {
                self.platform_id = String::from_utf8_lossy(data)
                    .trim_end_matches(['\0', ' '])
                    .to_string();
            }
            INFO_FLASH_FEATURES if !data.is_empty() => {
                self.sync_v2 = data[0] & FEATURE_SYNC_V2 != 0;
            }
            INFO_SECURITY_STATUS => {
                self.security = SecurityStatus::from_bytes(data);
            }
            _ => {
                debug!(id = %format!("0x{:02X}", id), len = data.len(), "Ignoring info sub-block");
            }
        }
    }

    /// Encode as an info response body.
    pub fn to_body(&self) -> Vec<u8> {
        let mut blocks: Vec<(u8, Vec<u8>)> = vec![
            (INFO_TRANSFER_SIZE, (self.transfer_size as u32).to_be_bytes().to_vec()),
            (
                INFO_WRITE_BUFFER_SIZE,
                (self.write_buffer_size as u32).to_be_bytes().to_vec(),
            ),
            (INFO_EMMC_SECTORS, (self.emmc_sectors as u32).to_be_bytes().to_vec()),
            (INFO_PLATFORM_ID, self.platform_id.as_bytes().to_vec()),
            (
                INFO_FLASH_FEATURES,
                vec![if self.sync_v2 { FEATURE_SYNC_V2 } else { 0 }],
            ),
            (INFO_SECURITY_STATUS, self.security.to_bytes().to_vec()),
        ];

        let mut body = vec![
            self.app_type.to_byte(),
            self.protocol_major,
            self.protocol_minor,
            blocks.len() as u8,
        ];
        for (id, data) in blocks.drain(..) {
            body.push(id);
            body.extend_from_slice(&(data.len() as u16).to_be_bytes());
            body.extend_from_slice(&data);
        }
        body
    }

    /// True when the device does not enforce signed images.
    pub fn is_insecure(&self) -> bool {
        !self.security.platform_secure_boot || !self.security.secure_ffu
    }

    /// Number of chunks a V2 burst may carry: bounded by the device write
    /// buffer and by the largest transfer, which also holds the frame header.
    pub fn max_chunks_per_burst(&self) -> usize {
        let room = self
            .write_buffer_size
            .min(self.transfer_size.saturating_sub(SECURE_FLASH_HEADER_LEN));
        (room / CHUNK_SIZE).max(1)
    }
}
