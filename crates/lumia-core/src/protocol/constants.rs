//! Wire constants: USB identifiers, interface GUIDs, flash dialect
//! commands and the fixed values of the custom FFU image.

// ============================================================================
// USB identifiers
// ============================================================================

pub const NOKIA_VENDOR_ID: u16 = 0x0421;
pub const MICROSOFT_VENDOR_ID: u16 = 0x045E;
pub const QUALCOMM_VENDOR_ID: u16 = 0x05C6;

/// Normal (Windows Phone OS booted) product ids.
pub const NORMAL_PIDS: &[(u16, u16)] = &[
    (NOKIA_VENDOR_ID, 0x0661),
    (NOKIA_VENDOR_ID, 0x06FC),
    (MICROSOFT_VENDOR_ID, 0x0A00),
];

/// Bootloader / flash app / phone-info app share these product ids.
pub const FLASH_PIDS: &[(u16, u16)] = &[
    (NOKIA_VENDOR_ID, 0x066E),
    (NOKIA_VENDOR_ID, 0x0714),
    (MICROSOFT_VENDOR_ID, 0x0A02),
];

/// Interface number of the combined interface on a composite normal-mode device.
pub const LUMIA_COMBINED_INTERFACE: u8 = 0x04;

pub const LABEL_PIDS: &[(u16, u16)] = &[(NOKIA_VENDOR_ID, 0x0713), (MICROSOFT_VENDOR_ID, 0x0A01)];

/// Qualcomm emergency download (Sahara) or emergency flash (ARMPRG).
pub const QUALCOMM_EDL_PID: u16 = 0x9008;
/// Qualcomm emergency mass storage.
pub const QUALCOMM_MASS_STORAGE_PID: u16 = 0x9006;

/// Bus names reported by the Qualcomm driver for PID 9008.
pub const QUALCOMM_BUS_DOWNLOAD: &str = "QHSUSB_DLOAD";
pub const QUALCOMM_BUS_FLASH: &str = "QHSUSB_ARMPRG";

/// Disk path fragments of the phone's eMMC exposed as mass storage.
pub const MASS_STORAGE_PATTERNS: &[&str] = &[
    "VEN_QUALCOMM&PROD_MMC_STORAGE",
    "VEN_MSFT&PROD_PHONE_MMC_STOR",
];

// ============================================================================
// Interface class GUIDs
// ============================================================================

/// Combined interface registered by older phone drivers.
pub const GUID_LEGACY_COMBINED: &str = "{0FD3B15C-D457-45D8-A779-C2B2C9F9D0FD}";
/// Combined interface registered by current phone drivers.
pub const GUID_COMBINED: &str = "{7EAFF726-34CC-4204-B09D-F95471B873CF}";
/// Shared by bootloader, flash app and phone-info app.
pub const GUID_FLASH: &str = "{9E3BD5F7-9690-4FCC-8810-3E2650CD6ECC}";
pub const GUID_LABEL: &str = "{F4FE0EB4-8F1A-4FF4-B6AA-B4E4E38E8A8B}";
/// GUID_DEVINTERFACE_DISK
pub const GUID_DISK: &str = "{53F56307-B6BF-11D0-94F2-00A0C91EFB8B}";
/// GUID_DEVINTERFACE_COMPORT
pub const GUID_COMPORT: &str = "{86E0D1E0-8089-11D0-9CE4-08003E301F73}";

// ============================================================================
// Lumia flash dialect ("NOK" commands)
// ============================================================================

pub const CMD_INFO: &[u8] = b"NOKV";
pub const CMD_RESET: &[u8] = b"NOKR";
pub const CMD_DISABLE_TIMEOUT: &[u8] = b"NOKD";
pub const CMD_READ_GPT: &[u8] = b"NOKT";
pub const CMD_MASS_STORAGE: &[u8] = b"NOKM";
pub const CMD_SWITCH_BOOTLOADER: &[u8] = b"NOKXCBW";
pub const CMD_SWITCH_FLASH: &[u8] = b"NOKXCBF";
pub const CMD_SWITCH_PHONE_INFO: &[u8] = b"NOKXCBP";
pub const CMD_SECURE_FLASH: &[u8] = b"NOKXFS";

/// Error status returned when a command signature is not recognised.
pub const RESPONSE_UNKNOWN: &[u8] = b"NOKU";

/// App type byte in the info response.
pub const APP_TYPE_BOOTLOADER: u8 = 1;
pub const APP_TYPE_FLASH: u8 = 2;
pub const APP_TYPE_PHONE_INFO: u8 = 3;

/// Info response sub-block ids.
pub const INFO_TRANSFER_SIZE: u8 = 0x01;
pub const INFO_WRITE_BUFFER_SIZE: u8 = 0x02;
pub const INFO_EMMC_SECTORS: u8 = 0x03;
pub const INFO_PLATFORM_ID: u8 = 0x05;
pub const INFO_FLASH_FEATURES: u8 = 0x06;
pub const INFO_SECURITY_STATUS: u8 = 0x0D;

/// Bit in the flash-features sub-block.
pub const FEATURE_SYNC_V2: u8 = 0x01;

/// Secure-flash sub-block types.
pub const SUBBLOCK_FFU_HEADER: u32 = 0x0B;
pub const SUBBLOCK_FFU_PAYLOAD_V1: u32 = 0x0C;
pub const SUBBLOCK_FFU_PAYLOAD_V2: u32 = 0x1B;

/// Secure-flash request preamble length (command + sub-block header).
pub const SECURE_FLASH_HEADER_LEN: usize = 0x20;

/// Header option bit asking the device to skip the signature check.
pub const FFU_OPTION_SKIP_SIGNATURE: u8 = 0x02;

/// Default maximum USB transfer when the device does not report one.
pub const DEFAULT_TRANSFER_SIZE: usize = 0x10000;

// ============================================================================
// Custom FFU image
// ============================================================================

pub const SECTOR_SIZE: u64 = 512;
pub const CHUNK_SIZE: usize = 128 * 1024;
pub const CHUNK_SIZE_KB: u32 = 128;

pub const IMAGE_SIGNATURE: &[u8; 12] = b"ImageFlash  ";
pub const SECURITY_SIGNATURE: &[u8; 12] = b"SignedImage ";

/// CALG_SHA_256
pub const HASH_ALGORITHM_SHA256: u32 = 0x800C;

/// GPT lives in sectors 1..=33; the read covers 0..=33.
pub const GPT_READ_SECTORS: usize = 34;
pub const GPT_READ_LEN: usize = GPT_READ_SECTORS * SECTOR_SIZE as usize;

/// Required on every supported phone.
pub const PARTITION_EFIESP: &str = "EFIESP";
pub const PARTITION_MAINOS: &str = "MainOS";
/// Optional.
pub const PARTITION_DATA: &str = "Data";
/// Writes that end before this partition's end form the flash-only table.
pub const PARTITION_PLAT: &str = "PLAT";
