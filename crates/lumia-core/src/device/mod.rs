//! Device modes, arrival notifications and per-mode sessions.

pub mod classify;
pub mod flash_app;
pub mod json_rpc;
pub mod session;

use std::fmt;
use std::sync::Arc;

use crate::protocol::constants::*;

pub use classify::{DeviceClassifier, DeviceFamily};
pub use flash_app::LumiaFlashSession;
pub use json_rpc::JsonRpcSession;
pub use session::{
    DeviceInfo, DeviceSession, MassStorageSession, ModeSession, QualcommSession, QualcommSubMode,
    SessionError,
};

/// Firmware/boot mode the attached device is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Disconnected,
    Bootloader,
    FlashApp,
    PhoneInfoApp,
    Normal,
    Label,
    MassStorage,
    BadMassStorage,
    QualcommDownload,
    QualcommFlash,
}

impl Mode {
    /// Modes answered by the flash dialect.
    pub fn is_flash_family(&self) -> bool {
        matches!(self, Mode::Bootloader | Mode::FlashApp | Mode::PhoneInfoApp)
    }

    pub fn is_qualcomm(&self) -> bool {
        matches!(self, Mode::QualcommDownload | Mode::QualcommFlash)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Disconnected => write!(f, "Disconnected"),
            Mode::Bootloader => write!(f, "Bootloader"),
            Mode::FlashApp => write!(f, "Flash"),
            Mode::PhoneInfoApp => write!(f, "Phone info"),
            Mode::Normal => write!(f, "Normal"),
            Mode::Label => write!(f, "Label"),
            Mode::MassStorage => write!(f, "Mass storage"),
            Mode::BadMassStorage => write!(f, "Mass storage (no driver)"),
            Mode::QualcommDownload => write!(f, "Qualcomm emergency download"),
            Mode::QualcommFlash => write!(f, "Qualcomm emergency flash"),
        }
    }
}

/// Interface class that raised a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceClass {
    LegacyCombined,
    Combined,
    Flash,
    Label,
    Disk,
    ComPort,
}

impl InterfaceClass {
    pub fn from_guid(guid: &str) -> Option<Self> {
        let guid = guid.trim();
        [
            (GUID_LEGACY_COMBINED, Self::LegacyCombined),
            (GUID_COMBINED, Self::Combined),
            (GUID_FLASH, Self::Flash),
            (GUID_LABEL, Self::Label),
            (GUID_DISK, Self::Disk),
            (GUID_COMPORT, Self::ComPort),
        ]
        .into_iter()
        .find(|(g, _)| g.eq_ignore_ascii_case(guid))
        .map(|(_, class)| class)
    }

    pub fn guid(&self) -> &'static str {
        match self {
            Self::LegacyCombined => GUID_LEGACY_COMBINED,
            Self::Combined => GUID_COMBINED,
            Self::Flash => GUID_FLASH,
            Self::Label => GUID_LABEL,
            Self::Disk => GUID_DISK,
            Self::ComPort => GUID_COMPORT,
        }
    }
}

/// Raw arrival/removal notification from the USB layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbNotification {
    pub device_path: String,
    pub interface: InterfaceClass,
    /// Bus-reported device description; empty when the driver omits it.
    pub bus_name: Option<String>,
}

impl UsbNotification {
    pub fn new(device_path: impl Into<String>, interface: InterfaceClass) -> Self {
        Self {
            device_path: device_path.into(),
            interface,
            bus_name: None,
        }
    }

    pub fn with_bus_name(mut self, bus_name: impl Into<String>) -> Self {
        self.bus_name = Some(bus_name.into());
        self
    }
}

/// A classified device arrival. Produced once per physical arrival.
#[derive(Clone)]
pub struct ArrivalEvent {
    pub mode: Mode,
    pub session: Arc<ModeSession>,
    pub device_path: String,
}

impl fmt::Debug for ArrivalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrivalEvent")
            .field("mode", &self.mode)
            .field("device_path", &self.device_path)
            .finish()
    }
}

/// Identifiers extracted from a device path such as
/// `\\?\usb#vid_0421&pid_066e&mi_04#6&2f2f4cd1&0&0004#{guid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePath {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub interface_number: Option<u8>,
    /// Upper-cased path, for substring matching.
    pub normalized: String,
}

impl DevicePath {
    pub fn parse(path: &str) -> Self {
        let normalized = path.to_ascii_uppercase();
        let hex_after = |tag: &str, digits: usize| -> Option<u32> {
            let start = normalized.find(tag)? + tag.len();
            let hex = normalized.get(start..start + digits)?;
            u32::from_str_radix(hex, 16).ok()
        };
        Self {
            vid: hex_after("VID_", 4).map(|v| v as u16),
            pid: hex_after("PID_", 4).map(|v| v as u16),
            interface_number: hex_after("MI_", 2).map(|v| v as u8),
            normalized,
        }
    }

    pub fn ids(&self) -> Option<(u16, u16)> {
        Some((self.vid?, self.pid?))
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.normalized.contains(&fragment.to_ascii_uppercase())
    }

    pub fn is_lumia_vendor(&self) -> bool {
        matches!(self.vid, Some(NOKIA_VENDOR_ID) | Some(MICROSOFT_VENDOR_ID))
    }
}
