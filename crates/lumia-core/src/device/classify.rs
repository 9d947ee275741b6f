//! Coarse classification of USB notifications.
//!
//! The classifier only looks at the notification itself. Deciding between
//! the modes of the flash family needs a conversation with the device, and
//! the legacy interface needs a timing window; both are the monitor's job.

use tracing::trace;

use super::{DevicePath, InterfaceClass, Mode, UsbNotification};
use crate::protocol::constants::*;

/// Device family selected from the device path and interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Normal mode seen through the old combined interface; may be a
    /// double enumeration of a device the modern interface also reports.
    LegacyCombined,
    Normal,
    /// Bootloader, flash app or phone-info app; needs an app-type query.
    Flash,
    Label,
    MassStorage,
    /// Qualcomm 9008; sub-mode depends on the bus name.
    QualcommEdl,
}

pub struct DeviceClassifier;

impl DeviceClassifier {
    /// Select the family of an arrival or removal, if it is one of ours.
    pub fn classify(notification: &UsbNotification) -> Option<DeviceFamily> {
        let path = DevicePath::parse(&notification.device_path);
        let ids = path.ids();
        let in_list = |list: &[(u16, u16)]| ids.is_some_and(|id| list.contains(&id));

        let family = match notification.interface {
            InterfaceClass::LegacyCombined if path.is_lumia_vendor() => {
                Some(DeviceFamily::LegacyCombined)
            }
            InterfaceClass::Combined if in_list(FLASH_PIDS) => Some(DeviceFamily::Flash),
            InterfaceClass::Combined if in_list(LABEL_PIDS) => Some(DeviceFamily::Label),
            InterfaceClass::Combined if in_list(NORMAL_PIDS) => {
                match path.interface_number {
                    None | Some(LUMIA_COMBINED_INTERFACE) => Some(DeviceFamily::Normal),
                    Some(_) => None,
                }
            }
            InterfaceClass::Flash if path.is_lumia_vendor() => Some(DeviceFamily::Flash),
            InterfaceClass::Label if path.is_lumia_vendor() => Some(DeviceFamily::Label),
            InterfaceClass::Disk
                if MASS_STORAGE_PATTERNS.iter().any(|p| path.contains(p))
                    || ids == Some((QUALCOMM_VENDOR_ID, QUALCOMM_MASS_STORAGE_PID)) =>
            {
                Some(DeviceFamily::MassStorage)
            }
            InterfaceClass::ComPort if ids == Some((QUALCOMM_VENDOR_ID, QUALCOMM_EDL_PID)) => {
                Some(DeviceFamily::QualcommEdl)
            }
            _ => None,
        };

        trace!(path = %notification.device_path, interface = ?notification.interface, family = ?family, "Classified");
        family
    }

    /// Resolve the 9008 sub-mode.
    ///
    /// The bus name decides when present. Some drivers report it empty; the
    /// device then alternates between the two sub-modes, so the previous
    /// Qualcomm mode selects the other one.
    pub fn qualcomm_mode(bus_name: Option<&str>, last_qualcomm: Option<Mode>) -> Mode {
        match bus_name.map(str::trim) {
            Some(name) if name.eq_ignore_ascii_case(QUALCOMM_BUS_DOWNLOAD) => Mode::QualcommDownload,
            Some(name) if name.eq_ignore_ascii_case(QUALCOMM_BUS_FLASH) => Mode::QualcommFlash,
            _ => match last_qualcomm {
                Some(Mode::QualcommDownload) => Mode::QualcommFlash,
                _ => Mode::QualcommDownload,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(path: &str, class: InterfaceClass) -> UsbNotification {
        UsbNotification::new(path, class)
    }

    #[test]
    fn test_flash_family_on_both_interfaces() {
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_0421&pid_066e#1#{x}", InterfaceClass::Flash)),
            Some(DeviceFamily::Flash)
        );
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_045e&pid_0a02#1#{x}", InterfaceClass::Combined)),
            Some(DeviceFamily::Flash)
        );
    }

    #[test]
    fn test_normal_requires_combined_interface_number() {
        let ok = n(r"\\?\usb#vid_0421&pid_0661&mi_04#1#{x}", InterfaceClass::Combined);
        let other = n(r"\\?\usb#vid_0421&pid_0661&mi_00#1#{x}", InterfaceClass::Combined);
        assert_eq!(DeviceClassifier::classify(&ok), Some(DeviceFamily::Normal));
        assert_eq!(DeviceClassifier::classify(&other), None);
    }

    #[test]
    fn test_legacy_and_label() {
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_0421&pid_0661#1#{x}", InterfaceClass::LegacyCombined)),
            Some(DeviceFamily::LegacyCombined)
        );
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_0421&pid_0713#1#{x}", InterfaceClass::Label)),
            Some(DeviceFamily::Label)
        );
    }

    #[test]
    fn test_mass_storage_and_qualcomm() {
        assert_eq!(
            DeviceClassifier::classify(&n(
                r"\\?\usbstor#disk&ven_qualcomm&prod_mmc_storage&rev_0000#1#{x}",
                InterfaceClass::Disk
            )),
            Some(DeviceFamily::MassStorage)
        );
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_05c6&pid_9008#1#{x}", InterfaceClass::ComPort)),
            Some(DeviceFamily::QualcommEdl)
        );
        assert_eq!(
            DeviceClassifier::classify(&n(r"\\?\usb#vid_1234&pid_5678#1#{x}", InterfaceClass::ComPort)),
            None
        );
    }

    #[test]
    fn test_qualcomm_bus_name() {
        assert_eq!(
            DeviceClassifier::qualcomm_mode(Some("QHSUSB_DLOAD"), Some(Mode::QualcommDownload)),
            Mode::QualcommDownload
        );
        assert_eq!(
            DeviceClassifier::qualcomm_mode(Some("QHSUSB_ARMPRG"), None),
            Mode::QualcommFlash
        );
    }

    #[test]
    fn test_qualcomm_empty_bus_name_alternates() {
        assert_eq!(
            DeviceClassifier::qualcomm_mode(Some(""), Some(Mode::QualcommDownload)),
            Mode::QualcommFlash
        );
        assert_eq!(
            DeviceClassifier::qualcomm_mode(None, Some(Mode::QualcommFlash)),
            Mode::QualcommDownload
        );
        assert_eq!(DeviceClassifier::qualcomm_mode(None, None), Mode::QualcommDownload);
    }
}
