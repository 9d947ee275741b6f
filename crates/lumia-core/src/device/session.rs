//! Per-mode device sessions.
//!
//! One live session exists per arrival. Sessions share the
//! `DeviceSession` capability trait; mode-specific operations live on the
//! concrete types, reached through `ModeSession`.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use super::Mode;
use super::flash_app::LumiaFlashSession;
use super::json_rpc::JsonRpcSession;
use crate::protocol::{PhoneInfo, ProtocolError};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{from} mode cannot switch to {}", target_name(.target))]
    SwitchNotSupported { from: Mode, target: Option<Mode> },

    #[error("Session closed")]
    Closed,
}

fn target_name(target: &Option<Mode>) -> String {
    target.map_or_else(|| "shutdown".to_string(), |m| m.to_string())
}

/// Information a session can report about its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInfo {
    Flash(PhoneInfo),
    Phone {
        product_code: String,
        software_version: String,
    },
    MassStorage {
        volume: String,
    },
    Qualcomm {
        sub_mode: QualcommSubMode,
    },
}

/// Capabilities every mode session offers.
pub trait DeviceSession: Send + Sync {
    fn mode(&self) -> Mode;

    fn read_info(&self) -> Result<DeviceInfo, SessionError>;

    /// Ask the device to leave this mode for `target`; `None` resets or
    /// shuts it down. Returns once the request is sent, not once the
    /// device has re-enumerated.
    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError>;

    /// Release the device. Closing twice is a no-op.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualcommSubMode {
    Download,
    Flash,
}

impl From<QualcommSubMode> for Mode {
    fn from(m: QualcommSubMode) -> Self {
        match m {
            QualcommSubMode::Download => Mode::QualcommDownload,
            QualcommSubMode::Flash => Mode::QualcommFlash,
        }
    }
}

/// Phone eMMC exposed as a disk. No command channel exists in this mode.
#[derive(Debug, Clone)]
pub struct MassStorageSession {
    pub volume: String,
    /// Device arrived but no working driver was bound.
    pub driver_missing: bool,
}

impl DeviceSession for MassStorageSession {
    fn mode(&self) -> Mode {
        if self.driver_missing {
            Mode::BadMassStorage
        } else {
            Mode::MassStorage
        }
    }

    fn read_info(&self) -> Result<DeviceInfo, SessionError> {
        Ok(DeviceInfo::MassStorage {
            volume: self.volume.clone(),
        })
    }

    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError> {
        Err(SessionError::SwitchNotSupported {
            from: self.mode(),
            target,
        })
    }

    fn close(&self) {}
}

/// Qualcomm emergency interface. Leaving it needs a programmer upload,
/// which is outside this crate.
#[derive(Debug, Clone)]
pub struct QualcommSession {
    pub sub_mode: QualcommSubMode,
}

impl DeviceSession for QualcommSession {
    fn mode(&self) -> Mode {
        self.sub_mode.into()
    }

    fn read_info(&self) -> Result<DeviceInfo, SessionError> {
        Ok(DeviceInfo::Qualcomm {
            sub_mode: self.sub_mode,
        })
    }

    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError> {
        Err(SessionError::SwitchNotSupported {
            from: self.mode(),
            target,
        })
    }

    fn close(&self) {}
}

/// Live session for whichever mode the device arrived in.
pub enum ModeSession {
    /// Bootloader, flash app or phone-info app.
    LumiaFlash(LumiaFlashSession),
    Normal(JsonRpcSession),
    Label(JsonRpcSession),
    MassStorage(MassStorageSession),
    Qualcomm(QualcommSession),
}

impl ModeSession {
    fn inner(&self) -> &dyn DeviceSession {
        match self {
            ModeSession::LumiaFlash(s) => s,
            ModeSession::Normal(s) | ModeSession::Label(s) => s,
            ModeSession::MassStorage(s) => s,
            ModeSession::Qualcomm(s) => s,
        }
    }

    pub fn as_flash(&self) -> Option<&LumiaFlashSession> {
        match self {
            ModeSession::LumiaFlash(s) => Some(s),
            _ => None,
        }
    }
}

impl DeviceSession for ModeSession {
    fn mode(&self) -> Mode {
        self.inner().mode()
    }

    fn read_info(&self) -> Result<DeviceInfo, SessionError> {
        self.inner().read_info()
    }

    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError> {
        debug!(from = %self.mode(), ?target, "Requesting mode switch");
        self.inner().request_switch(target)
    }

    fn close(&self) {
        self.inner().close();
    }
}

impl fmt::Debug for ModeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModeSession({})", self.mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_storage_session() {
        let s = ModeSession::MassStorage(MassStorageSession {
            volume: "E:".into(),
            driver_missing: false,
        });
        assert_eq!(s.mode(), Mode::MassStorage);
        assert_eq!(
            s.read_info().unwrap(),
            DeviceInfo::MassStorage { volume: "E:".into() }
        );
        assert!(matches!(
            s.request_switch(Some(Mode::FlashApp)),
            Err(SessionError::SwitchNotSupported { .. })
        ));
        assert!(s.as_flash().is_none());
    }

    #[test]
    fn test_bad_mass_storage_mode() {
        let s = MassStorageSession {
            volume: String::new(),
            driver_missing: true,
        };
        assert_eq!(s.mode(), Mode::BadMassStorage);
    }

    #[test]
    fn test_qualcomm_session_mode() {
        let s = QualcommSession {
            sub_mode: QualcommSubMode::Flash,
        };
        assert_eq!(s.mode(), Mode::QualcommFlash);
    }
}
