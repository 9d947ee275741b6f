//! Custom flash: rewrite partitions through the flash app with a
//! self-built, unsigned image.
//!
//! Device capabilities and flash parts are checked before anything is
//! written. Once streaming starts there is no rollback and no retry.

pub mod transport;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::FlashConfig;
use crate::device::{DeviceSession, LumiaFlashSession, Mode, SessionError};
use crate::events::{FlashObserver, FlashPhase};
use crate::ffu::{BuildParams, FlashPart, ImageError, PlanOptions, build_image, plan_payloads};
use crate::gpt::{Gpt, GptError};
use crate::progress::ProgressUpdater;
use crate::protocol::PhoneInfo;
use crate::protocol::constants::{CHUNK_SIZE, SECURE_FLASH_HEADER_LEN};

pub use transport::{FlashTransport, PhaseTracker, RemovalWatch};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Unsupported flash protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("UEFI secure boot is enabled")]
    SecureBootEnabled,

    #[error("Device must be in flash mode, not {0} mode")]
    NotInFlashMode(Mode),

    #[error("{0}")]
    Alignment(ImageError),

    #[error("Image build failed: {0}")]
    Image(ImageError),

    #[error("Custom flash failed")]
    TransferFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Access denied to {}; elevated privileges are required", .path.display())]
    PrivilegeFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Required partition {0} not found")]
    MissingPartition(String),

    #[error("{name} image is {size} bytes but the partition holds {available}")]
    PartitionTooSmall {
        name: String,
        size: u64,
        available: u64,
    },

    #[error("Device error: {0}")]
    Session(#[from] SessionError),

    #[error("GPT error: {0}")]
    Gpt(#[from] GptError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ImageError> for FlashError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::AlignmentViolation { .. } | ImageError::NotSeekable { .. } => {
                FlashError::Alignment(e)
            }
            other => FlashError::Image(other),
        }
    }
}

/// Reject devices that cannot take an unsigned custom image.
pub fn check_device(info: &PhoneInfo) -> Result<(), FlashError> {
    if info.protocol_major < 2 {
        return Err(FlashError::UnsupportedProtocol(format!(
            "version {}.{} is older than 2.0",
            info.protocol_major, info.protocol_minor
        )));
    }
    if !info.sync_v2 {
        return Err(FlashError::UnsupportedProtocol(
            "Sync V2 is not supported".into(),
        ));
    }
    if info.security.uefi_secure_boot {
        return Err(FlashError::SecureBootEnabled);
    }
    Ok(())
}

/// Flash `parts` to the phone behind `session`.
///
/// `removal` must have been subscribed before the call; it observes the
/// phone leaving the bus after the final reset.
#[instrument(skip_all, fields(parts = parts.len()))]
pub fn custom_flash(
    session: &LumiaFlashSession,
    parts: &mut [FlashPart],
    config: &FlashConfig,
    removal: &dyn RemovalWatch,
    removal_timeout: Option<Duration>,
    observer: &dyn FlashObserver,
    progress: &ProgressUpdater,
) -> Result<(), FlashError> {
    let phases = PhaseTracker::new(observer);
    let result = run(session, parts, config, removal, removal_timeout, &phases, progress);

    if let Err(e) = &result
        && phases.current() != FlashPhase::Error
    {
        error!(error = %e, "Custom flash aborted before transfer");
        phases.fail(e.to_string());
    }
    result
}

fn run(
    session: &LumiaFlashSession,
    parts: &mut [FlashPart],
    config: &FlashConfig,
    removal: &dyn RemovalWatch,
    removal_timeout: Option<Duration>,
    phases: &PhaseTracker<'_>,
    progress: &ProgressUpdater,
) -> Result<(), FlashError> {
    if session.mode() != Mode::FlashApp {
        return Err(FlashError::NotInFlashMode(session.mode()));
    }

    let info = session.read_phone_info()?;
    check_device(&info)?;
    info!(
        platform = %info.platform_id,
        protocol = %format!("{}.{}", info.protocol_major, info.protocol_minor),
        insecure = info.is_insecure(),
        "Device accepted for custom flash"
    );

    phases.enter(FlashPhase::BuildingImage);
    let options = PlanOptions {
        chunk_size: CHUNK_SIZE,
        check_alignment: config.check_alignment,
    };
    let payloads = plan_payloads(parts, &options, Some(progress))?;

    let gpt = Gpt::parse(&session.read_gpt_chunk()?)?;
    let image = build_image(
        &payloads,
        &BuildParams {
            platform_id: &info.platform_id,
            emmc_sector_count: info.emmc_sectors,
            gpt: &gpt,
            manifest: &config.manifest,
        },
    )?;

    FlashTransport::new(session, &info, progress, phases)
        .skip_signature_when_insecure(config.skip_signature_when_insecure)
        .removal_timeout(removal_timeout)
        .send(&image, &payloads, parts, removal)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::protocol::FlashAppType;

    /// Capable, insecure device with room for two chunks per burst.
    pub fn capable_info() -> PhoneInfo {
        PhoneInfo {
            app_type: FlashAppType::FlashApp,
            protocol_major: 2,
            protocol_minor: 1,
            write_buffer_size: 2 * CHUNK_SIZE,
            transfer_size: 2 * CHUNK_SIZE + SECURE_FLASH_HEADER_LEN,
            emmc_sectors: 30_777_344,
            platform_id: "Microsoft.MSM8994.P6211.1.0".into(),
            sync_v2: true,
            ..Default::default()
        }
    }

    /// Removal that has already happened.
    pub struct Removed;

    impl RemovalWatch for Removed {
        fn wait_for_removal(&self, _timeout: Option<Duration>) -> Result<Mode, crate::state::SwitchError> {
            Ok(Mode::FlashApp)
        }
    }
}
