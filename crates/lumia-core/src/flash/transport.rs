//! Streams a built image and its payloads to a flash-app session.

use std::cell::Cell;
use std::error::Error;
use std::time::Duration;

use tracing::{debug, error, info, instrument};

use super::FlashError;
use crate::device::{LumiaFlashSession, Mode};
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::ffu::planner::read_chunk;
use crate::ffu::{FlashImage, FlashPart, Payload, bursts};
use crate::progress::ProgressUpdater;
use crate::protocol::PhoneInfo;
use crate::protocol::constants::{CHUNK_SIZE, FFU_OPTION_SKIP_SIGNATURE};
use crate::state::{Subscription, SwitchError};

type BoxError = Box<dyn Error + Send + Sync>;

/// Blocks until the device has left the bus after its reset.
pub trait RemovalWatch {
    fn wait_for_removal(&self, timeout: Option<Duration>) -> Result<Mode, SwitchError>;
}

impl RemovalWatch for Subscription {
    fn wait_for_removal(&self, timeout: Option<Duration>) -> Result<Mode, SwitchError> {
        Subscription::wait_for_removal(self, timeout)
    }
}

/// Current flash phase, reported to an observer on every change.
pub struct PhaseTracker<'a> {
    observer: &'a dyn FlashObserver,
    current: Cell<FlashPhase>,
}

impl<'a> PhaseTracker<'a> {
    pub fn new(observer: &'a dyn FlashObserver) -> Self {
        Self {
            observer,
            current: Cell::new(FlashPhase::Preparing),
        }
    }

    pub fn enter(&self, to: FlashPhase) {
        let from = self.current.replace(to);
        if from != to {
            self.observer.on_event(&FlashEvent::PhaseChanged { from, to });
        }
    }

    pub fn current(&self) -> FlashPhase {
        self.current.get()
    }

    pub fn observer(&self) -> &'a dyn FlashObserver {
        self.observer
    }

    /// Report a failure and move to the error phase.
    pub fn fail(&self, message: String) {
        self.observer.on_event(&FlashEvent::Error { message });
        self.enter(FlashPhase::Error);
    }
}

pub struct FlashTransport<'a> {
    session: &'a LumiaFlashSession,
    info: &'a PhoneInfo,
    progress: &'a ProgressUpdater,
    phases: &'a PhaseTracker<'a>,
    chunk_size: usize,
    skip_signature_when_insecure: bool,
    removal_timeout: Option<Duration>,
}

impl<'a> FlashTransport<'a> {
    pub fn new(
        session: &'a LumiaFlashSession,
        info: &'a PhoneInfo,
        progress: &'a ProgressUpdater,
        phases: &'a PhaseTracker<'a>,
    ) -> Self {
        Self {
            session,
            info,
            progress,
            phases,
            chunk_size: CHUNK_SIZE,
            skip_signature_when_insecure: true,
            removal_timeout: None,
        }
    }

    /// Chunk size the payloads were planned with.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn skip_signature_when_insecure(mut self, skip: bool) -> Self {
        self.skip_signature_when_insecure = skip;
        self
    }

    pub fn removal_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.removal_timeout = timeout;
        self
    }

    /// Header option byte for this device.
    pub fn header_options(&self) -> u8 {
        if self.skip_signature_when_insecure && self.info.is_insecure() {
            FFU_OPTION_SKIP_SIGNATURE
        } else {
            0
        }
    }

    fn uses_bursts(&self) -> bool {
        self.info.protocol_major >= 2 && self.info.sync_v2
    }

    /// Send header and payloads, reset the phone and wait for it to leave.
    ///
    /// Any failure aborts the transfer; what was already written stays
    /// written.
    #[instrument(skip_all, fields(payloads = payloads.len(), header_len = image.len()))]
    pub fn send(
        &self,
        image: &FlashImage,
        payloads: &[Payload],
        parts: &mut [FlashPart],
        removal: &dyn RemovalWatch,
    ) -> Result<(), FlashError> {
        self.stream(image, payloads, parts, removal).map_err(|e| {
            error!(error = %e, phase = %self.phases.current(), "Custom flash failed");
            self.phases.fail(e.to_string());
            FlashError::TransferFailure(e)
        })
    }

    fn stream(
        &self,
        image: &FlashImage,
        payloads: &[Payload],
        parts: &mut [FlashPart],
        removal: &dyn RemovalWatch,
    ) -> Result<(), BoxError> {
        let observer = self.phases.observer();

        self.phases.enter(FlashPhase::SendingHeader);
        let options = self.header_options();
        self.session.send_ffu_header(&image.data, options)?;
        observer.on_event(&FlashEvent::Packet {
            packet_type: "FFU header".into(),
            length: image.len(),
        });
        debug!(options, "Header accepted");

        self.phases.enter(FlashPhase::SendingPayloads);
        let total = payloads.len();
        self.progress.reset(total as u64);

        let groups = if self.uses_bursts() {
            bursts(payloads, self.info.max_chunks_per_burst())
        } else {
            (0..total).map(|i| i..i + 1).collect()
        };
        info!(
            payloads = total,
            transfers = groups.len(),
            v2 = self.uses_bursts(),
            "Sending payloads"
        );

        let chunk = self.chunk_size;
        let mut buffer = Vec::new();
        let mut sent = 0usize;
        for group in groups {
            buffer.clear();
            buffer.resize(group.len() * chunk, 0);
            for (slot, payload) in payloads[group.clone()].iter().enumerate() {
                read_chunk(parts, payload.sources[0], chunk, &mut buffer[slot * chunk..])?;
            }

            sent += group.len();
            let percent = (sent * 100 / total) as u8;
            if self.uses_bursts() {
                self.session.send_ffu_payload_v2(&buffer, percent)?;
            } else {
                self.session.send_ffu_payload_v1(&buffer, percent)?;
            }

            self.progress.set_progress(sent as u64);
            observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::SendingPayloads,
                operation: "Payloads".into(),
                current: sent as u64,
                total: total as u64,
            });
        }

        self.phases.enter(FlashPhase::Resetting);
        self.session.reset_phone()?;
        removal.wait_for_removal(self.removal_timeout)?;

        self.phases.enter(FlashPhase::Complete);
        observer.on_event(&FlashEvent::Complete);
        info!("Custom flash complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::ffu::planner::testing::part_with_chunks;
    use crate::ffu::{BuildParams, ManifestOptions, PlanOptions, build_image, plan_payloads};
    use crate::flash::testing::{Removed, capable_info};
    use crate::gpt::Gpt;
    use crate::gpt::testing::build_gpt;
    use crate::protocol::constants::{CMD_SECURE_FLASH, SUBBLOCK_FFU_PAYLOAD_V1};
    use crate::state::monitor::testing::flash_device;

    #[test]
    fn test_v1_sends_one_chunk_per_request() {
        let info = PhoneInfo {
            sync_v2: false,
            ..capable_info()
        };
        let mock = flash_device(Arc::new(Mutex::new(info.app_type)), info.clone(), None);
        let session = LumiaFlashSession::new(mock.clone(), info.app_type);

        let mut parts = vec![part_with_chunks(0, &[1, 2], CHUNK_SIZE)];
        let payloads = plan_payloads(&mut parts, &PlanOptions::default(), None).unwrap();
        let gpt = Gpt::parse(&build_gpt(&[("MainOS", 256, 4095)])).unwrap();
        let image = build_image(
            &payloads,
            &BuildParams {
                platform_id: &info.platform_id,
                emmc_sector_count: info.emmc_sectors,
                gpt: &gpt,
                manifest: &ManifestOptions::default(),
            },
        )
        .unwrap();

        let observer = RecordingObserver::default();
        let phases = PhaseTracker::new(&observer);
        let progress = ProgressUpdater::silent(0);
        FlashTransport::new(&session, &info, &progress, &phases)
            .send(&image, &payloads, &mut parts, &Removed)
            .unwrap();

        let flash_writes: Vec<_> = mock
            .get_writes()
            .into_iter()
            .filter(|w| w.starts_with(CMD_SECURE_FLASH))
            .collect();
        assert_eq!(flash_writes.len(), 3);
        for payload in &flash_writes[1..] {
            assert_eq!(&payload[0x0C..0x10], &SUBBLOCK_FFU_PAYLOAD_V1.to_be_bytes());
            assert_eq!(&payload[0x06..0x08], &1u16.to_be_bytes());
        }
        assert_eq!(flash_writes[1][0x08], 50);
        assert_eq!(phases.current(), FlashPhase::Complete);
    }

    #[test]
    fn test_secure_device_keeps_signature_check() {
        let mut info = capable_info();
        info.security.platform_secure_boot = true;
        info.security.secure_ffu = true;
        let mock = flash_device(Arc::new(Mutex::new(info.app_type)), info.clone(), None);
        let session = LumiaFlashSession::new(mock, info.app_type);
        let observer = RecordingObserver::default();
        let phases = PhaseTracker::new(&observer);
        let progress = ProgressUpdater::silent(0);

        let transport = FlashTransport::new(&session, &info, &progress, &phases);
        assert_eq!(transport.header_options(), 0);

        let insecure = capable_info();
        let transport = FlashTransport::new(&session, &insecure, &progress, &phases);
        assert_eq!(transport.header_options(), FFU_OPTION_SKIP_SIGNATURE);
        let transport = transport.skip_signature_when_insecure(false);
        assert_eq!(transport.header_options(), 0);
    }

    #[test]
    fn test_phase_tracker_reports_changes_only() {
        let observer = RecordingObserver::default();
        let phases = PhaseTracker::new(&observer);
        phases.enter(FlashPhase::Preparing);
        phases.enter(FlashPhase::BuildingImage);
        phases.enter(FlashPhase::BuildingImage);
        phases.fail("boom".into());

        assert_eq!(observer.phases(), vec![FlashPhase::BuildingImage, FlashPhase::Error]);
        assert!(matches!(
            observer.events.lock().unwrap()[1],
            FlashEvent::Error { ref message } if message == "boom"
        ));
    }
}
