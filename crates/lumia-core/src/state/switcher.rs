//! Explicit mode transitions.
//!
//! A switch is: send the mode-specific switch command, wait for the device
//! to leave the bus, wait for it to come back, check the mode it came back
//! in. Waits are unbounded unless a timeout is configured; there is no
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use super::monitor::DeviceMonitor;
use crate::device::{DeviceSession, Mode, ModeSession, SessionError};

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Expected the device in {expected} mode, but it arrived in {actual} mode")]
    UnexpectedMode { expected: Mode, actual: Mode },

    #[error("Timed out waiting for {stage} after {}s", .timeout.as_secs_f32())]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("No device connected")]
    NotConnected,

    #[error("{from} mode cannot switch to {to}")]
    NotSupported { from: Mode, to: Mode },

    #[error("Switch command failed: {0}")]
    Command(SessionError),

    #[error("Device monitor stopped")]
    Disconnected,
}

impl From<SessionError> for SwitchError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::SwitchNotSupported {
                from,
                target: Some(to),
            } => SwitchError::NotSupported { from, to },
            other => SwitchError::Command(other),
        }
    }
}

/// Status callbacks at the switch checkpoints, for callers that render
/// progress. Neither carries a unit count: switches are indeterminate.
pub trait SwitchProgress {
    fn set_working_status(&self, message: &str, submessage: Option<&str>, max_units: Option<u64>);

    fn update_working_status(&self, message: &str, submessage: Option<&str>, current_units: Option<u64>);
}

/// Discards status updates.
pub struct SilentProgress;

impl SwitchProgress for SilentProgress {
    fn set_working_status(&self, _message: &str, _submessage: Option<&str>, _max_units: Option<u64>) {}

    fn update_working_status(&self, _message: &str, _submessage: Option<&str>, _current_units: Option<u64>) {}
}

pub struct ModeSwitcher<'a> {
    monitor: &'a DeviceMonitor,
    timeout: Option<Duration>,
}

impl<'a> ModeSwitcher<'a> {
    /// Switcher that waits indefinitely.
    pub fn new(monitor: &'a DeviceMonitor) -> Self {
        Self {
            monitor,
            timeout: None,
        }
    }

    /// Bound each of the removal and arrival waits.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn switch_to(&self, target: Mode) -> Result<Arc<ModeSession>, SwitchError> {
        self.switch_to_with_progress(target, &SilentProgress)
    }

    /// Switch and return the session of the arrived device.
    #[instrument(skip(self, progress), fields(target = %target))]
    pub fn switch_to_with_progress(
        &self,
        target: Mode,
        progress: &dyn SwitchProgress,
    ) -> Result<Arc<ModeSession>, SwitchError> {
        let session = self.monitor.current_session().ok_or(SwitchError::NotConnected)?;
        let current = session.mode();
        if current == target {
            return Ok(session);
        }

        let message = format!("Switching to {target} mode");
        // Subscribe first so neither event can slip past.
        let events = self.monitor.subscribe();

        progress.set_working_status(&message, Some("Sending switch command"), None);
        info!(from = %current, to = %target, "Requesting mode switch");
        session.request_switch(Some(target))?;
        drop(session);

        progress.update_working_status(&message, Some("Waiting for the device to disconnect"), None);
        events.wait_for_removal(self.timeout)?;

        progress.update_working_status(&message, Some("Waiting for the device to reconnect"), None);
        let arrival = events.wait_for_arrival(self.timeout)?;

        if arrival.mode != target {
            warn!(expected = %target, actual = %arrival.mode, "Device arrived in unexpected mode");
            return Err(SwitchError::UnexpectedMode {
                expected: target,
                actual: arrival.mode,
            });
        }
        info!(mode = %arrival.mode, "Mode switch complete");
        Ok(arrival.session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::device::{InterfaceClass, UsbNotification};
    use crate::protocol::constants::CMD_SWITCH_PHONE_INFO;
    use crate::protocol::{FlashAppType, PhoneInfo};
    use crate::state::monitor::testing::{FLASH_PATH, flash_device, monitor_with};
    use crate::transport::{MockHost, MockTransport};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    struct Fixture {
        monitor: Arc<DeviceMonitor>,
        app: Arc<Mutex<FlashAppType>>,
        mock: Arc<MockTransport>,
    }

    fn flash_mode_fixture() -> Fixture {
        let host = Arc::new(MockHost::new());
        let app = Arc::new(Mutex::new(FlashAppType::FlashApp));
        let mock = flash_device(app.clone(), PhoneInfo::default(), None);
        host.add_transport(FLASH_PATH, mock.clone());

        let monitor = Arc::new(monitor_with(host));
        let sub = monitor.subscribe();
        monitor.notify_arrival(UsbNotification::new(FLASH_PATH, InterfaceClass::Flash));
        sub.wait_for_arrival(WAIT).unwrap();
        Fixture { monitor, app, mock }
    }

    fn wait_for_write(mock: &MockTransport, command: &[u8]) {
        let start = Instant::now();
        while !mock.get_writes().iter().any(|w| w.as_slice() == command) {
            assert!(start.elapsed() < Duration::from_secs(5), "switch command never sent");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Simulate the device dropping off the bus and re-enumerating.
    fn reenumerate(f: &Fixture, app: FlashAppType) {
        *f.app.lock().unwrap() = app;
        f.monitor
            .notify_removal(UsbNotification::new(FLASH_PATH, InterfaceClass::Flash));
        f.monitor
            .notify_arrival(UsbNotification::new(FLASH_PATH, InterfaceClass::Flash));
    }

    #[derive(Default)]
    struct RecordingProgress {
        statuses: Mutex<Vec<String>>,
    }

    impl SwitchProgress for RecordingProgress {
        fn set_working_status(&self, _message: &str, submessage: Option<&str>, _max: Option<u64>) {
            self.statuses.lock().unwrap().push(submessage.unwrap_or_default().to_string());
        }

        fn update_working_status(&self, _message: &str, submessage: Option<&str>, _cur: Option<u64>) {
            self.statuses.lock().unwrap().push(submessage.unwrap_or_default().to_string());
        }
    }

    #[test]
    fn test_switch_to_current_mode_returns_immediately() {
        let f = flash_mode_fixture();
        f.mock.clear_writes();
        let session = ModeSwitcher::new(&f.monitor).switch_to(Mode::FlashApp).unwrap();
        assert_eq!(session.mode(), Mode::FlashApp);
        assert!(f.mock.get_writes().is_empty());
    }

    #[test]
    fn test_switch_with_injected_reenumeration() {
        let f = flash_mode_fixture();
        let monitor = f.monitor.clone();
        let progress = Arc::new(RecordingProgress::default());
        let recorder = progress.clone();

        let switch = thread::spawn(move || {
            ModeSwitcher::new(&monitor).switch_to_with_progress(Mode::PhoneInfoApp, recorder.as_ref())
        });
        wait_for_write(&f.mock, CMD_SWITCH_PHONE_INFO);
        reenumerate(&f, FlashAppType::PhoneInfoApp);

        let session = switch.join().unwrap().unwrap();
        assert_eq!(session.mode(), Mode::PhoneInfoApp);
        assert_eq!(f.monitor.current_mode(), Mode::PhoneInfoApp);
        assert_eq!(
            *progress.statuses.lock().unwrap(),
            vec![
                "Sending switch command",
                "Waiting for the device to disconnect",
                "Waiting for the device to reconnect"
            ]
        );
    }

    #[test]
    fn test_switch_without_rearrival_times_out() {
        let f = flash_mode_fixture();
        let monitor = f.monitor.clone();
        let switch = thread::spawn(move || {
            ModeSwitcher::new(&monitor)
                .with_timeout(Some(Duration::from_millis(300)))
                .switch_to(Mode::PhoneInfoApp)
        });
        wait_for_write(&f.mock, CMD_SWITCH_PHONE_INFO);
        f.monitor
            .notify_removal(UsbNotification::new(FLASH_PATH, InterfaceClass::Flash));

        let err = switch.join().unwrap().unwrap_err();
        assert!(matches!(err, SwitchError::Timeout { stage: "arrival", .. }));
    }

    #[test]
    fn test_unexpected_mode() {
        let f = flash_mode_fixture();
        let monitor = f.monitor.clone();
        let switch = thread::spawn(move || ModeSwitcher::new(&monitor).switch_to(Mode::PhoneInfoApp));
        wait_for_write(&f.mock, CMD_SWITCH_PHONE_INFO);
        reenumerate(&f, FlashAppType::Bootloader);

        let err = switch.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SwitchError::UnexpectedMode {
                expected: Mode::PhoneInfoApp,
                actual: Mode::Bootloader
            }
        ));
    }

    #[test]
    fn test_unsupported_target() {
        let f = flash_mode_fixture();
        let err = ModeSwitcher::new(&f.monitor).switch_to(Mode::Label).unwrap_err();
        assert!(matches!(
            err,
            SwitchError::NotSupported {
                from: Mode::FlashApp,
                to: Mode::Label
            }
        ));
    }

    #[test]
    fn test_not_connected() {
        let monitor = monitor_with(Arc::new(MockHost::new()));
        assert!(matches!(
            ModeSwitcher::new(&monitor).switch_to(Mode::FlashApp),
            Err(SwitchError::NotConnected)
        ));
    }
}
