//! Device mode monitor.
//!
//! USB notifications are queued to one worker thread, which classifies
//! them, owns the current session and publishes arrival/removal events to
//! subscribers. The legacy-interface window and the mass-storage settle
//! delay are deadlines serviced by the same worker, so classification of
//! one device never overlaps another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::switcher::SwitchError;
use crate::config::MonitorConfig;
use crate::device::session::{MassStorageSession, QualcommSession};
use crate::device::{
    ArrivalEvent, DeviceClassifier, DeviceFamily, DevicePath, DeviceSession, JsonRpcSession,
    LumiaFlashSession, Mode, ModeSession, QualcommSubMode, UsbNotification,
};
use crate::events::DeviceEvent;
use crate::transport::DeviceHost;

enum Input {
    Arrival(UsbNotification),
    Removal(UsbNotification),
    DriverFailure(String),
    Shutdown,
}

/// Cloneable handle feeding USB notifications into a monitor.
#[derive(Clone)]
pub struct Notifier {
    inputs: Sender<Input>,
}

impl Notifier {
    fn send(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            debug!("Device monitor stopped; notification dropped");
        }
    }

    pub fn arrival(&self, notification: UsbNotification) {
        self.send(Input::Arrival(notification));
    }

    pub fn removal(&self, notification: UsbNotification) {
        self.send(Input::Removal(notification));
    }

    /// A disk-class device appeared but no working driver was bound.
    pub fn driver_failure(&self, device_path: impl Into<String>) {
        self.send(Input::DriverFailure(device_path.into()));
    }
}

struct Attached {
    mode: Mode,
    session: Arc<ModeSession>,
    device_path: String,
}

struct MonitorState {
    current: Option<Attached>,
    last_mode: Mode,
    last_qualcomm: Option<Mode>,
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<Vec<(u64, Sender<DeviceEvent>)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn dispatch(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }
}

struct Shared {
    state: Mutex<MonitorState>,
    registry: Arc<Registry>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Event stream of one subscriber. Dropping it deregisters.
pub struct Subscription {
    id: u64,
    events: Receiver<DeviceEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Next event, or `Timeout` once `timeout` has elapsed.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<DeviceEvent, SwitchError> {
        match timeout {
            Some(t) => self.events.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => SwitchError::Timeout {
                    stage: "device event",
                    timeout: t,
                },
                RecvTimeoutError::Disconnected => SwitchError::Disconnected,
            }),
            None => self.events.recv().map_err(|_| SwitchError::Disconnected),
        }
    }

    fn wait_for<T>(
        &self,
        stage: &'static str,
        timeout: Option<Duration>,
        mut pick: impl FnMut(DeviceEvent) -> Option<T>,
    ) -> Result<T, SwitchError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let event = self.recv(remaining).map_err(|e| match e {
                SwitchError::Timeout { .. } => SwitchError::Timeout {
                    stage,
                    timeout: timeout.unwrap_or_default(),
                },
                other => other,
            })?;
            if let Some(found) = pick(event) {
                return Ok(found);
            }
        }
    }

    /// Block until the next arrival published after this subscription was made.
    pub fn wait_for_arrival(&self, timeout: Option<Duration>) -> Result<ArrivalEvent, SwitchError> {
        self.wait_for("arrival", timeout, |event| match event {
            DeviceEvent::Arrival(arrival) => Some(arrival),
            DeviceEvent::Removal { .. } => None,
        })
    }

    /// Block until the next removal; returns the mode the device was in.
    pub fn wait_for_removal(&self, timeout: Option<Duration>) -> Result<Mode, SwitchError> {
        self.wait_for("removal", timeout, |event| match event {
            DeviceEvent::Removal { mode } => Some(mode),
            DeviceEvent::Arrival(_) => None,
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

pub struct DeviceMonitor {
    shared: Arc<Shared>,
    notifier: Notifier,
    worker: Option<JoinHandle<()>>,
}

impl DeviceMonitor {
    /// Start the worker thread.
    pub fn new(host: Arc<dyn DeviceHost>, config: MonitorConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(MonitorState {
                current: None,
                last_mode: Mode::Disconnected,
                last_qualcomm: None,
            }),
            registry: Arc::new(Registry::default()),
        });
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            host,
            shared: shared.clone(),
            config,
            pending_legacy: None,
            pending_mass_storage: Vec::new(),
            last_modern_arrival: None,
        };
        let handle = thread::Builder::new()
            .name("device-monitor".into())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            shared,
            notifier: Notifier { inputs: tx },
            worker: Some(handle),
        })
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn notify_arrival(&self, notification: UsbNotification) {
        self.notifier.arrival(notification);
    }

    pub fn notify_removal(&self, notification: UsbNotification) {
        self.notifier.removal(notification);
    }

    pub fn notify_driver_failure(&self, device_path: impl Into<String>) {
        self.notifier.driver_failure(device_path);
    }

    pub fn current_mode(&self) -> Mode {
        self.shared
            .lock()
            .current
            .as_ref()
            .map_or(Mode::Disconnected, |a| a.mode)
    }

    pub fn current_session(&self) -> Option<Arc<ModeSession>> {
        self.shared.lock().current.as_ref().map(|a| a.session.clone())
    }

    pub fn current_device_path(&self) -> Option<String> {
        self.shared.lock().current.as_ref().map(|a| a.device_path.clone())
    }

    /// Mode the device was in before its last removal.
    pub fn last_mode(&self) -> Mode {
        self.shared.lock().last_mode
    }

    pub fn subscribe(&self) -> Subscription {
        let registry = &self.shared.registry;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        registry
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));
        Subscription {
            id,
            events: rx,
            registry: Arc::downgrade(registry),
        }
    }

    /// Subscribe and wait for the next arrival.
    pub fn wait_for_arrival(&self, timeout: Option<Duration>) -> Result<ArrivalEvent, SwitchError> {
        self.subscribe().wait_for_arrival(timeout)
    }

    /// Session of the connected device, waiting for one to arrive if none is.
    /// The subscription lives only for the wait.
    pub fn wait_for_device(&self, timeout: Option<Duration>) -> Result<Arc<ModeSession>, SwitchError> {
        let events = self.subscribe();
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        Ok(events.wait_for_arrival(timeout)?.session)
    }

    /// Subscribe and wait for the next removal.
    pub fn wait_for_removal(&self, timeout: Option<Duration>) -> Result<Mode, SwitchError> {
        self.subscribe().wait_for_removal(timeout)
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.notifier.send(Input::Shutdown);
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            warn!("Device monitor thread panicked");
        }
        if let Some(attached) = self.shared.lock().current.take() {
            attached.session.close();
        }
    }
}

struct Pending {
    notification: UsbNotification,
    deadline: Instant,
}

/// Path without the trailing interface GUID, so notifications of one
/// physical device on different interface classes compare equal.
fn device_key(path: &str) -> String {
    let lower = path.to_ascii_lowercase();
    match lower.rfind("#{") {
        Some(i) => lower[..i].to_string(),
        None => lower,
    }
}

fn family_owns(family: DeviceFamily, mode: Mode) -> bool {
    match family {
        DeviceFamily::LegacyCombined | DeviceFamily::Normal => mode == Mode::Normal,
        DeviceFamily::Flash => mode.is_flash_family(),
        DeviceFamily::Label => mode == Mode::Label,
        DeviceFamily::MassStorage => matches!(mode, Mode::MassStorage | Mode::BadMassStorage),
        DeviceFamily::QualcommEdl => mode.is_qualcomm(),
    }
}

struct Worker {
    host: Arc<dyn DeviceHost>,
    shared: Arc<Shared>,
    config: MonitorConfig,
    pending_legacy: Option<Pending>,
    pending_mass_storage: Vec<Pending>,
    /// Last arrival of a Lumia device on a non-legacy interface.
    last_modern_arrival: Option<Instant>,
}

impl Worker {
    fn run(mut self, inputs: Receiver<Input>) {
        debug!("Device monitor started");
        loop {
            let input = match self.next_deadline() {
                Some(deadline) => {
                    match inputs.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(input) => Some(input),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inputs.recv() {
                    Ok(input) => Some(input),
                    Err(_) => break,
                },
            };

            match input {
                Some(Input::Shutdown) => break,
                Some(Input::Arrival(n)) => self.on_arrival(n),
                Some(Input::Removal(n)) => self.on_removal(n),
                Some(Input::DriverFailure(path)) => self.on_driver_failure(path),
                None => {}
            }
            self.fire_due(Instant::now());
        }
        debug!("Device monitor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending_legacy
            .iter()
            .chain(self.pending_mass_storage.iter())
            .map(|p| p.deadline)
            .min()
    }

    fn is_attached(&self, family: DeviceFamily, path: &str) -> bool {
        let key = device_key(path);
        self.shared
            .lock()
            .current
            .as_ref()
            .is_some_and(|a| family_owns(family, a.mode) && device_key(&a.device_path) == key)
    }

    fn on_arrival(&mut self, n: UsbNotification) {
        let Some(family) = DeviceClassifier::classify(&n) else {
            trace!(path = %n.device_path, "Ignoring foreign arrival");
            return;
        };

        if family != DeviceFamily::LegacyCombined && DevicePath::parse(&n.device_path).is_lumia_vendor() {
            self.last_modern_arrival = Some(Instant::now());
            if let Some(legacy) = self.pending_legacy.take() {
                info!(
                    legacy = %legacy.notification.device_path,
                    modern = %n.device_path,
                    "Modern interface claimed the device; legacy arrival suppressed"
                );
            }
        }

        if self.is_attached(family, &n.device_path) {
            debug!(path = %n.device_path, "Device already attached");
            return;
        }

        match family {
            DeviceFamily::LegacyCombined => {
                if self.modern_interface_claimed() {
                    info!(path = %n.device_path, "Device already reported by the modern interface; legacy arrival suppressed");
                } else if self.pending_legacy.is_none() {
                    debug!(path = %n.device_path, "Legacy interface arrival; waiting for modern interface");
                    self.pending_legacy = Some(Pending {
                        notification: n,
                        deadline: Instant::now() + self.config.legacy_interface_window(),
                    });
                }
            }
            DeviceFamily::Normal => self.attach_json(&n.device_path, Mode::Normal),
            DeviceFamily::Label => self.attach_json(&n.device_path, Mode::Label),
            DeviceFamily::Flash => self.attach_flash(&n.device_path),
            DeviceFamily::MassStorage => {
                let key = device_key(&n.device_path);
                if self
                    .pending_mass_storage
                    .iter()
                    .all(|p| device_key(&p.notification.device_path) != key)
                {
                    self.pending_mass_storage.push(Pending {
                        notification: n,
                        deadline: Instant::now() + self.config.mass_storage_settle(),
                    });
                }
            }
            DeviceFamily::QualcommEdl => self.attach_qualcomm(&n),
        }
    }

    /// A modern-interface arrival landed within the legacy window, or a
    /// phone reported through a modern interface is still attached.
    fn modern_interface_claimed(&self) -> bool {
        let recent = self
            .last_modern_arrival
            .is_some_and(|at| at.elapsed() <= self.config.legacy_interface_window());
        let attached = self.shared.lock().current.as_ref().is_some_and(|a| {
            a.mode.is_flash_family() || matches!(a.mode, Mode::Normal | Mode::Label)
        });
        recent || attached
    }

    fn on_removal(&mut self, n: UsbNotification) {
        let Some(family) = DeviceClassifier::classify(&n) else {
            return;
        };
        let key = device_key(&n.device_path);

        if self
            .pending_legacy
            .as_ref()
            .is_some_and(|p| device_key(&p.notification.device_path) == key)
        {
            debug!("Legacy arrival withdrawn before its window closed");
            self.pending_legacy = None;
        }
        self.pending_mass_storage
            .retain(|p| device_key(&p.notification.device_path) != key);

        let removed = {
            let mut state = self.shared.lock();
            match &state.current {
                Some(a) if family_owns(family, a.mode) => {
                    let removed = state.current.take();
                    if let Some(a) = &removed {
                        state.last_mode = a.mode;
                    }
                    removed
                }
                _ => None,
            }
        };

        if let Some(attached) = removed {
            attached.session.close();
            info!(mode = %attached.mode, path = %n.device_path, "Device removed");
            self.shared
                .registry
                .dispatch(DeviceEvent::Removal { mode: attached.mode });
        }
    }

    fn on_driver_failure(&mut self, path: String) {
        if self.is_attached(DeviceFamily::MassStorage, &path) {
            return;
        }
        let key = device_key(&path);
        self.pending_mass_storage
            .retain(|p| device_key(&p.notification.device_path) != key);
        warn!(path = %path, "Mass storage device has no working driver");
        self.publish(
            ModeSession::MassStorage(MassStorageSession {
                volume: String::new(),
                driver_missing: true,
            }),
            path,
        );
    }

    fn fire_due(&mut self, now: Instant) {
        if self.pending_legacy.as_ref().is_some_and(|p| p.deadline <= now)
            && let Some(legacy) = self.pending_legacy.take()
        {
            info!(path = %legacy.notification.device_path, "No modern interface; device is in legacy normal mode");
            self.attach_json(&legacy.notification.device_path, Mode::Normal);
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_mass_storage)
            .into_iter()
            .partition(|p| p.deadline <= now);
        self.pending_mass_storage = waiting;

        for pending in due {
            let path = pending.notification.device_path;
            if self.is_attached(DeviceFamily::MassStorage, &path) {
                continue;
            }
            match self.host.resolve_volume(&path) {
                Some(volume) => {
                    self.publish(
                        ModeSession::MassStorage(MassStorageSession {
                            volume,
                            driver_missing: false,
                        }),
                        path,
                    );
                }
                None => debug!(path = %path, "No volume assigned yet; waiting for another notification"),
            }
        }
    }

    fn attach_json(&mut self, path: &str, mode: Mode) {
        let transport = match self.host.open_transport(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path, error = %e, "Failed to open phone interface");
                return;
            }
        };
        let session = JsonRpcSession::new(transport, mode);
        let session = match mode {
            Mode::Label => ModeSession::Label(session),
            _ => ModeSession::Normal(session),
        };
        self.publish(session, path.to_string());
    }

    fn attach_flash(&mut self, path: &str) {
        let transport = match self.host.open_transport(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path, error = %e, "Failed to open flash interface");
                return;
            }
        };
        let session = match LumiaFlashSession::open(transport) {
            Ok(s) => s,
            Err(e) => {
                warn!(path, error = %e, "App type query failed");
                return;
            }
        };
        if matches!(session.mode(), Mode::FlashApp | Mode::PhoneInfoApp)
            && let Err(e) = session.disable_reboot_timeout()
        {
            warn!(error = %e, "Failed to disable reboot timeout");
        }
        self.publish(ModeSession::LumiaFlash(session), path.to_string());
    }

    fn attach_qualcomm(&mut self, n: &UsbNotification) {
        let last = self.shared.lock().last_qualcomm;
        let sub_mode = match DeviceClassifier::qualcomm_mode(n.bus_name.as_deref(), last) {
            Mode::QualcommFlash => QualcommSubMode::Flash,
            _ => QualcommSubMode::Download,
        };
        self.publish(
            ModeSession::Qualcomm(QualcommSession { sub_mode }),
            n.device_path.clone(),
        );
    }

    /// Make `session` current, then notify subscribers.
    fn publish(&mut self, session: ModeSession, device_path: String) {
        let mode = session.mode();
        let session = Arc::new(session);
        let replaced = {
            let mut state = self.shared.lock();
            let replaced = state.current.replace(Attached {
                mode,
                session: session.clone(),
                device_path: device_path.clone(),
            });
            if let Some(prev) = &replaced {
                state.last_mode = prev.mode;
            }
            if mode.is_qualcomm() {
                state.last_qualcomm = Some(mode);
            }
            replaced
        };
        if let Some(prev) = replaced {
            debug!(mode = %prev.mode, "Replacing session without removal");
            prev.session.close();
        }

        info!(mode = %mode, path = %device_path, "Device arrived");
        self.shared.registry.dispatch(DeviceEvent::Arrival(ArrivalEvent {
            mode,
            session,
            device_path,
        }));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::protocol::constants::*;
    use crate::protocol::{FlashAppType, PhoneInfo, Response};
    use crate::transport::{MockHost, MockTransport};

    pub const FLASH_PATH: &str =
        r"\\?\usb#vid_0421&pid_066e#6&2f2f4cd1&0&0004#{9e3bd5f7-9690-4fcc-8810-3e2650cd6ecc}";

    pub fn fast_config() -> MonitorConfig {
        MonitorConfig {
            legacy_interface_window_ms: 150,
            mass_storage_settle_ms: 30,
            poll_interval_ms: 10,
        }
    }

    /// Flash-dialect mock answering the info query with whatever app type
    /// `app` currently holds, and the GPT read with `gpt` when given.
    pub fn flash_device(
        app: Arc<Mutex<FlashAppType>>,
        info: PhoneInfo,
        gpt: Option<Vec<u8>>,
    ) -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(move |req| {
            if req == CMD_INFO {
                let info = PhoneInfo {
                    app_type: *app.lock().unwrap(),
                    ..info.clone()
                };
                Some(Response::encode(CMD_INFO, 0, &info.to_body()))
            } else if req == CMD_DISABLE_TIMEOUT {
                Some(Response::encode(CMD_DISABLE_TIMEOUT, 0, &[]))
            } else if req == CMD_READ_GPT {
                gpt.as_ref().map(|g| Response::encode(CMD_READ_GPT, 0, g))
            } else if req.starts_with(CMD_SECURE_FLASH) {
                Some(Response::encode(CMD_SECURE_FLASH, 0, &[]))
            } else {
                None
            }
        });
        mock
    }

    pub fn monitor_with(host: Arc<MockHost>) -> DeviceMonitor {
        DeviceMonitor::new(host, fast_config()).unwrap()
    }
}
