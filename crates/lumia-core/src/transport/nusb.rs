//! nusb-based USB transport, device host and arrival watcher.

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceHost, TransportError, UsbTransport};
use crate::device::{DevicePath, InterfaceClass, UsbNotification};
use crate::protocol::constants::*;
use crate::state::Notifier;

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    connected: AtomicBool,
}

impl NusbTransport {
    /// Open the device named by a device path and claim the interface in
    /// its `MI_xx` tag (interface 0 without one).
    #[instrument(level = "info")]
    pub fn open_path(device_path: &str) -> Result<Self, TransportError> {
        let path = DevicePath::parse(device_path);
        let (vid, pid) = path
            .ids()
            .ok_or_else(|| TransportError::InvalidPath(device_path.to_string()))?;
        let location = instance_segment(device_path);

        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| {
                d.vendor_id() == vid
                    && d.product_id() == pid
                    && location
                        .as_deref()
                        .is_none_or(|l| l.eq_ignore_ascii_case(&device_location(d)))
            })
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info, path.interface_number.unwrap_or(0))
    }

    fn open_device_info(device_info: nusb::DeviceInfo, interface_number: u8) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            interface = interface_number,
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .claim_interface(interface_number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: interface_number,
                message: e.to_string(),
            })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != interface_number {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            connected: AtomicBool::new(true),
        })
    }

    fn transfer_error(&self, e: std::io::Error, wrap: fn(String) -> TransportError) -> TransportError {
        if matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::BrokenPipe) {
            self.connected.store(false, Ordering::Relaxed);
            return TransportError::Disconnected;
        }
        wrap(e.to_string())
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        // One transfer per command; the device frames requests by transfer.
        let packet = ep.max_packet_size().max(1);
        let mut writer = ep.writer(data.len().max(1).next_multiple_of(packet));
        writer
            .write_all(data)
            .map_err(|e| self.transfer_error(e, TransportError::WriteFailed))?;
        writer
            .flush()
            .map_err(|e| self.transfer_error(e, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let packet = ep.max_packet_size().max(1);
        let mut reader = ep.reader(max_len.max(1).next_multiple_of(packet));
        let mut buf = vec![0u8; max_len];

        let n = reader
            .read(&mut buf)
            .map_err(|e| self.transfer_error(e, TransportError::ReadFailed))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb has no liveness query; a transfer failing with a
        // disconnect error clears the flag.
        self.connected.load(Ordering::Relaxed)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Opens transports with nusb. Volume resolution is left to the platform
/// glue that mounts the phone's storage.
#[derive(Debug, Default)]
pub struct NusbHost;

impl DeviceHost for NusbHost {
    fn open_transport(&self, device_path: &str) -> Result<Arc<dyn UsbTransport>, TransportError> {
        Ok(Arc::new(NusbTransport::open_path(device_path)?))
    }

    fn resolve_volume(&self, _device_path: &str) -> Option<String> {
        None
    }
}

/// `bus&address`, the instance segment of synthesized paths.
fn device_location(device: &nusb::DeviceInfo) -> String {
    format!("{}&{}", device.bus_id(), device.device_address())
}

fn instance_segment(device_path: &str) -> Option<String> {
    device_path
        .split('#')
        .nth(2)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Interface class and interface number announced for a device id.
fn interface_for(vid: u16, pid: u16) -> Option<(InterfaceClass, Option<u8>)> {
    let id = (vid, pid);
    if FLASH_PIDS.contains(&id) {
        Some((InterfaceClass::Flash, None))
    } else if LABEL_PIDS.contains(&id) {
        Some((InterfaceClass::Label, None))
    } else if NORMAL_PIDS.contains(&id) {
        Some((InterfaceClass::Combined, Some(LUMIA_COMBINED_INTERFACE)))
    } else if id == (QUALCOMM_VENDOR_ID, QUALCOMM_EDL_PID) {
        Some((InterfaceClass::ComPort, None))
    } else if id == (QUALCOMM_VENDOR_ID, QUALCOMM_MASS_STORAGE_PID) {
        Some((InterfaceClass::Disk, None))
    } else {
        None
    }
}

/// Build a device path in the form the monitor classifies:
/// `\\?\usb#vid_xxxx&pid_yyyy[&mi_zz]#bus&address#{guid}`.
pub fn synthesize_path(vid: u16, pid: u16, interface: Option<u8>, location: &str, class: InterfaceClass) -> String {
    let mi = interface.map(|n| format!("&mi_{n:02x}")).unwrap_or_default();
    format!(
        r"\\?\usb#vid_{vid:04x}&pid_{pid:04x}{mi}#{location}#{}",
        class.guid().to_ascii_lowercase()
    )
}

/// Polls the USB bus and feeds arrivals and removals into a monitor.
///
/// Stops when dropped.
pub struct UsbWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UsbWatcher {
    pub fn spawn(notifier: Notifier, poll_interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("usb-watcher".into())
            .spawn(move || watch(notifier, poll_interval, flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for UsbWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("USB watcher thread panicked");
        }
    }
}

fn scan() -> Option<HashMap<String, UsbNotification>> {
    let devices = match list_devices().wait() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "USB enumeration failed");
            return None;
        }
    };

    let mut found = HashMap::new();
    for device in devices {
        let Some((class, interface)) = interface_for(device.vendor_id(), device.product_id()) else {
            continue;
        };
        let path = synthesize_path(
            device.vendor_id(),
            device.product_id(),
            interface,
            &device_location(&device),
            class,
        );
        let mut notification = UsbNotification::new(path.clone(), class);
        if let Some(name) = device.product_string() {
            notification = notification.with_bus_name(name);
        }
        found.insert(path, notification);
    }
    Some(found)
}

fn watch(notifier: Notifier, poll_interval: Duration, stop: Arc<AtomicBool>) {
    let mut known: HashMap<String, UsbNotification> = HashMap::new();
    info!(interval_ms = poll_interval.as_millis() as u64, "USB watcher started");

    while !stop.load(Ordering::Relaxed) {
        if let Some(found) = scan() {
            for (path, notification) in &known {
                if !found.contains_key(path) {
                    debug!(%path, "Device left");
                    notifier.removal(notification.clone());
                }
            }
            for (path, notification) in &found {
                if !known.contains_key(path) {
                    debug!(%path, "Device appeared");
                    notifier.arrival(notification.clone());
                }
            }
            known = found;
        }
        thread::sleep(poll_interval);
    }
    debug!("USB watcher stopped");
}
