//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for USB communication and the
//! `DeviceHost` trait that opens transports for arriving devices,
//! allowing different implementations (nusb, mock, etc.).

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Unrecognised device path: {0}")]
    InvalidPath(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Write raw bytes to the OUT endpoint.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read raw bytes from the IN endpoint.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Write a request and read its reply.
    fn execute(&self, request: &[u8], max_response: usize) -> Result<Vec<u8>, TransportError> {
        self.write(request)?;
        self.read(max_response)
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

/// Opens devices announced by arrival notifications.
///
/// The monitor asks the host for a transport when it must talk to the
/// device to classify it, and for the mounted volume of a mass-storage
/// arrival.
pub trait DeviceHost: Send + Sync {
    fn open_transport(&self, device_path: &str) -> Result<Arc<dyn UsbTransport>, TransportError>;

    /// Logical volume assigned to a mass-storage device, once it exists.
    fn resolve_volume(&self, device_path: &str) -> Option<String>;
}
