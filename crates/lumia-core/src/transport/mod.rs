//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockHost, MockTransport};
pub use nusb::{NusbHost, NusbTransport, UsbWatcher};
pub use traits::{DeviceHost, TransportError, UsbTransport};
