//! Lumia-Core: device monitoring, mode switching and custom flashing for
//! Lumia phones over USB.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, response framing, phone info
//! - **Transport**: USB communication abstraction (nusb, mock) and the bus watcher
//! - **Device**: Mode classification and per-mode sessions
//! - **State**: Device monitor and mode switcher
//! - **FFU**: Payload planning and custom image building
//! - **Flash**: Image streaming and the custom flash / restore tasks
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lumia_core::config::LumiaConfig;
//! use lumia_core::device::Mode;
//! use lumia_core::state::{DeviceMonitor, ModeSwitcher};
//! use lumia_core::transport::{NusbHost, UsbWatcher};
//!
//! let config = LumiaConfig::default();
//! let monitor = DeviceMonitor::new(Arc::new(NusbHost), config.monitor.clone()).unwrap();
//! let _watcher = UsbWatcher::spawn(monitor.notifier(), config.monitor.poll_interval()).unwrap();
//!
//! monitor.wait_for_arrival(None).unwrap();
//! let session = ModeSwitcher::new(&monitor)
//!     .with_timeout(config.switch.timeout())
//!     .switch_to(Mode::FlashApp)
//!     .unwrap();
//! ```

pub mod config;
pub mod device;
pub mod events;
pub mod ffu;
pub mod flash;
pub mod gpt;
pub mod progress;
pub mod protocol;
pub mod restore;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::LumiaConfig;
pub use device::{ArrivalEvent, DeviceSession, Mode, ModeSession};
pub use events::{DeviceEvent, FlashEvent, FlashObserver, FlashPhase, TracingObserver};
pub use ffu::{FlashImage, FlashPart, build_image, plan_payloads};
pub use flash::{FlashError, custom_flash};
pub use gpt::{Gpt, GptError, Partition};
pub use progress::{ProgressReport, ProgressUpdater};
pub use restore::{RestoreSources, restore_parts};
pub use state::{DeviceMonitor, ModeSwitcher, SwitchError};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
