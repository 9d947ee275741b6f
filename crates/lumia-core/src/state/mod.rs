//! Device mode tracking and mode transitions.

pub mod monitor;
pub mod switcher;

pub use monitor::{DeviceMonitor, Notifier, Subscription};
pub use switcher::{ModeSwitcher, SilentProgress, SwitchError, SwitchProgress};
