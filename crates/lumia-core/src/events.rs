//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow device arrivals and flash progress
//! without tight coupling to the core logic.

use std::fmt;

use crate::device::{ArrivalEvent, Mode};

/// Topology change published by the device monitor.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Arrival(ArrivalEvent),
    /// The current device went away. Carries the mode it was in.
    Removal { mode: Mode },
}

/// Phases of a custom flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Checking device capabilities and flash parts.
    Preparing,
    /// Hashing partition content and building the image.
    BuildingImage,
    /// Sending the image header.
    SendingHeader,
    /// Streaming payload chunks.
    SendingPayloads,
    /// Waiting for the device to reset.
    Resetting,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Preparing => write!(f, "Preparing"),
            FlashPhase::BuildingImage => write!(f, "Building Image"),
            FlashPhase::SendingHeader => write!(f, "Sending Header"),
            FlashPhase::SendingPayloads => write!(f, "Sending Payloads"),
            FlashPhase::Resetting => write!(f, "Resetting"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted while flashing.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress update for current operation.
    Progress {
        phase: FlashPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Data written to the device.
    Packet { packet_type: String, length: usize },
    /// Error occurred.
    Error { message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::Packet {
                packet_type,
                length,
            } => {
                tracing::trace!(type_ = %packet_type, len = length, "USB Packet");
            }
            FlashEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that records every event.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<FlashEvent>>,
    }

    impl FlashObserver for RecordingObserver {
        fn on_event(&self, event: &FlashEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl RecordingObserver {
        pub fn phases(&self) -> Vec<FlashPhase> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    FlashEvent::PhaseChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect()
        }
    }
}
