//! Custom FFU image construction.
//!
//! - **planner**: chunk hashing, payload grouping and burst planning
//! - **header**: fixed binary headers
//! - **manifest**: INI manifest text
//! - **catalog**: unsigned security catalog
//! - **builder**: assembles the header image sent before the payloads

pub mod builder;
pub mod catalog;
pub mod header;
pub mod manifest;
pub mod planner;

use thiserror::Error;

pub use builder::{BuildParams, FlashImage, build_image};
pub use header::{HeaderError, ImageHeader, SecurityHeader, StoreHeader, WriteDescriptor};
pub use manifest::ManifestOptions;
pub use planner::{ChunkSource, FlashPart, PartStream, Payload, PlanOptions, bursts, plan_payloads};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Alignment violation in {label}: {reason}")]
    AlignmentViolation { label: String, reason: String },

    #[error("Stream for {label} is not seekable: {message}")]
    NotSeekable { label: String, message: String },

    #[error("Chunk index {0} does not fit the write descriptor format")]
    LocationOutOfRange(u64),

    #[error("No payloads to write")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
