//! Protocol module - flash dialect definitions.

pub mod constants;
pub mod info;
pub mod response;

pub use constants::*;
pub use info::{FlashAppType, PhoneInfo};
pub use response::{ProtocolError, Response};
