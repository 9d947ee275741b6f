//! Flash dialect response parsing.
//!
//! Every response echoes the command signature, followed by a big-endian
//! 16-bit status and a command-specific body. A device that does not
//! recognise a command answers with the bare `NOKU` signature.

use std::fmt;

use thiserror::Error;

use super::constants::RESPONSE_UNKNOWN;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Empty response to {command}")]
    EmptyResponse { command: String },

    #[error("Command {command} not recognised by device")]
    UnknownCommand { command: String },

    #[error("Unexpected response to {command}: {actual}")]
    SignatureMismatch { command: String, actual: String },

    #[error("Device reported error 0x{status:04X} for {command}")]
    DeviceError { command: String, status: u16 },

    #[error("Response to {command} truncated: {actual} bytes, need {expected}")]
    Truncated {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed JSON-RPC reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Parsed response to a flash dialect command.
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    signature: Vec<u8>,
    status: u16,
    body: Vec<u8>,
}

impl Response {
    /// Parse the raw reply to `command`.
    pub fn parse(command: &[u8], bytes: &[u8]) -> Result<Self, ProtocolError> {
        let name = ascii(command);
        if bytes.is_empty() {
            return Err(ProtocolError::EmptyResponse { command: name });
        }
        if bytes.starts_with(RESPONSE_UNKNOWN) && !command.starts_with(RESPONSE_UNKNOWN) {
            return Err(ProtocolError::UnknownCommand { command: name });
        }
        if !bytes.starts_with(command) {
            return Err(ProtocolError::SignatureMismatch {
                command: name,
                actual: ascii(&bytes[..bytes.len().min(command.len())]),
            });
        }
        let header = command.len() + 2;
        if bytes.len() < header {
            return Err(ProtocolError::Truncated {
                command: name,
                expected: header,
                actual: bytes.len(),
            });
        }
        let status = u16::from_be_bytes([bytes[command.len()], bytes[command.len() + 1]]);
        Ok(Self {
            signature: command.to_vec(),
            status,
            body: bytes[header..].to_vec(),
        })
    }

    /// Parse and fail on a non-zero device status.
    pub fn parse_ok(command: &[u8], bytes: &[u8]) -> Result<Self, ProtocolError> {
        let response = Self::parse(command, bytes)?;
        if response.is_error() {
            return Err(ProtocolError::DeviceError {
                command: ascii(command),
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Build the wire form of a response; used by tests and mocks.
    pub fn encode(command: &[u8], status: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(command.len() + 2 + body.len());
        out.extend_from_slice(command);
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// ASCII form of the echoed signature.
    pub fn as_ascii(&self) -> String {
        ascii(&self.signature)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response({} status=0x{:04X} body={}B)",
            self.as_ascii(),
            self.status,
            self.body.len()
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ascii())
    }
}

pub(crate) fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}
