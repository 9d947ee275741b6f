//! Session for the flash dialect spoken by the bootloader, the flash app
//! and the phone-info app.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use super::Mode;
use super::session::{DeviceInfo, DeviceSession, SessionError};
use crate::protocol::constants::*;
use crate::protocol::{FlashAppType, PhoneInfo, ProtocolError, Response};
use crate::transport::UsbTransport;

/// Maximum reply size for short commands.
const SHORT_RESPONSE: usize = 0x1000;

pub struct LumiaFlashSession {
    transport: Mutex<Option<Arc<dyn UsbTransport>>>,
    app_type: FlashAppType,
}

impl LumiaFlashSession {
    /// Query the app type over a fresh transport and wrap it in a session.
    #[instrument(skip(transport), level = "debug")]
    pub fn open(transport: Arc<dyn UsbTransport>) -> Result<Self, SessionError> {
        let phone_info = query_info(transport.as_ref())?;
        info!(app = %phone_info.app_type, protocol = %format!("{}.{}", phone_info.protocol_major, phone_info.protocol_minor), "Flash dialect device answered");
        Ok(Self::new(transport, phone_info.app_type))
    }

    pub fn new(transport: Arc<dyn UsbTransport>, app_type: FlashAppType) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            app_type,
        }
    }

    pub fn app_type(&self) -> FlashAppType {
        self.app_type
    }

    fn transport(&self) -> Result<Arc<dyn UsbTransport>, SessionError> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::Closed)
    }

    fn execute(&self, command: &[u8], request: &[u8], max_response: usize) -> Result<Response, SessionError> {
        let raw = self.transport()?.execute(request, max_response)?;
        Ok(Response::parse_ok(command, &raw)?)
    }

    /// Send a command the device answers by dropping off the bus.
    fn send_void(&self, command: &[u8]) -> Result<(), SessionError> {
        self.transport()?.write(command)?;
        debug!(command = %String::from_utf8_lossy(command), "Sent");
        Ok(())
    }

    pub fn read_phone_info(&self) -> Result<PhoneInfo, SessionError> {
        query_info(self.transport()?.as_ref())
    }

    /// Stop the firmware watchdog that reboots an idle flash/phone-info app.
    pub fn disable_reboot_timeout(&self) -> Result<(), SessionError> {
        self.execute(CMD_DISABLE_TIMEOUT, CMD_DISABLE_TIMEOUT, SHORT_RESPONSE)?;
        debug!("Reboot timeout disabled");
        Ok(())
    }

    pub fn reset_phone(&self) -> Result<(), SessionError> {
        info!("Resetting phone");
        self.send_void(CMD_RESET)
    }

    /// Read sectors 0..=33, which hold the protective MBR and the GPT.
    pub fn read_gpt_chunk(&self) -> Result<Vec<u8>, SessionError> {
        let response = self.execute(CMD_READ_GPT, CMD_READ_GPT, GPT_READ_LEN + 0x100)?;
        if response.body().len() < GPT_READ_LEN {
            return Err(ProtocolError::Truncated {
                command: "NOKT".into(),
                expected: GPT_READ_LEN,
                actual: response.body().len(),
            }
            .into());
        }
        Ok(response.body()[..GPT_READ_LEN].to_vec())
    }

    /// Send the FFU header regions in one blocking write.
    #[instrument(skip(self, header), fields(len = header.len()))]
    pub fn send_ffu_header(&self, header: &[u8], options: u8) -> Result<(), SessionError> {
        let request = secure_flash_request(1, 0, SUBBLOCK_FFU_HEADER, options, header);
        self.execute(CMD_SECURE_FLASH, &request, SHORT_RESPONSE)?;
        Ok(())
    }

    /// Send one chunk with the V1 protocol.
    pub fn send_ffu_payload_v1(&self, data: &[u8], progress: u8) -> Result<(), SessionError> {
        let request = secure_flash_request(1, progress, SUBBLOCK_FFU_PAYLOAD_V1, 0, data);
        self.execute(CMD_SECURE_FLASH, &request, SHORT_RESPONSE)?;
        Ok(())
    }

    /// Send a burst of chunks with the V2 protocol.
    pub fn send_ffu_payload_v2(&self, data: &[u8], progress: u8) -> Result<(), SessionError> {
        let request = secure_flash_request(2, progress, SUBBLOCK_FFU_PAYLOAD_V2, 0, data);
        self.execute(CMD_SECURE_FLASH, &request, SHORT_RESPONSE)?;
        Ok(())
    }
}

fn query_info(transport: &dyn UsbTransport) -> Result<PhoneInfo, SessionError> {
    let raw = transport.execute(CMD_INFO, SHORT_RESPONSE)?;
    let response = Response::parse_ok(CMD_INFO, &raw)?;
    Ok(PhoneInfo::parse(response.body())?)
}

/// Frame a secure-flash request.
///
/// Layout: signature, u16 protocol version, progress byte, reserved,
/// sub-block count, then one sub-block `{type, length, reserved, data
/// length, options}` followed by the data at 0x20.
pub(crate) fn secure_flash_request(
    protocol: u16,
    progress: u8,
    subblock: u32,
    options: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut request = vec![0u8; SECURE_FLASH_HEADER_LEN + data.len()];
    request[..CMD_SECURE_FLASH.len()].copy_from_slice(CMD_SECURE_FLASH);
    request[0x06..0x08].copy_from_slice(&protocol.to_be_bytes());
    request[0x08] = progress;
    request[0x0B] = 1;
    request[0x0C..0x10].copy_from_slice(&subblock.to_be_bytes());
    request[0x10..0x14].copy_from_slice(&((data.len() + 0x0C) as u32).to_be_bytes());
    request[0x18..0x1C].copy_from_slice(&(data.len() as u32).to_be_bytes());
    request[0x1C] = options;
    request[SECURE_FLASH_HEADER_LEN..].copy_from_slice(data);
    request
}

impl DeviceSession for LumiaFlashSession {
    fn mode(&self) -> Mode {
        match self.app_type {
            FlashAppType::Bootloader => Mode::Bootloader,
            FlashAppType::FlashApp => Mode::FlashApp,
            FlashAppType::PhoneInfoApp => Mode::PhoneInfoApp,
        }
    }

    fn read_info(&self) -> Result<DeviceInfo, SessionError> {
        Ok(DeviceInfo::Flash(self.read_phone_info()?))
    }

    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError> {
        let command = match target {
            Some(Mode::Bootloader) => CMD_SWITCH_BOOTLOADER,
            Some(Mode::FlashApp) => CMD_SWITCH_FLASH,
            Some(Mode::PhoneInfoApp) => CMD_SWITCH_PHONE_INFO,
            Some(Mode::MassStorage) => CMD_MASS_STORAGE,
            Some(Mode::Normal) | None => CMD_RESET,
            Some(other) => {
                warn!(from = %self.mode(), to = %other, "Switch not reachable from flash dialect");
                return Err(SessionError::SwitchNotSupported {
                    from: self.mode(),
                    target,
                });
            }
        };
        self.send_void(command)
    }

    fn close(&self) {
        if self.transport.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!(mode = %self.mode(), "Flash session closed");
        }
    }
}
