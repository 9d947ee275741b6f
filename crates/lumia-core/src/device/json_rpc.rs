//! JSON-RPC dialect of a phone booted into the OS (normal and label mode).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::{debug, info};

use super::Mode;
use super::session::{DeviceInfo, DeviceSession, SessionError};
use crate::protocol::ProtocolError;
use crate::transport::UsbTransport;

const MAX_REPLY: usize = 0x4000;

pub struct JsonRpcSession {
    transport: Mutex<Option<Arc<dyn UsbTransport>>>,
    mode: Mode,
    next_id: AtomicU64,
}

impl JsonRpcSession {
    pub fn new(transport: Arc<dyn UsbTransport>, mode: Mode) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            mode,
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method` and return its `result` member.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "JSON-RPC call");

        let raw = transport.execute(request.to_string().as_bytes(), MAX_REPLY)?;
        let reply: Value = serde_json::from_slice(&raw).map_err(ProtocolError::from)?;

        if let Some(err) = reply.get("error") {
            return Err(ProtocolError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
            .into());
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    fn read_string(&self, method: &str, field: &str) -> Result<String, SessionError> {
        let result = self.call(method, json!({ "MessageVersion": 0 }))?;
        Ok(result
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

impl DeviceSession for JsonRpcSession {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read_info(&self) -> Result<DeviceInfo, SessionError> {
        Ok(DeviceInfo::Phone {
            product_code: self.read_string("ReadProductCode", "ProductCode")?,
            software_version: self.read_string("ReadSwVersion", "SwVersion")?,
        })
    }

    fn request_switch(&self, target: Option<Mode>) -> Result<(), SessionError> {
        let device_mode = match target {
            Some(Mode::FlashApp) | Some(Mode::Bootloader) => "Flash",
            Some(Mode::Label) => "Label",
            Some(Mode::Normal) | None => "Normal",
            Some(_) => {
                return Err(SessionError::SwitchNotSupported {
                    from: self.mode,
                    target,
                });
            }
        };
        info!(from = %self.mode, to = device_mode, "Rebooting phone");
        self.call(
            "SetDeviceMode",
            json!({ "DeviceMode": device_mode, "ResetMethod": "HwReset", "MessageVersion": 0 }),
        )?;
        Ok(())
    }

    fn close(&self) {
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn responder(mock: &MockTransport) {
        mock.set_responder(|req| {
            let req: Value = serde_json::from_slice(req).ok()?;
            let result = match req["method"].as_str()? {
                "ReadProductCode" => json!({ "ProductCode": "059X4T1" }),
                "ReadSwVersion" => json!({ "SwVersion": "10.0.15254.603" }),
                "SetDeviceMode" => json!({}),
                _ => return Some(json!({ "id": req["id"], "error": { "code": -32601, "message": "Method not found" } }).to_string().into_bytes()),
            };
            Some(json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }).to_string().into_bytes())
        });
    }

    #[test]
    fn test_read_info() {
        let mock = Arc::new(MockTransport::with_ids(0x0421, 0x0661));
        responder(&mock);
        let s = JsonRpcSession::new(mock, Mode::Normal);
        assert_eq!(
            s.read_info().unwrap(),
            DeviceInfo::Phone {
                product_code: "059X4T1".into(),
                software_version: "10.0.15254.603".into()
            }
        );
    }

    #[test]
    fn test_switch_to_flash_sends_set_device_mode() {
        let mock = Arc::new(MockTransport::with_ids(0x0421, 0x0661));
        responder(&mock);
        let s = JsonRpcSession::new(mock.clone(), Mode::Normal);
        s.request_switch(Some(Mode::FlashApp)).unwrap();

        let sent: Value = serde_json::from_slice(&mock.get_writes()[0]).unwrap();
        assert_eq!(sent["method"], "SetDeviceMode");
        assert_eq!(sent["params"]["DeviceMode"], "Flash");
    }

    #[test]
    fn test_rpc_error_surfaces() {
        let mock = Arc::new(MockTransport::new());
        responder(&mock);
        let s = JsonRpcSession::new(mock, Mode::Label);
        let err = s.call("Bogus", Value::Null).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::Rpc { code: -32601, .. })));
    }

    #[test]
    fn test_closed_session() {
        let s = JsonRpcSession::new(Arc::new(MockTransport::new()), Mode::Normal);
        s.close();
        assert!(matches!(s.read_info(), Err(SessionError::Closed)));
    }
}
