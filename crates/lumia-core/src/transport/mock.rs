//! Mock USB transport and device host for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::traits::{DeviceHost, TransportError, UsbTransport};

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Mock transport for unit testing protocol logic.
pub struct MockTransport {
    /// Queued responses to return on read.
    response_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Computes a response for every write, appended to the queue.
    responder: Mutex<Option<Responder>>,
    /// Writes allowed before the mock reports a failure.
    write_budget: Mutex<Option<usize>>,
    vid: u16,
    pid: u16,
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(0x0421, 0x066E)
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            response_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Mutex::new(None),
            write_budget: Mutex::new(None),
            vid,
            pid,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a response to be returned on next read.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.response_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Answer every write with the response computed by `f`.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Fail every write after the first `n`.
    pub fn fail_writes_after(&self, n: usize) {
        *self.write_budget.lock().unwrap() = Some(n);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        {
            let mut budget = self.write_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(TransportError::WriteFailed("mock write budget exhausted".into()));
                }
                *left -= 1;
            }
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(responder) = self.responder.lock().unwrap().as_ref()
            && let Some(response) = responder(data)
        {
            self.response_queue.lock().unwrap().push_back(response);
        }
        Ok(data.len())
    }

    fn read(&self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.response_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 5000 })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Mock device host keyed by device path.
#[derive(Default)]
pub struct MockHost {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    volumes: Mutex<HashMap<String, String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `transport` for arrivals on `device_path`.
    pub fn add_transport(&self, device_path: &str, transport: Arc<MockTransport>) {
        self.transports
            .lock()
            .unwrap()
            .insert(device_path.to_ascii_lowercase(), transport);
    }

    /// Make `volume` resolvable for `device_path`.
    pub fn set_volume(&self, device_path: &str, volume: &str) {
        self.volumes
            .lock()
            .unwrap()
            .insert(device_path.to_ascii_lowercase(), volume.to_string());
    }
}

impl DeviceHost for MockHost {
    fn open_transport(&self, device_path: &str) -> Result<Arc<dyn UsbTransport>, TransportError> {
        self.transports
            .lock()
            .unwrap()
            .get(&device_path.to_ascii_lowercase())
            .cloned()
            .map(|t| t as Arc<dyn UsbTransport>)
            .ok_or_else(|| TransportError::OpenFailed(device_path.to_string()))
    }

    fn resolve_volume(&self, device_path: &str) -> Option<String> {
        self.volumes
            .lock()
            .unwrap()
            .get(&device_path.to_ascii_lowercase())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_response_queue() {
        let mock = MockTransport::new();
        mock.queue_response(b"NOKV\0\0");
        mock.queue_response(b"NOKR\0\0");

        assert_eq!(mock.read(64).unwrap(), b"NOKV\0\0");
        assert_eq!(mock.read(64).unwrap(), b"NOKR\0\0");

        // Queue is empty now
        assert!(mock.read(64).is_err());
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_responder_and_execute() {
        let mock = MockTransport::new();
        mock.set_responder(|req| Some(req.iter().rev().cloned().collect()));
        assert_eq!(mock.execute(b"abc", 16).unwrap(), b"cba");
    }

    #[test]
    fn test_mock_write_budget() {
        let mock = MockTransport::new();
        mock.fail_writes_after(1);
        assert!(mock.write(b"one").is_ok());
        assert!(mock.write(b"two").is_err());
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(b"test").is_err());
    }

    #[test]
    fn test_mock_host_lookup_is_case_insensitive() {
        let host = MockHost::new();
        host.add_transport("USB#VID_0421&PID_066E", Arc::new(MockTransport::new()));
        host.set_volume("USBSTOR#DISK", "E:");
        assert!(host.open_transport("usb#vid_0421&pid_066e").is_ok());
        assert!(host.open_transport("usb#other").is_err());
        assert_eq!(host.resolve_volume("usbstor#disk").as_deref(), Some("E:"));
    }
}
