#![allow(dead_code)]
//! Scripted driver backend shared by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::Instant;

use canport::driver::{
    ChannelDescriptor, DriverBackend, OpenOptions, RawMessage, RawStatus, codes,
};

/// One recorded transmit attempt.
#[derive(Clone)]
pub struct SendRecord {
    pub msg: RawMessage,
    pub at: Instant,
}

struct ProbeState {
    sends: Mutex<Vec<SendRecord>>,
    rx: Mutex<VecDeque<RawMessage>>,
    rx_code: Mutex<Option<i32>>,
    send_code: Mutex<Option<i32>>,
    send_code_by_id: Mutex<HashMap<u32, i32>>,
    listen_only: Mutex<Vec<bool>>,
    opened: Mutex<Option<(u32, u32)>>,
    closes: AtomicU32,
    notify: Option<Arc<Notify>>,
}

/// Test-side view of the backend: script inputs, observe outputs.
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<ProbeState>,
}

pub struct MockBackend {
    state: Arc<ProbeState>,
}

/// Polling-only backend.
pub fn mock_backend() -> (MockBackend, MockProbe) {
    build(false)
}

/// Backend with a driver receive event.
pub fn mock_backend_with_event() -> (MockBackend, MockProbe) {
    build(true)
}

fn build(with_event: bool) -> (MockBackend, MockProbe) {
    let state = Arc::new(ProbeState {
        sends: Mutex::new(Vec::new()),
        rx: Mutex::new(VecDeque::new()),
        rx_code: Mutex::new(None),
        send_code: Mutex::new(None),
        send_code_by_id: Mutex::new(HashMap::new()),
        listen_only: Mutex::new(Vec::new()),
        opened: Mutex::new(None),
        closes: AtomicU32::new(0),
        notify: with_event.then(|| Arc::new(Notify::new())),
    });
    (
        MockBackend {
            state: Arc::clone(&state),
        },
        MockProbe { state },
    )
}

impl MockProbe {
    /// Queue a message for receive and pulse the driver event, if any.
    pub fn push_frame(&self, msg: RawMessage) {
        self.state.rx.lock().unwrap().push_back(msg);
        if let Some(notify) = &self.state.notify {
            notify.notify_one();
        }
    }

    /// Make every `try_receive` return `code` from now on.
    pub fn set_rx_code(&self, code: i32) {
        *self.state.rx_code.lock().unwrap() = Some(code);
    }

    /// Make every `send` return `code` from now on.
    pub fn set_send_code(&self, code: i32) {
        *self.state.send_code.lock().unwrap() = Some(code);
    }

    /// Make sends of `id` return `code`; other ids stay unaffected.
    pub fn set_send_code_for_id(&self, id: u32, code: i32) {
        self.state.send_code_by_id.lock().unwrap().insert(id, code);
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.state.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.state.sends.lock().unwrap().len()
    }

    pub fn sends_for_id(&self, id: u32) -> usize {
        self.state
            .sends
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.msg.id == id)
            .count()
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Option<(u32, u32)> {
        *self.state.opened.lock().unwrap()
    }

    pub fn listen_only_calls(&self) -> Vec<bool> {
        self.state.listen_only.lock().unwrap().clone()
    }
}

impl DriverBackend for MockBackend {
    fn open(&mut self, channel: u32, bitrate: u32, _options: &OpenOptions) -> i32 {
        *self.state.opened.lock().unwrap() = Some((channel, bitrate));
        codes::SUCCESS
    }

    fn close(&mut self) -> i32 {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        codes::SUCCESS
    }

    fn send(&mut self, msg: &RawMessage, _timeout_ms: i32) -> i32 {
        self.state.sends.lock().unwrap().push(SendRecord {
            msg: *msg,
            at: Instant::now(),
        });
        if let Some(code) = self.state.send_code_by_id.lock().unwrap().get(&msg.id) {
            return *code;
        }
        self.state
            .send_code
            .lock()
            .unwrap()
            .unwrap_or(codes::SUCCESS)
    }

    fn try_receive(&mut self, msg: &mut RawMessage) -> i32 {
        if let Some(code) = *self.state.rx_code.lock().unwrap() {
            return code;
        }
        match self.state.rx.lock().unwrap().pop_front() {
            Some(next) => {
                *msg = next;
                codes::SUCCESS
            }
            None => codes::RX_EMPTY,
        }
    }

    fn status(&mut self, out: &mut RawStatus) -> i32 {
        out.hw_rev = 0x0102;
        out.fw_rev = 0x0304;
        out.drv_rev = 0x0506;
        out.baud = self
            .state
            .opened
            .lock()
            .unwrap()
            .map(|(_, bitrate)| bitrate)
            .unwrap_or(0);
        codes::SUCCESS
    }

    fn set_listen_only(&mut self, on: bool) -> i32 {
        self.state.listen_only.lock().unwrap().push(on);
        codes::SUCCESS
    }

    fn rx_event(&self) -> Option<Arc<Notify>> {
        self.state.notify.clone()
    }

    fn device_list(&mut self, out: &mut Vec<ChannelDescriptor>) -> i32 {
        out.push(ChannelDescriptor {
            channel: 105,
            name: "CanFox CAN1".to_string(),
        });
        codes::SUCCESS
    }
}

/// Standard data frame record with a hardware tick stamp.
pub fn raw(id: u32, data: &[u8], ticks: u32) -> RawMessage {
    let mut buf = [0u8; 8];
    buf[..data.len()].copy_from_slice(data);
    RawMessage {
        id,
        dlc: data.len() as u8,
        flags: 0,
        data: buf,
        timestamp: ticks,
    }
}
