///
/// driver.rs
///
/// Session boundary for vendor CAN driver libraries.
///
/// Hardware vendors ship a driver library exposing open/close/send/
/// read-no-wait/status calls that take fixed-layout records and return
/// integer status codes. [`DriverBackend`] captures that surface as an owned
/// session object (one instance per channel, no process-wide singleton), and
/// [`DriverTransport`] turns any backend into a [`Transport`], translating
/// status codes into [`CanError`] in exactly one place.
///
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{CanError, CanResult};
use crate::frame::{CanFrame, EXTENDED_ID_MAX, MAX_DLC, STANDARD_ID_MAX};
use crate::state::BusState;
use crate::wait::{EventWaiter, PollWaiter, Waitable};
use crate::{ReceiveOutcome, StatusSnapshot, Transport};

/// Well-known driver status codes. Every other value is a fault.
pub mod codes {
    /// Call completed.
    pub const SUCCESS: i32 = 0;
    /// Receive queue empty, retry later. Not a fault.
    pub const RX_EMPTY: i32 = -11;
    /// Transmit window elapsed before the frame was accepted.
    pub const TX_TIMEOUT: i32 = -110;
}

/// `flags` bit for an extended 29-bit identifier. Clear means standard.
pub const FLAG_EXTENDED: u8 = 0x02;
/// `flags` bit for a remote request frame.
pub const FLAG_REMOTE: u8 = 0x04;
/// `flags` bit for a controller-reported error frame.
pub const FLAG_ERROR: u8 = 0x40;

/// Fixed-layout message record exchanged with the backend.
///
/// All frame kind information lives in the single `flags` byte (see the
/// `FLAG_*` constants); the high nibble of `dlc` is reserved and masked off
/// on receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u32,
    pub dlc: u8,
    pub flags: u8,
    pub data: [u8; 8],
    /// Hardware arrival time in 100 microsecond ticks of the driver clock.
    pub timestamp: u32,
}

impl RawMessage {
    pub fn from_frame(frame: &CanFrame) -> Self {
        let mut flags = 0u8;
        if frame.is_extended() {
            flags |= FLAG_EXTENDED;
        }
        if frame.is_rtr() {
            flags |= FLAG_REMOTE;
        }
        if frame.is_error() {
            flags |= FLAG_ERROR;
        }
        let mut data = [0u8; 8];
        data[..frame.data().len()].copy_from_slice(frame.data());
        Self {
            id: frame.id(),
            dlc: frame.dlc() as u8,
            flags,
            data,
            timestamp: 0,
        }
    }
}

/// Mirror of the vendor status block behind [`Transport::status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStatus {
    pub hw_rev: u16,
    pub fw_rev: u16,
    pub drv_rev: u16,
    pub bus_off_ctr: u16,
    pub error_flag: u16,
    pub error_frame_ctr: u16,
    pub baud: u32,
}

/// Channel configuration handed to [`DriverBackend::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Deliver controller error frames to the receive queue.
    pub receive_errors: bool,
    /// Echo own transmissions back on receive.
    pub echo: bool,
    /// Driver-side transmit timeout in ms, -1 for the driver default.
    pub tx_timeout_ms: i32,
    /// Driver-side receive timeout in ms, -1 for the driver default.
    pub rx_timeout_ms: i32,
    /// Client name registered with the driver session.
    pub client_name: String,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            receive_errors: true,
            echo: false,
            tx_timeout_ms: -1,
            rx_timeout_ms: -1,
            client_name: "canport".to_string(),
        }
    }
}

/// One installed channel, as reported by device enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub channel: u32,
    pub name: String,
}

/// An owned driver session.
///
/// Calls return raw status codes; [`DriverTransport`] owns the translation.
/// The trait is synchronous because vendor libraries are: every call is a
/// short foreign function invocation, serialized by the transport since the
/// driver is not assumed thread-safe.
pub trait DriverBackend: Send + 'static {
    /// Establish the session on `channel` at `bitrate` bit/s.
    fn open(&mut self, channel: u32, bitrate: u32, options: &OpenOptions) -> i32;

    /// Tear the session down.
    fn close(&mut self) -> i32;

    /// Queue one message. `timeout_ms` bounds how long the driver may block
    /// waiting for queue space, -1 for the driver default.
    fn send(&mut self, msg: &RawMessage, timeout_ms: i32) -> i32;

    /// Fill `msg` with the next pending message, or return
    /// [`codes::RX_EMPTY`] immediately when there is none.
    fn try_receive(&mut self, msg: &mut RawMessage) -> i32;

    /// Fill `out` with the current hardware status.
    fn status(&mut self, out: &mut RawStatus) -> i32;

    /// Driver clock at the time of the call, in 100 microsecond ticks.
    /// Backends whose message timestamps already count from channel open
    /// keep the default zero.
    fn system_time(&mut self, ticks: &mut u32) -> i32 {
        *ticks = 0;
        codes::SUCCESS
    }

    /// Put the controller in or out of listen-only mode. Optional.
    fn set_listen_only(&mut self, _on: bool) -> i32 {
        codes::SUCCESS
    }

    /// Event pulsed by the driver whenever the receive queue becomes
    /// non-empty. Backends without one fall back to polling.
    fn rx_event(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Installed channels reachable through this backend.
    fn device_list(&mut self, _out: &mut Vec<ChannelDescriptor>) -> i32 {
        codes::SUCCESS
    }
}

/// Enumerate the channels a backend can open, as `{channel, name}` pairs.
pub fn detect_channels<B: DriverBackend>(backend: &mut B) -> CanResult<Vec<ChannelDescriptor>> {
    let mut out = Vec::new();
    match backend.device_list(&mut out) {
        codes::SUCCESS => Ok(out),
        code => Err(CanError::driver("device enumeration failed", code)),
    }
}

/// [`Transport`] over any [`DriverBackend`] session.
pub struct DriverTransport<B: DriverBackend> {
    backend: Mutex<B>,
    channel: u32,
    /// Driver clock at open; received tick stamps are rebased against it.
    hw_open_ticks: u32,
    waiter: Arc<dyn Waitable>,
    closed: AtomicBool,
}

impl<B: DriverBackend> std::fmt::Debug for DriverTransport<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverTransport")
            .field("channel", &self.channel)
            .field("hw_open_ticks", &self.hw_open_ticks)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<B: DriverBackend> DriverTransport<B> {
    /// Open `channel` at `bitrate` bit/s on the given backend session.
    pub fn open(
        mut backend: B,
        channel: u32,
        bitrate: u32,
        options: OpenOptions,
    ) -> CanResult<Self> {
        let code = backend.open(channel, bitrate, &options);
        if code != codes::SUCCESS {
            return Err(CanError::Initialization(format!(
                "driver refused to open channel {channel} at {bitrate} bit/s [code {code}]"
            )));
        }

        let mut ticks = 0u32;
        let code = backend.system_time(&mut ticks);
        if code != codes::SUCCESS {
            backend.close();
            return Err(CanError::Initialization(format!(
                "driver clock query failed after open [code {code}]"
            )));
        }

        let waiter: Arc<dyn Waitable> = match backend.rx_event() {
            Some(event) => Arc::new(EventWaiter::new(event)),
            None => Arc::new(PollWaiter::new()),
        };
        debug!(channel, bitrate, "driver session opened");

        Ok(Self {
            backend: Mutex::new(backend),
            channel,
            hw_open_ticks: ticks,
            waiter,
            closed: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decode(&self, msg: &RawMessage) -> CanResult<CanFrame> {
        // Reserved bits are masked rather than rejected; the driver owns them.
        let dlc = ((msg.dlc & 0x0F) as usize).min(MAX_DLC);
        let extended = msg.flags & FLAG_EXTENDED != 0;
        let id = if extended {
            msg.id & EXTENDED_ID_MAX
        } else {
            msg.id & STANDARD_ID_MAX
        };

        let mut frame = if msg.flags & FLAG_ERROR != 0 {
            CanFrame::new_error(msg.id & EXTENDED_ID_MAX)?
        } else if msg.flags & FLAG_REMOTE != 0 {
            CanFrame::new_remote(id, dlc, extended)?
        } else if extended {
            CanFrame::new_eff(id, &msg.data[..dlc])?
        } else {
            CanFrame::new(id, &msg.data[..dlc])?
        };

        let delta = msg.timestamp.saturating_sub(self.hw_open_ticks);
        frame.set_timestamp(Some(f64::from(delta) / 10_000.0));
        Ok(frame)
    }
}

#[async_trait]
impl<B: DriverBackend> Transport for DriverTransport<B> {
    async fn send(&self, frame: &CanFrame, timeout: Option<Duration>) -> CanResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CanError::operation("driver session is closed"));
        }
        let msg = RawMessage::from_frame(frame);
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };
        let code = self.backend().send(&msg, timeout_ms);
        match code {
            codes::SUCCESS => Ok(()),
            codes::TX_TIMEOUT => Err(CanError::Timeout),
            code => Err(CanError::driver(
                format!("transmit failed on channel {}", self.channel),
                code,
            )),
        }
    }

    fn receive_nonblocking(&self) -> ReceiveOutcome {
        if self.closed.load(Ordering::Acquire) {
            return ReceiveOutcome::Fault(CanError::operation("driver session is closed"));
        }
        let mut msg = RawMessage::default();
        let code = self.backend().try_receive(&mut msg);
        match code {
            codes::SUCCESS => match self.decode(&msg) {
                Ok(frame) => ReceiveOutcome::Frame(frame),
                Err(err) => ReceiveOutcome::Fault(err),
            },
            codes::RX_EMPTY => ReceiveOutcome::NoData,
            code => ReceiveOutcome::Fault(CanError::driver(
                format!("receive failed on channel {}", self.channel),
                code,
            )),
        }
    }

    async fn status(&self) -> CanResult<StatusSnapshot> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CanError::operation("driver session is closed"));
        }
        let mut raw = RawStatus::default();
        let code = self.backend().status(&mut raw);
        if code != codes::SUCCESS {
            return Err(CanError::driver(
                format!("status query failed on channel {}", self.channel),
                code,
            ));
        }
        Ok(StatusSnapshot {
            hardware_rev: raw.hw_rev,
            firmware_rev: raw.fw_rev,
            driver_rev: raw.drv_rev,
            bus_off_count: raw.bus_off_ctr,
            error_frame_count: raw.error_frame_ctr,
            error_flags: raw.error_flag,
            bitrate: raw.baud,
        })
    }

    fn set_mode(&self, mode: BusState) -> CanResult<()> {
        let listen_only = match mode {
            BusState::Active => false,
            BusState::Passive => true,
            // The state machine never requests Error.
            BusState::Error => return Ok(()),
        };
        let code = self.backend().set_listen_only(listen_only);
        if code != codes::SUCCESS {
            return Err(CanError::driver(
                format!("mode change failed on channel {}", self.channel),
                code,
            ));
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let code = self.backend().close();
        if code != codes::SUCCESS {
            warn!(channel = self.channel, code, "driver close reported an error");
        } else {
            debug!(channel = self.channel, "driver session closed");
        }
    }

    fn waitable(&self) -> Arc<dyn Waitable> {
        Arc::clone(&self.waiter)
    }
}

impl<B: DriverBackend> Drop for DriverTransport<B> {
    fn drop(&mut self) {
        self.close();
    }
}
