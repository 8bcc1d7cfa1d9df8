//! Hardware-agnostic CAN bus core.
//!
//! [`Bus`] is the single object application code talks to. It composes a
//! [`Transport`] (the hardware/driver-facing capability), a bus state
//! machine, and a periodic transmit scheduler. Concrete transports are
//! provided for Linux SocketCAN and for vendor driver libraries that expose
//! an integer-status-code session API (see [`driver`]).

pub mod bus;
pub mod driver;
pub mod error;
pub mod frame;
pub mod periodic;
pub mod state;
pub mod wait;

#[cfg(target_os = "linux")]
pub mod lin_can;

pub use bus::Bus;
pub use error::{CanError, CanResult};
pub use frame::CanFrame;
pub use periodic::PeriodicTask;
pub use state::BusState;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::wait::Waitable;

/// Outcome of one non-blocking receive attempt.
///
/// `NoData` is a normal result, not an error; timeout handling is layered on
/// top by [`Bus::recv`]. `Fault` carries the already-translated driver error.
#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(CanFrame),
    NoData,
    Fault(CanError),
}

/// Point-in-time hardware/driver status, as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub hardware_rev: u16,
    pub firmware_rev: u16,
    pub driver_rev: u16,
    /// Times the controller has gone bus-off since the channel opened.
    pub bus_off_count: u16,
    pub error_frame_count: u16,
    pub error_flags: u16,
    /// Configured signalling rate in bit/s.
    pub bitrate: u32,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw rev {:#06x}, fw rev {:#06x}, drv rev {:#06x}, \
             bus-off {}, error frames {}, error flags {:#06x}, {} bit/s",
            self.hardware_rev,
            self.firmware_rev,
            self.driver_rev,
            self.bus_off_count,
            self.error_frame_count,
            self.error_flags,
            self.bitrate,
        )
    }
}

/// Capability contract every hardware family implements.
///
/// Sessions are established by each implementation's own `open` constructor;
/// everything after that goes through this object-safe surface. A transport
/// handle is shared by the foreground send/receive flow and every periodic
/// task, so implementations serialize access to the underlying driver, which
/// is not assumed thread-safe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue `frame` for transmission. `None` waits as long as the driver
    /// allows, `Some(Duration::ZERO)` gives up immediately. Fails with
    /// [`CanError::Timeout`] when the channel cannot accept the frame in
    /// time and [`CanError::Operation`] for every other driver fault.
    async fn send(&self, frame: &CanFrame, timeout: Option<Duration>) -> CanResult<()>;

    /// Poll for a pending frame without blocking. Returned frames carry
    /// timestamps already converted to seconds since this transport opened,
    /// in hardware arrival order.
    fn receive_nonblocking(&self) -> ReceiveOutcome;

    /// Read-only status query.
    async fn status(&self) -> CanResult<StatusSnapshot>;

    /// Reconfigure the controller for the given mode (listen-only for
    /// `Passive`). Transports without a hardware mode keep this no-op.
    fn set_mode(&self, _mode: BusState) -> CanResult<()> {
        Ok(())
    }

    /// Release the driver session. Idempotent and best-effort: failures are
    /// logged, never raised, so shutdown can always complete.
    fn close(&self);

    /// The wait strategy backing [`Bus::recv`]'s bounded wait.
    fn waitable(&self) -> Arc<dyn Waitable>;
}
