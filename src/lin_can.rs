///
/// lin_can.rs
///
/// SocketCAN transport for Linux.
///
/// The tokio socket only offers awaited reads, so the interface is opened
/// twice: a receive socket owned by a pump task that drains frames into a
/// bounded queue, and a transmit socket serialized behind a lock. The pump
/// signals the event waiter on every enqueue, which is what makes
/// `receive_nonblocking` immediate and the bounded receive wait cheap.
///
pub use socketcan::tokio::CanSocket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CanError, CanResult};
use crate::frame::CanFrame;
use crate::wait::{EventWaiter, Waitable};
use crate::{ReceiveOutcome, StatusSnapshot, Transport};

/// Frames buffered before the oldest is dropped on overrun.
const RX_QUEUE_LIMIT: usize = 1024;

pub struct SocketCanTransport {
    tx: tokio::sync::Mutex<CanSocket>,
    shared: Arc<RxShared>,
    waiter: Arc<dyn Waitable>,
    pump_cancel: CancellationToken,
    closed: AtomicBool,
    interface: String,
}

struct RxShared {
    queue: Mutex<VecDeque<CanFrame>>,
    fault: Mutex<Option<CanError>>,
    notify: Arc<Notify>,
}

impl SocketCanTransport {
    /// Open `interface` (e.g. "can0" or "vcan0"). Must be called within a
    /// tokio runtime; the pump task is spawned onto it.
    pub fn open(interface: &str) -> CanResult<Self> {
        let rx = CanSocket::open(interface).map_err(|e| {
            CanError::Initialization(format!("cannot open CAN interface {interface}: {e}"))
        })?;
        let tx = CanSocket::open(interface).map_err(|e| {
            CanError::Initialization(format!("cannot open CAN interface {interface}: {e}"))
        })?;

        let shared = Arc::new(RxShared {
            queue: Mutex::new(VecDeque::new()),
            fault: Mutex::new(None),
            notify: Arc::new(Notify::new()),
        });
        let pump_cancel = CancellationToken::new();
        let opened_at = Instant::now();

        tokio::spawn(pump(rx, Arc::clone(&shared), pump_cancel.clone(), opened_at));
        debug!(interface, "socketcan transport opened");

        Ok(Self {
            tx: tokio::sync::Mutex::new(tx),
            waiter: Arc::new(EventWaiter::new(Arc::clone(&shared.notify))),
            shared,
            pump_cancel,
            closed: AtomicBool::new(false),
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

async fn pump(
    mut sock: CanSocket,
    shared: Arc<RxShared>,
    cancel: CancellationToken,
    opened_at: Instant,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = sock.read_frame() => match read {
                Ok(sc) => {
                    let mut frame = match from_socketcan(sc) {
                        Ok(frame) => frame,
                        Err(err) => {
                            *relock(&shared.fault) = Some(err);
                            shared.notify.notify_one();
                            break;
                        }
                    };
                    frame.set_timestamp(Some(opened_at.elapsed().as_secs_f64()));
                    let mut queue = relock(&shared.queue);
                    if queue.len() >= RX_QUEUE_LIMIT {
                        queue.pop_front();
                        warn!("receive queue overrun, oldest frame dropped");
                    }
                    queue.push_back(frame);
                    drop(queue);
                    shared.notify.notify_one();
                }
                Err(err) => {
                    *relock(&shared.fault) =
                        Some(CanError::operation(format!("socket read failed: {err}")));
                    shared.notify.notify_one();
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SocketCanTransport {
    async fn send(&self, frame: &CanFrame, timeout: Option<Duration>) -> CanResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CanError::operation("socketcan transport is closed"));
        }
        let sc = to_socketcan(frame)?;
        let write = async {
            self.tx
                .lock()
                .await
                .write_frame(sc)
                .await
                .map_err(|e| CanError::operation(format!("socket write failed: {e}")))
        };
        match timeout {
            None => write.await,
            Some(t) => match time::timeout(t, write).await {
                Ok(result) => result,
                Err(_) => Err(CanError::Timeout),
            },
        }
    }

    fn receive_nonblocking(&self) -> ReceiveOutcome {
        // Drain buffered frames before surfacing a pump fault, so frames
        // that arrived ahead of the fault are not lost.
        if let Some(frame) = relock(&self.shared.queue).pop_front() {
            return ReceiveOutcome::Frame(frame);
        }
        if let Some(err) = relock(&self.shared.fault).take() {
            return ReceiveOutcome::Fault(err);
        }
        if self.closed.load(Ordering::Acquire) {
            return ReceiveOutcome::Fault(CanError::operation("socketcan transport is closed"));
        }
        ReceiveOutcome::NoData
    }

    async fn status(&self) -> CanResult<StatusSnapshot> {
        Err(CanError::operation(
            "status query is not supported by the SocketCAN transport",
        ))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump_cancel.cancel();
        // The transmit socket itself is released when the transport drops.
        debug!(interface = %self.interface, "socketcan transport closed");
    }

    fn waitable(&self) -> Arc<dyn Waitable> {
        Arc::clone(&self.waiter)
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn from_socketcan(sc: socketcan::CanFrame) -> CanResult<CanFrame> {
    use socketcan::{self, EmbeddedFrame, Frame};

    let id_raw = match sc.id() {
        socketcan::Id::Standard(standard_id) => u32::from(standard_id.as_raw()),
        socketcan::Id::Extended(extended_id) => extended_id.as_raw(),
    };

    if sc.is_remote_frame() {
        return CanFrame::new_remote(id_raw, sc.data().len(), sc.is_extended());
    }
    if sc.is_error_frame() {
        return CanFrame::new_error(id_raw);
    }
    if sc.is_extended() {
        CanFrame::new_eff(id_raw, sc.data())
    } else {
        CanFrame::new(id_raw, sc.data())
    }
}

fn to_socketcan(frame: &CanFrame) -> CanResult<socketcan::CanFrame> {
    use socketcan::{self, EmbeddedFrame};

    let sc_id = if frame.is_extended() {
        socketcan::ExtendedId::new(frame.id()).map(socketcan::Id::Extended)
    } else {
        socketcan::StandardId::new(frame.id() as u16).map(socketcan::Id::Standard)
    }
    .ok_or_else(|| {
        CanError::Configuration(format!(
            "invalid CAN ID for {} frame: {:#x}",
            if frame.is_extended() {
                "extended"
            } else {
                "standard"
            },
            frame.id()
        ))
    })?;

    if frame.is_error() {
        let error = socketcan::CanErrorFrame::new_error(frame.id(), frame.data())
            .map_err(|_| CanError::Configuration("malformed error frame".to_string()))?;
        return Ok(socketcan::CanFrame::Error(error));
    }
    if frame.is_rtr() {
        let remote = socketcan::CanRemoteFrame::new(sc_id, frame.data())
            .ok_or_else(|| CanError::Configuration("malformed remote frame".to_string()))?;
        return Ok(socketcan::CanFrame::Remote(remote));
    }

    let data = socketcan::CanDataFrame::new(sc_id, frame.data())
        .ok_or_else(|| CanError::Configuration("malformed data frame".to_string()))?;
    Ok(socketcan::CanFrame::Data(data))
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
