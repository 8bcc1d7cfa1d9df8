///
/// bus.rs
///
/// The facade application code talks to: one transport, one state machine,
/// and the set of live periodic tasks.
///
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{CanError, CanResult};
use crate::frame::CanFrame;
use crate::periodic::{self, PeriodicTask, Stopper};
use crate::state::{BusState, StateMachine};
use crate::{ReceiveOutcome, StatusSnapshot, Transport};

/// One wait slice when the caller asked to wait forever. The loop re-polls
/// after each slice, so the value only bounds wakeup granularity.
const FOREVER_SLICE: Duration = Duration::from_secs(3600);

/// A CAN bus handle.
///
/// Construct a concrete transport with its own `open`, then wrap it here.
/// The bus starts `Active`. Must live inside a tokio runtime: periodic
/// tasks are spawned onto it.
pub struct Bus {
    transport: Arc<dyn Transport>,
    state: StateMachine,
    tasks: Mutex<Vec<Stopper>>,
    shutdown: CancellationToken,
}

impl Bus {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            state: StateMachine::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> BusState {
        self.state.current()
    }

    /// Request `Active` or `Passive`. The hardware mode hook runs first and
    /// the state only commits once the controller accepted it. Requesting
    /// `Error` always fails; faults are the only way in.
    pub fn set_state(&self, requested: BusState) -> CanResult<()> {
        self.ensure_open()?;
        self.state.check(requested)?;
        self.transport.set_mode(requested)?;
        self.state.request(requested)
    }

    /// Transmit one frame. `None` waits indefinitely, `Some(Duration::ZERO)`
    /// returns immediately. Refused while the bus is `Passive`, `Error`, or
    /// shut down. A driver fault (not a timeout) trips the bus to `Error`.
    pub async fn send(&self, frame: &CanFrame, timeout: Option<Duration>) -> CanResult<()> {
        self.ensure_open()?;
        match self.state.current() {
            BusState::Active => {}
            BusState::Passive => {
                return Err(CanError::operation(
                    "bus is listen-only (Passive), transmit refused",
                ));
            }
            BusState::Error => {
                return Err(CanError::operation("bus is in the Error state"));
            }
        }
        match self.transport.send(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, CanError::Operation { .. }) {
                    self.state.fault();
                }
                Err(err)
            }
        }
    }

    /// Wait up to `timeout` for the next frame. `None` waits forever,
    /// `Some(Duration::ZERO)` polls once. `Ok(None)` means the deadline
    /// passed with nothing pending, which is a normal outcome. Driver
    /// faults are raised immediately and trip the bus to `Error`; the loop
    /// never retries on them, only on "nothing yet".
    pub async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<CanFrame>> {
        self.ensure_open()?;
        if self.state.current() == BusState::Error {
            return Err(CanError::operation("bus is in the Error state"));
        }
        let waiter = self.transport.waitable();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            match self.transport.receive_nonblocking() {
                ReceiveOutcome::Frame(frame) => return Ok(Some(frame)),
                ReceiveOutcome::Fault(err) => {
                    self.state.fault();
                    return Err(err);
                }
                ReceiveOutcome::NoData => {}
            }
            let limit = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    deadline - now
                }
                None => FOREVER_SLICE,
            };
            // Spurious wakeups are fine, the loop re-polls and re-checks
            // the deadline.
            waiter.wait(limit).await;
        }
    }

    /// Start transmitting `frame` every `period` until the returned task is
    /// stopped or the bus shuts down. Tasks are independent: a send fault
    /// stops only the task it happened on and is reported through that
    /// task's [`PeriodicTask::take_error`].
    pub fn send_periodic(&self, frame: CanFrame, period: Duration) -> CanResult<PeriodicTask> {
        self.ensure_open()?;
        if self.state.current() != BusState::Active {
            return Err(CanError::operation(
                "periodic transmission requires an Active bus",
            ));
        }
        let task = periodic::spawn(
            Arc::clone(&self.transport),
            frame,
            period,
            self.shutdown.child_token(),
        )?;
        let mut tasks = self.lock_tasks();
        tasks.retain(|stopper| !stopper.is_finished());
        tasks.push(task.stopper());
        Ok(task)
    }

    pub async fn status(&self) -> CanResult<StatusSnapshot> {
        self.ensure_open()?;
        self.transport.status().await
    }

    /// Shut the bus down: raise the barrier so no new send or receive can
    /// begin, stop every live periodic task (waiting each one out), then
    /// close the transport. Ordering matters: tasks stop before the handle
    /// they send through goes away. Idempotent, never raises.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let stoppers: Vec<Stopper> = self.lock_tasks().drain(..).collect();
        for stopper in &stoppers {
            stopper.stop().await;
        }
        self.transport.close();
        info!(tasks = stoppers.len(), "bus shut down");
    }

    fn ensure_open(&self) -> CanResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(CanError::operation("bus has been shut down"));
        }
        Ok(())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<Stopper>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
