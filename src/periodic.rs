///
/// periodic.rs
///
/// Recurring transmission of one frame at a fixed period.
///
/// Each task runs on its own tokio task. Wakeups come from an interval
/// anchored at the start instant, so the Nth transmit targets
/// `t0 + N * period` regardless of how long each send takes: latency does
/// not accumulate into drift. `stop` cancels future wakeups and then waits
/// for the task to finish, including any in-flight send.
///
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Transport;
use crate::error::{CanError, CanResult};
use crate::frame::{CanFrame, MAX_DLC};

/// Handle to one running periodic transmission.
///
/// Dropping the handle does not stop the task; call [`stop`](Self::stop),
/// or shut the owning bus down.
pub struct PeriodicTask {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("period", &self.shared.period)
            .field("running", &self.shared.running)
            .finish_non_exhaustive()
    }
}

struct Shared {
    /// Frame template for the next send. Swapped whole under the lock, so a
    /// send snapshots either the old payload or the new one, never a mix.
    frame: Mutex<CanFrame>,
    period: Duration,
    cancel: CancellationToken,
    /// Cancelled by the task's drop guard as its very last act.
    finished: CancellationToken,
    running: AtomicBool,
    last_error: Mutex<Option<CanError>>,
}

/// Bus-side stop handle, independent of the user-held [`PeriodicTask`].
#[derive(Clone)]
pub(crate) struct Stopper {
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Stopper {
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    frame: CanFrame,
    period: Duration,
    cancel: CancellationToken,
) -> CanResult<PeriodicTask> {
    if period.is_zero() {
        return Err(CanError::Configuration(
            "periodic task period must be greater than zero".to_string(),
        ));
    }
    if frame.dlc() > MAX_DLC {
        return Err(CanError::Configuration(format!(
            "periodic frame DLC must be <= {MAX_DLC}, got {}",
            frame.dlc()
        )));
    }

    let shared = Arc::new(Shared {
        frame: Mutex::new(frame),
        period,
        cancel,
        finished: CancellationToken::new(),
        running: AtomicBool::new(true),
        last_error: Mutex::new(None),
    });

    let task_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        // Cancels `finished` when the task exits, panic included.
        let _finished = task_shared.finished.clone().drop_guard();
        // First tick fires immediately, later ticks stay on the start grid.
        let mut ticker = time::interval(task_shared.period);
        loop {
            tokio::select! {
                _ = task_shared.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let frame = relock(&task_shared.frame).clone();
                    if let Err(err) =
                        transport.send(&frame, Some(task_shared.period)).await
                    {
                        warn!(error = %err, id = frame.id(),
                              "periodic transmit stopped by send failure");
                        *relock(&task_shared.last_error) = Some(err);
                        break;
                    }
                }
            }
        }
        task_shared.running.store(false, Ordering::Release);
    });

    Ok(PeriodicTask { shared })
}

impl PeriodicTask {
    pub fn period(&self) -> Duration {
        self.shared.period
    }

    /// False once the task was stopped or killed itself on a send fault.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Swap the payload used by the next scheduled send. A send already in
    /// flight keeps the payload it snapshotted.
    pub fn modify_data(&self, payload: &[u8]) -> CanResult<()> {
        relock(&self.shared.frame).set_data(payload)
    }

    /// The fault that stopped this task, if any. Each fault is reported once.
    pub fn take_error(&self) -> Option<CanError> {
        relock(&self.shared.last_error).take()
    }

    /// Cancel future wakeups and wait for the task to finish. When this
    /// returns, no further send will be issued; an in-flight send has been
    /// waited out, not abandoned.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.finished.cancelled().await;
    }

    pub(crate) fn stopper(&self) -> Stopper {
        Stopper {
            cancel: self.shared.cancel.clone(),
            finished: self.shared.finished.clone(),
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
