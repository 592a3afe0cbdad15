use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a run with respect to cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// Dispatching normally.
    Running,
    /// A failure (with fail-fast) or an interrupt stopped new dispatch.
    FastFailure,
    /// Everything in flight settled; the `after` phase runs.
    Draining,
    /// Pools are down.
    Terminated,
}

impl fmt::Display for CancelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::FastFailure => write!(f, "fast failure"),
            Self::Draining => write!(f, "draining"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Identifies one dispatched test.
pub type TaskId = u64;

/// Tracks in-flight tests and cancels them when the run trips.
#[derive(Debug)]
pub struct CancelController {
    state: CancelState,
    in_progress: HashMap<TaskId, CancellationToken>,
    next_id: TaskId,
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            state: CancelState::Running,
            in_progress: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn state(&self) -> CancelState {
        self.state
    }

    /// Whether new tests may be dispatched.
    pub fn accepts_dispatch(&self) -> bool {
        self.state == CancelState::Running
    }

    /// Register a dispatch and hand out its cancellation token.
    pub fn track(&mut self) -> (TaskId, CancellationToken) {
        self.next_id += 1;
        let token = CancellationToken::new();
        self.in_progress.insert(self.next_id, token.clone());
        (self.next_id, token)
    }

    /// Forget a settled dispatch. Returns false if it was not tracked.
    pub fn settle(&mut self, id: TaskId) -> bool {
        self.in_progress.remove(&id).is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.in_progress.len()
    }

    /// Move to [`CancelState::FastFailure`] and cancel everything in flight.
    /// Returns true only for the transition itself.
    pub fn trip(&mut self) -> bool {
        if self.state != CancelState::Running {
            return false;
        }
        self.state = CancelState::FastFailure;
        debug!(in_flight = self.in_progress.len(), "cancelling in-flight tests");
        for token in self.in_progress.values() {
            token.cancel();
        }
        true
    }

    pub fn drain(&mut self) {
        if matches!(self.state, CancelState::Running | CancelState::FastFailure) {
            self.state = CancelState::Draining;
        }
    }

    pub fn terminate(&mut self) {
        for token in self.in_progress.values() {
            token.cancel();
        }
        self.state = CancelState::Terminated;
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivers interrupts to the coordinator. Cheap to clone; every clone
/// shares one counter, so the coordinator can tell a first interrupt from
/// a second.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    count: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<usize>,
}

impl InterruptHandle {
    /// A handle plus the receiving end the coordinator listens on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                count: Arc::new(AtomicUsize::new(0)),
                tx,
            },
            rx,
        )
    }

    /// Deliver an interrupt. Returns how many have been delivered so far.
    pub fn interrupt(&self) -> usize {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(n).is_err() {
            debug!("interrupt delivered after the run settled");
        }
        n
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Forward Ctrl-C to `handle` until the returned task is aborted.
pub fn listen_for_ctrl_c(handle: InterruptHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let n = handle.interrupt();
            if n == 1 {
                warn!("interrupt received; finishing up (press Ctrl-C again to force exit)");
            }
        }
    })
}
