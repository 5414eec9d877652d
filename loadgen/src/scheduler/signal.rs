//! Stop signalling for virtual-user slots and the run as a whole
//!
//! A signal only ever escalates: `Run -> Drain -> Abort`. `Drain` lets the current
//! iteration finish; `Abort` interrupts in-flight network calls.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    Run,
    Drain,
    Abort,
}

/// Sending side of a stop signal
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<StopMode>,
}

impl StopHandle {
    pub fn new() -> (Self, StopListener) {
        let (tx, rx) = watch::channel(StopMode::Run);
        (Self { tx }, StopListener { rx })
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn mode(&self) -> StopMode {
        *self.tx.borrow()
    }

    /// Ask for a graceful stop after the current iteration
    pub fn drain(&self) {
        self.escalate(StopMode::Drain);
    }

    /// Interrupt immediately, including calls in flight
    pub fn abort(&self) {
        self.escalate(StopMode::Abort);
    }

    fn escalate(&self, mode: StopMode) {
        self.tx.send_if_modified(|current| {
            if mode > *current {
                *current = mode;
                true
            } else {
                false
            }
        });
    }
}

/// Receiving side, cloned into every worker and network call
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<StopMode>,
}

impl StopListener {
    /// A listener that never fires
    pub fn detached() -> Self {
        let (_, rx) = watch::channel(StopMode::Run);
        Self { rx }
    }

    pub fn mode(&self) -> StopMode {
        *self.rx.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.mode() != StopMode::Run
    }

    pub fn is_aborted(&self) -> bool {
        self.mode() == StopMode::Abort
    }

    /// Resolves once a drain or abort has been requested
    pub async fn stopping(&mut self) {
        self.wait_for(StopMode::Drain).await;
    }

    /// Resolves once an abort has been requested
    pub async fn aborted(&mut self) {
        self.wait_for(StopMode::Abort).await;
    }

    async fn wait_for(&mut self, level: StopMode) {
        if self.rx.wait_for(|mode| *mode >= level).await.is_err() {
            // Sender gone without reaching `level`: nothing will ever signal us
            std::future::pending::<()>().await;
        }
    }
}
