//! Open / draining / closing / closed state machine.
//!
//! ```text
//!   ┌──────┐ close() ┌──────────┐ queue empty,  ┌─────────┐ descriptor ┌────────┐
//!   │ Open │────────►│ Draining │──────────────►│ Closing │───────────►│ Closed │
//!   └──────┘         └──────────┘ nothing in    └─────────┘ released   └────────┘
//!                                 flight
//! ```
//!
//! Only `Open` accepts new work. Draining lets the queue finish naturally;
//! nothing is cancelled. Repeated `close()` calls attach to the transition
//! already under way.

use tokio::sync::watch;

use crate::storage::file::admission::InFlight;
use crate::storage::file::operations::CompletionSender;

/// Ordered: a file only ever moves forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Open,
    Draining,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn accepts_submissions(self) -> bool {
        self == LifecycleState::Open
    }
}

/// Outcome of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    /// This request moved the file from `Open` to `Draining`.
    Started,
    /// A close is already under way; the caller waits for it.
    InProgress,
    /// The file is already closed.
    AlreadyClosed,
}

/// Lifecycle owned by the scheduler, published through a watch channel.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    publisher: watch::Sender<LifecycleState>,
    close_waiters: Vec<CompletionSender>,
}

impl Lifecycle {
    pub fn new() -> (Self, watch::Receiver<LifecycleState>) {
        let (publisher, observer) = watch::channel(LifecycleState::Open);
        let lifecycle = Self {
            state: LifecycleState::Open,
            publisher,
            close_waiters: Vec::new(),
        };
        (lifecycle, observer)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Registers a close request. `waiter` is fulfilled once `Closed` is
    /// reached, or handed back when the file is already closed.
    pub fn request_close(
        &mut self,
        waiter: Option<CompletionSender>,
    ) -> (CloseRequest, Option<CompletionSender>) {
        match self.state {
            LifecycleState::Open => {
                self.close_waiters.extend(waiter);
                self.transition(LifecycleState::Draining);
                (CloseRequest::Started, None)
            }
            LifecycleState::Draining | LifecycleState::Closing => {
                self.close_waiters.extend(waiter);
                (CloseRequest::InProgress, None)
            }
            LifecycleState::Closed => (CloseRequest::AlreadyClosed, waiter),
        }
    }

    /// True when a draining file has nothing queued and nothing in flight.
    pub fn may_begin_closing(&self, queue_empty: bool, in_flight: &InFlight) -> bool {
        self.state == LifecycleState::Draining && queue_empty && in_flight.is_idle()
    }

    pub fn begin_closing(&mut self) {
        debug_assert_eq!(self.state, LifecycleState::Draining);
        self.transition(LifecycleState::Closing);
    }

    /// Enters `Closed` and hands back everyone waiting on `close()`.
    pub fn finish_closing(&mut self) -> Vec<CompletionSender> {
        debug_assert_eq!(self.state, LifecycleState::Closing);
        self.transition(LifecycleState::Closed);
        std::mem::take(&mut self.close_waiters)
    }

    fn transition(&mut self, next: LifecycleState) {
        log::debug!("file lifecycle {:?} -> {:?}", self.state, next);
        self.state = next;
        // Nobody observing is fine; the state is still tracked here.
        let _ = self.publisher.send(next);
    }
}
