//! Exporter lifecycle: state flag plus tracking of in-flight export calls

use crate::errors::{ExporterError, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExporterState {
    Created,
    Active,
    ShuttingDown,
    Terminated,
}

impl ExporterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExporterState::Created,
            1 => ExporterState::Active,
            2 => ExporterState::ShuttingDown,
            _ => ExporterState::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ExporterState::Created => 0,
            ExporterState::Active => 1,
            ExporterState::ShuttingDown => 2,
            ExporterState::Terminated => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Every in-flight export finished before the timeout
    Drained,
    /// The timeout elapsed with exports still running; they were left to finish on their own
    TimedOut,
    /// A previous call already began shutdown
    AlreadyShutDown,
}

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    active: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: AtomicU8,
    tickets: Mutex<Tickets>,
    changed: Notify,
}

/// Held for the duration of one export call.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    lifecycle: &'a Lifecycle,
    ticket: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.lock_tickets().active.remove(&self.ticket);
        self.lifecycle.changed.notify_waiters();
    }
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(ExporterState::Created.as_u8()),
            tickets: Mutex::new(Tickets::default()),
            changed: Notify::new(),
        }
    }

    /// A lifecycle that accepts exports immediately.
    pub fn active(name: impl Into<String>) -> Self {
        let lifecycle = Self::new(name);
        lifecycle.state.store(ExporterState::Active.as_u8(), Ordering::SeqCst);
        lifecycle
    }

    pub fn state(&self) -> ExporterState {
        ExporterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self) -> usize {
        self.lock_tickets().active.len()
    }

    /// `Created -> Active`. Calling it on an already active lifecycle is a no-op.
    pub fn activate(&self) -> Result<()> {
        match self.transition(ExporterState::Created, ExporterState::Active) {
            Ok(()) => {
                info!("Exporter {} is active", self.name);
                Ok(())
            }
            Err(ExporterState::Active) => Ok(()),
            Err(state) => Err(ExporterError::Rejected(format!(
                "exporter {} cannot be activated from {:?}",
                self.name, state
            ))),
        }
    }

    /// Register an export call, or reject it if the exporter is not active.
    pub fn begin_export(&self) -> Result<InFlightGuard<'_>> {
        // The ticket is taken before the state is read so shutdown cannot miss a call that
        // observed Active.
        let guard = {
            let mut tickets = self.lock_tickets();
            let ticket = tickets.next;
            tickets.next += 1;
            tickets.active.insert(ticket);
            InFlightGuard {
                lifecycle: self,
                ticket,
            }
        };

        match self.state() {
            ExporterState::Active => Ok(guard),
            state => Err(ExporterError::Rejected(format!(
                "exporter {} is {:?}",
                self.name, state
            ))),
        }
    }

    /// Wait until every export registered before this call has finished.
    pub async fn flush(&self) {
        let horizon = self.lock_tickets().next;
        self.wait_until(|tickets| tickets.active.first().is_none_or(|oldest| *oldest >= horizon))
            .await;
        debug!("Flushed exporter {}", self.name);
    }

    /// Begin shutdown. Returns `None` when shutdown had already begun, otherwise waits up to
    /// `timeout` for in-flight exports and reports whether they drained.
    pub async fn begin_shutdown(&self, timeout: Duration) -> Option<ShutdownStatus> {
        let began = self
            .transition(ExporterState::Active, ExporterState::ShuttingDown)
            .or_else(|_| self.transition(ExporterState::Created, ExporterState::ShuttingDown));
        if began.is_err() {
            debug!("Exporter {} is already shutting down", self.name);
            return None;
        }

        info!("Shutting down exporter {}", self.name);
        let drained = tokio::time::timeout(timeout, self.wait_until(|tickets| tickets.active.is_empty()))
            .await
            .is_ok();

        if drained {
            Some(ShutdownStatus::Drained)
        } else {
            warn!(
                "Exporter {} shutdown timed out with {} exports in flight",
                self.name,
                self.in_flight()
            );
            Some(ShutdownStatus::TimedOut)
        }
    }

    /// Final transition; no state follows Terminated.
    pub fn terminate(&self) {
        self.state.store(ExporterState::Terminated.as_u8(), Ordering::SeqCst);
        self.changed.notify_waiters();
        info!("Exporter {} terminated", self.name);
    }

    fn transition(&self, from: ExporterState, to: ExporterState) -> std::result::Result<(), ExporterState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ExporterState::from_u8)
    }

    async fn wait_until(&self, done: impl Fn(&Tickets) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = {
                let tickets = self.lock_tickets();
                done(&*tickets)
            };
            if finished {
                return;
            }
            notified.await;
        }
    }

    fn lock_tickets(&self) -> std::sync::MutexGuard<'_, Tickets> {
        // Ticket bookkeeping stays consistent even if a holder panicked.
        self.tickets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
