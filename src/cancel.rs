//! Cancellable deadline scopes.
//!
//! A `CancelScope` is a tree node: cancelling a scope cancels every scope
//! derived from it. Each scope may also carry a deadline, inherited by
//! children (a child never outlives its parent's deadline).
//!
//! Blocking code observes a scope two ways:
//! - polling [`CancelScope::check`] between bounded I/O waits;
//! - selecting on [`CancelScope::done`], a channel that disconnects on cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{CaptureError, CaptureResult};

#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    cancelled: AtomicBool,
    /// Dropping the sender disconnects `done` for every waiter.
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    deadline: Option<Instant>,
    budget: Option<Duration>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

impl ScopeInner {
    fn new(deadline: Option<Instant>, budget: Option<Duration>) -> Arc<Self> {
        let (trigger, done) = bounded(0);
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            done,
            deadline,
            budget,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

impl CancelScope {
    /// A scope with no parent and no deadline.
    pub fn root() -> Self {
        Self {
            inner: ScopeInner::new(None, None),
        }
    }

    /// Derive a scope that is cancelled with this one and shares its deadline.
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline, self.inner.budget)
    }

    /// Derive a scope that additionally expires `budget` from now.
    pub fn child_with_budget(&self, budget: Duration) -> Self {
        let own = Instant::now() + budget;
        let deadline = match self.inner.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        self.derive(Some(deadline), Some(budget))
    }

    fn derive(&self, deadline: Option<Instant>, budget: Option<Duration>) -> Self {
        let child = ScopeInner::new(deadline, budget);
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled between the flag check and the push.
        if self.is_cancelled() {
            child.cancel();
        }
        Self { inner: child }
    }

    /// Cancel this scope and all scopes derived from it. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Budget the scope was created with, if it has a deadline of its own.
    pub fn budget(&self) -> Option<Duration> {
        self.inner.budget
    }

    /// Time left before the deadline; `None` when the scope has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// `Cancelled` takes precedence over `Timeout`.
    pub fn check(&self) -> CaptureResult<()> {
        if self.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        if self.is_expired() {
            return Err(CaptureError::Timeout {
                budget: self.inner.budget.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Disconnects when the scope is cancelled. Never yields a value.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// Block up to `timeout`; returns true if the scope was cancelled meanwhile.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        select! {
            recv(self.inner.done) -> _ => true,
            default(timeout) => self.is_cancelled(),
        }
    }

    /// Clamp an I/O wait so it never runs past the deadline.
    pub fn clamp(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => wait.min(remaining).max(Duration::from_millis(1)),
            None => wait,
        }
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .field("remaining", &self.remaining())
            .finish()
    }
}
