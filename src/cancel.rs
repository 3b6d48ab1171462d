//! Cooperative cancellation shared by every worker of a run.
//!
//! A token is cancelled explicitly (Ctrl-C handler) or implicitly once its
//! deadline passes (`--timeout`). Workers check it before starting a node and
//! while polling engine processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// Shared cancellation flag with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Instant::now().checked_add(timeout),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst) || self.deadline_passed()
    }

    pub fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Return [`Error::Cancelled`] if the token has fired.
    pub fn check(&self, context: &str) -> Result<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let reason = if self.deadline_passed() {
            "timeout reached"
        } else {
            "interrupted"
        };
        Err(Error::Cancelled {
            context: format!("{} ({})", context, reason),
        })
    }
}
