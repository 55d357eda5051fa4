use crate::error::ProtoKvError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation and deadline scope threaded through every backend call.
///
/// Checked before each primitive-KV operation; a cancelled or expired
/// context stops the operation before it issues further backend calls,
/// and any in-flight transaction is rolled back by the caller.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancelled: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

/// Handle that flips the paired [`OpContext`] to cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl OpContext {
    /// A context that is never cancelled and never expires.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context paired with a handle that can cancel it from another thread.
    pub fn cancellable() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Self {
            cancelled: Some(flag.clone()),
            deadline: None,
        };
        (ctx, CancelHandle { flag })
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fails with `Cancelled` once the context is cancelled or past deadline.
    pub fn check(&self) -> Result<(), ProtoKvError> {
        if let Some(flag) = &self.cancelled {
            if flag.load(Ordering::Acquire) {
                return Err(ProtoKvError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ProtoKvError::Cancelled);
            }
        }
        Ok(())
    }
}
