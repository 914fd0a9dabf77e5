//! Cooperative cancellation of a running stage
//!
//! Stages check the flag once per loop iteration and race in-flight requests
//! against [`CancelFlag::cancelled`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

use crate::error::StageError;

/// Why a stage was asked to stop
///
/// Ordered by strength: a delete request overrides a pending pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CancelReason {
    /// Leave the job paused
    Pause = 1,
    /// Leave the job failed but resumable
    Stop = 2,
    /// Remove the job and everything stored for it
    Delete = 3,
}

impl CancelReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pause),
            2 => Some(Self::Stop),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    reason: AtomicU8,
    notify: Notify,
}

/// Shared cancel flag with a reason
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; a stronger reason replaces a weaker one
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.reason.fetch_max(reason as u8, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.inner.reason.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Error out if cancellation was requested
    pub fn check(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Run `fut`, abandoning it if cancellation is requested first
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StageError::Cancelled),
            result = fut => result,
        }
    }
}
