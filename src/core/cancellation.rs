//! Dispatch cancellation
//!
//! Every dispatch carries a [`CancellationToken`]. Tokens form a hierarchy:
//! a distribution owns a parent token and each subtask dispatch gets a child,
//! so short-circuiting a map-reduce cancels every remaining subtask at once.
//!
//! Tokens can be polled (`is_cancelled`, `check`) or awaited (`cancelled`),
//! which is what lets a pool end a client wait the moment a token fires.
//!
//! # Example
//!
//! ```rust
//! use pool_orchestrator::CancellationToken;
//!
//! let parent = CancellationToken::new();
//! let child = parent.child();
//!
//! parent.cancel();
//!
//! assert!(parent.is_cancelled());
//! assert!(child.is_cancelled());
//! ```

use crate::core::{OrchestratorError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Reason for cancellation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// Explicitly cancelled via `cancel()`
    Manual,
    /// Cancelled due to timeout expiration
    Timeout(Duration),
    /// Cancelled because the parent token was cancelled
    ParentCancelled,
    /// A sibling subtask failed and the fan-out short-circuited
    SiblingFailed(String),
    /// The owning component is shutting down
    Shutdown,
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::Manual => write!(f, "manually cancelled"),
            CancellationReason::Timeout(d) => write!(f, "timeout after {:?}", d),
            CancellationReason::ParentCancelled => write!(f, "parent was cancelled"),
            CancellationReason::SiblingFailed(task_id) => {
                write!(f, "sibling subtask {} failed", task_id)
            }
            CancellationReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

struct TokenInner {
    cancelled: AtomicBool,
    /// Weak so dropped children do not leak
    children: RwLock<Vec<Weak<TokenInner>>>,
    reason: RwLock<Option<CancellationReason>>,
    notify: Notify,
}

impl TokenInner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            children: RwLock::new(Vec::new()),
            reason: RwLock::new(None),
            notify: Notify::new(),
        }
    }
}

/// Cloneable, hierarchical cancellation token
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
        }
    }

    /// Creates a child token linked to this parent
    ///
    /// If the parent is already cancelled the child starts cancelled.
    pub fn child(&self) -> Self {
        let child = CancellationToken {
            inner: Arc::new(TokenInner::new()),
        };

        {
            let mut children = self.inner.children.write();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        if self.is_cancelled() {
            child.cancel_with_reason(CancellationReason::ParentCancelled);
        }

        child
    }

    /// Creates a child token that also cancels itself after `timeout`
    ///
    /// Must be called from within a tokio runtime.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let timer = child.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    timer.cancel_with_reason(CancellationReason::Timeout(timeout));
                }
                _ = timer.cancelled() => {}
            }
        });

        child
    }

    /// Cancel this token with default reason (Manual)
    pub fn cancel(&self) {
        self.cancel_with_reason(CancellationReason::Manual);
    }

    /// Cancel this token and every descendant
    ///
    /// Only the first call records a reason.
    pub fn cancel_with_reason(&self, reason: CancellationReason) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.inner.reason.write() = Some(reason);
        self.inner.notify.notify_waiters();

        let children: Vec<_> = self
            .inner
            .children
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for inner in children {
            CancellationToken { inner }.cancel_with_reason(CancellationReason::ParentCancelled);
        }
    }

    /// Check if this token has been cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason (if cancelled)
    pub fn reason(&self) -> Option<CancellationReason> {
        self.inner.reason.read().clone()
    }

    /// Returns `Cancelled` for `task_id` if this token fired
    pub fn check(&self, task_id: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(self.to_error(task_id))
        } else {
            Ok(())
        }
    }

    /// Completes once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not lost
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn to_error(&self, task_id: &str) -> OrchestratorError {
        let reason = self
            .reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        OrchestratorError::cancelled(task_id, reason)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
        assert!(token.check("t1").is_ok());
    }

    #[test]
    fn test_cancel_is_idempotent_and_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel_with_reason(CancellationReason::Shutdown);
        token.cancel();
        assert_eq!(token.reason(), Some(CancellationReason::Shutdown));
    }

    #[test]
    fn test_child_inherits_parent_cancellation() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(child.reason(), Some(CancellationReason::ParentCancelled));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_check_maps_to_cancelled_error() {
        let token = CancellationToken::new();
        token.cancel_with_reason(CancellationReason::SiblingFailed("t#2".into()));
        let err = token.check("t#3").unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert!(err.to_string().contains("sibling subtask t#2 failed"));
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_with_timeout_fires() {
        let parent = CancellationToken::new();
        let child = parent.child_with_timeout(Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("timeout child should cancel");
        assert_eq!(
            child.reason(),
            Some(CancellationReason::Timeout(Duration::from_millis(20)))
        );
        assert!(!parent.is_cancelled());
    }
}
