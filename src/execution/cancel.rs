//! Cancellation signal shared by the engine and its workers

use crate::core::CancelCause;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Cloneable cancellation token.
///
/// The first cause recorded wins. A child token observes its parent's
/// cancellation but can also be cancelled on its own, which is how a matrix
/// fail-fast group is cancelled without touching the rest of the run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
    parent: Option<Box<CancelToken>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// A token cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self, cause: CancelCause) {
        // cause is published before waiters wake
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// The cause, if this token or an ancestor has been cancelled
    pub fn cause(&self) -> Option<CancelCause> {
        self.cause
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.cause()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this token or an ancestor is cancelled
    pub async fn cancelled(&self) -> CancelCause {
        self.token.cancelled().await;
        self.cause().unwrap_or(CancelCause::Aborted)
    }
}
