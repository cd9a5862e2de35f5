//! Cooperative cancellation
//!
//! Two tiers of cancellation exist during a run:
//!
//! - The **outer** tier: the caller's [`CancelToken`] and the session's
//!   disposal token. Either one ends the whole run.
//! - The **inner** tier: a per-batch [`CancellationScope`] that cancels
//!   itself as soon as the host announces an exclusive write phase. Workers
//!   push their current item back and exit; the scheduler retries.
//!
//! A scope's token is linked to the outer tokens, so a worker blocked in
//! `take` or inside the content processor only has to watch one token.

use crate::error::Cancelled;
use crate::host::{Host, ListenerId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

struct TokenInner {
    cancelled: AtomicBool,
    parents: Vec<CancelToken>,
}

/// Shared cancellation flag
///
/// Cloning yields a handle to the same flag. A token created with
/// [`CancelToken::linked`] also reports cancellation when any parent is
/// cancelled, but cancelling it never touches its parents.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::linked(Vec::new())
    }

    /// Create a token that is also cancelled whenever any parent is
    pub fn linked(parents: impl IntoIterator<Item = CancelToken>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parents: parents.into_iter().collect(),
            }),
        }
    }

    /// Create a child token of this one
    pub fn child(&self) -> Self {
        Self::linked([self.clone()])
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check this token and all of its parents
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled_locally() || self.inner.parents.iter().any(|p| p.is_cancelled())
    }

    /// Check only this token's own flag, ignoring parents
    pub fn is_cancelled_locally(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if cancellation was requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled_locally())
            .field("parents", &self.inner.parents.len())
            .finish()
    }
}

/// Per-batch cancellation scope bound to the host's write-phase signal
///
/// The scope is always cancelable, whatever the caller's token allows: it
/// registers a write-phase listener on entry that cancels the scope's own
/// token, and removes the listener when dropped. Dropping happens on every
/// exit path of a batch, including unwinding.
pub struct CancellationScope<'h> {
    host: &'h dyn Host,
    token: CancelToken,
    listener: Option<ListenerId>,
}

impl<'h> CancellationScope<'h> {
    /// Enter a new scope linked to the given outer tokens
    pub fn enter(host: &'h dyn Host, outer: impl IntoIterator<Item = CancelToken>) -> Self {
        let token = CancelToken::linked(outer);
        let canceller = token.clone();
        let listener = host.add_write_phase_listener(Arc::new(move || {
            trace!("Write phase starting, cancelling batch scope");
            canceller.cancel();
        }));

        Self {
            host,
            token,
            listener: Some(listener),
        }
    }

    /// Token shared by every worker of this batch
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Cancel the scope explicitly
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True if the scope itself was cancelled (write phase or explicit),
    /// as opposed to one of its outer tokens
    pub fn was_interrupted(&self) -> bool {
        self.token.is_cancelled_locally()
    }
}

impl Drop for CancellationScope<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.host.remove_write_phase_listener(id);
        }
    }
}
