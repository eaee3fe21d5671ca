//! Cancellation flag shared between a caller and a running build
//!
//! Kept runtime-free: stages poll the flag between units of work rather than
//! awaiting a notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation signal. Setting it is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Convenience guard: `Err(ForgeError::Cancelled)` once the flag is set.
    pub fn check(&self) -> crate::ForgeResult<()> {
        if self.is_cancelled() {
            Err(crate::ForgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}
