//! One cancellation token, threaded through backup, check, and restore.
//!
//! Workers poll it between records; the packer observes it through its
//! parent scope. No thread-local state, no wrapping it in I/O errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// The per-record poll: cheap, and always surfaces [`Error::Canceled`]
    /// rather than something downstream might mistake for I/O.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancels_once_for_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(Error::Canceled)));
    }
}
