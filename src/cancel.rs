use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues tokens that go stale once the guard is advanced.
///
/// Async work captures a token when it starts and checks it before applying
/// its result; advancing the guard abandons everything issued earlier.
#[derive(Debug, Clone, Default)]
pub struct StaleGuard {
    current: Arc<AtomicU64>,
}

impl StaleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates every outstanding token and returns a fresh one.
    pub fn advance(&self) -> TaskToken {
        let issued = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        TaskToken {
            issued,
            current: Arc::clone(&self.current),
        }
    }

    /// Token for the current generation, without invalidating anything.
    pub fn token(&self) -> TaskToken {
        TaskToken {
            issued: self.current.load(Ordering::SeqCst),
            current: Arc::clone(&self.current),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskToken {
    issued: u64,
    current: Arc<AtomicU64>,
}

impl TaskToken {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.issued
    }

    pub fn is_stale(&self) -> bool {
        !self.is_current()
    }
}
