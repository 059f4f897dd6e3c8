use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use polytrace_types::{Kwargs, Value};
use tracing::debug;

use crate::runtime::jit::concrete::ConcreteFunction;
use crate::runtime::jit::context::ExecutionContext;
use crate::runtime::jit::error::{JitError, JitResult};

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    // Dropped on cancel so every waiter on `closed` wakes up.
    notify: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

/// Shared cancellation flag observed by kernels at checkpoints and blocking waits.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                notify: Mutex::new(Some(tx)),
                closed: rx,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Channel that disconnects once cancellation starts.
    pub fn closed(&self) -> &Receiver<()> {
        &self.state.closed
    }

    fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.lock().take();
    }
}

#[derive(Debug)]
pub struct CancellationManager {
    token: CancellationToken,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels every invocation started through this manager. Idempotent.
    pub fn start_cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("cancellation requested");
        }
        self.token.cancel();
    }

    pub fn get_cancelable_function(&self, function: Arc<ConcreteFunction>) -> CancelableFunction {
        CancelableFunction {
            function,
            token: self.token.clone(),
        }
    }
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A concrete function whose invocations observe a cancellation token.
#[derive(Debug, Clone)]
pub struct CancelableFunction {
    function: Arc<ConcreteFunction>,
    token: CancellationToken,
}

impl CancelableFunction {
    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<Value> {
        if self.token.is_cancelled() {
            return Err(JitError::Cancelled);
        }
        let ctx = ExecutionContext::with_cancellation(self.token.clone());
        self.function.call_with_context(&ctx, args, kwargs)
    }

    pub fn function(&self) -> &Arc<ConcreteFunction> {
        &self.function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_disconnects_waiters() {
        let manager = CancellationManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.start_cancel();
        manager.start_cancel();
        assert!(token.is_cancelled());
        assert!(token.closed().recv().is_err());
    }
}
