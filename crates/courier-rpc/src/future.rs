use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::error::RpcError;

struct CallState {
    result: Mutex<Option<Result<Vec<u8>, RpcError>>>,
    ready: Condvar,
}

/// Blocking handle for one call's outcome.
///
/// The future always terminates: if the reply callback is dropped without
/// ever running — request evicted, timed out, connection closed, client
/// closed — it resolves to [`RpcError::Cancelled`].
pub struct CallFuture {
    state: Arc<CallState>,
}

impl CallFuture {
    /// Blocks until the call resolves.
    pub fn wait(self) -> Result<Vec<u8>, RpcError> {
        let mut result = self.state.result.lock().expect("call state poisoned");
        while result.is_none() {
            result = self.state.ready.wait(result).expect("call state poisoned");
        }
        result.take().expect("checked above")
    }

    /// Blocks up to `timeout`; `None` means the call is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Vec<u8>, RpcError>> {
        let result = self.state.result.lock().expect("call state poisoned");
        let (mut result, _) = self
            .state
            .ready
            .wait_timeout_while(result, timeout, |result| result.is_none())
            .expect("call state poisoned");
        result.take()
    }
}

/// Completion side of a [`CallFuture`]. Dropping it unresolved cancels the
/// future.
pub(crate) struct CallPromise {
    state: Arc<CallState>,
    resolved: bool,
}

impl CallPromise {
    pub(crate) fn resolve(mut self, result: Result<Vec<u8>, RpcError>) {
        self.resolved = true;
        *self.state.result.lock().expect("call state poisoned") = Some(result);
        self.state.ready.notify_all();
    }
}

impl Drop for CallPromise {
    fn drop(&mut self) {
        if !self.resolved {
            *self.state.result.lock().expect("call state poisoned") =
                Some(Err(RpcError::Cancelled));
            self.state.ready.notify_all();
        }
    }
}

pub(crate) fn call_pair() -> (CallFuture, CallPromise) {
    let state = Arc::new(CallState { result: Mutex::new(None), ready: Condvar::new() });
    (CallFuture { state: Arc::clone(&state) }, CallPromise { state, resolved: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_with_the_value() {
        let (future, promise) = call_pair();
        promise.resolve(Ok(b"out".to_vec()));
        assert_eq!(future.wait(), Ok(b"out".to_vec()));
    }

    #[test]
    fn dropping_the_promise_cancels() {
        let (future, promise) = call_pair();
        drop(promise);
        assert_eq!(future.wait(), Err(RpcError::Cancelled));
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let (future, promise) = call_pair();
        assert_eq!(future.wait_timeout(Duration::from_millis(20)), None);
        promise.resolve(Err(RpcError::BadReply));
        assert_eq!(
            future.wait_timeout(Duration::from_millis(20)),
            Some(Err(RpcError::BadReply))
        );
    }
}
