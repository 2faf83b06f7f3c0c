//! Ensures at most one in-flight outbound connection attempt per resource.
//!
//! Mirrors the ordering discipline in the subscription arbiter: the
//! authoritative "what's in flight" state is updated before anyone suspends
//! on the network call, so concurrent callers converge on a single attempt
//! instead of racing duplicate connects.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Error produced by a failed connect attempt, cloneable so every awaiter of
/// a shared in-flight attempt receives the same failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("connect failed: {0}")]
pub struct DedupConnectError(pub Arc<str>);

impl From<String> for DedupConnectError {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

type SharedAttempt<T> = Shared<BoxFuture<'static, Result<T, DedupConnectError>>>;

enum State<T> {
    Disconnected,
    Connecting(SharedAttempt<T>),
    Connected(T),
}

/// Deduplicates connection attempts to a single resource of type `T`
/// (typically a cheaply-clonable handle to an open link).
pub struct DedupedConnector<T: Clone + Send + Sync + 'static> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for DedupedConnector<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::Disconnected),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DedupedConnector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the currently connected handle, if any, without attempting a connect.
    pub fn current(&self) -> Option<T> {
        match &*self.state.lock() {
            State::Connected(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Marks the connector disconnected, e.g. after the upstream socket closes.
    pub fn mark_disconnected(&self) {
        *self.state.lock() = State::Disconnected;
    }

    /// Connects, deduplicating concurrent callers.
    ///
    /// `is_open` tests whether an already-connected handle is still usable.
    /// If it is, it is returned immediately with no suspension. If a connect
    /// attempt is already in flight, this call awaits the same attempt. Only
    /// otherwise does it invoke `connect_fn` and publish the result.
    pub async fn connect<F, Fut>(
        &self,
        is_open: impl Fn(&T) -> bool,
        connect_fn: F,
    ) -> Result<T, DedupConnectError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DedupConnectError>> + Send + 'static,
    {
        let in_flight = {
            let guard = self.state.lock();
            match &*guard {
                State::Connected(t) if is_open(t) => return Ok(t.clone()),
                State::Connecting(shared) => Some(shared.clone()),
                _ => None,
            }
        };

        if let Some(shared) = in_flight {
            return shared.await;
        }

        let shared: SharedAttempt<T> = async move { connect_fn().await }.boxed().shared();
        {
            let mut guard = self.state.lock();
            // Another caller may have raced us to the write; whoever wins
            // the lock is the attempt everyone converges on.
            if matches!(&*guard, State::Connecting(_)) {
                if let State::Connecting(existing) = &*guard {
                    let existing = existing.clone();
                    drop(guard);
                    return existing.await;
                }
            }
            *guard = State::Connecting(shared.clone());
        }

        let result = shared.await;
        {
            let mut guard = self.state.lock();
            *guard = match &result {
                Ok(t) => State::Connected(t.clone()),
                Err(_) => State::Disconnected,
            };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_open_handle_without_reconnecting() {
        let connector: DedupedConnector<u32> = DedupedConnector::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let r = connector
            .connect(|_| true, move || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Ok(7u32) }
            })
            .await
            .unwrap();
        assert_eq!(r, 7);

        let a2 = attempts.clone();
        let r2 = connector
            .connect(|_| true, move || {
                a2.fetch_add(1, Ordering::SeqCst);
                async { Ok(99u32) }
            })
            .await
            .unwrap();
        assert_eq!(r2, 7, "already-open handle must be returned without reconnecting");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let connector: Arc<DedupedConnector<u32>> = Arc::new(DedupedConnector::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let connector = connector.clone();
            let attempts = attempts.clone();
            handles.push(tokio::spawn(async move {
                connector
                    .connect(|_| true, move || {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                            Ok(42u32)
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "at most one connect attempt in flight (P5)");
    }

    #[tokio::test]
    async fn failure_propagates_to_all_awaiters_and_resets_state() {
        let connector: DedupedConnector<u32> = DedupedConnector::new();
        let err = connector
            .connect(|_| true, || async { Err(DedupConnectError::from("boom".to_string())) })
            .await;
        assert!(err.is_err());
        assert!(connector.current().is_none());
    }
}
