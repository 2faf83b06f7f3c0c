//! Task spawning abstraction for runtime independence.
//!
//! This module provides a [`TaskSpawner`] trait that allows the core library
//! to spawn background tasks (the AlarmReducer's deadline timer, the SendQueue
//! drain loop, detached `generate` work) without being tied to a specific
//! async runtime. Embedders other than the standalone server may supply their
//! own implementation.

use std::future::Future;
use std::pin::Pin;

/// Abstraction for spawning background tasks.
///
/// Allows core services to spawn asynchronous work without knowing the
/// underlying runtime. Implementations should ensure tasks are properly
/// tracked and can complete even if the spawner is dropped.
///
/// # Example
///
/// ```ignore
/// struct TtsAdapter {
///     spawner: Arc<dyn TaskSpawner>,
/// }
///
/// impl TtsAdapter {
///     fn generate(self: Arc<Self>, text: String) {
///         self.spawner.spawn(async move {
///             self.do_generate(text).await;
///         });
///     }
/// }
/// ```
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    ///
    /// The task runs independently of the caller and will continue until
    /// completion. The spawner does not provide a way to cancel or join
    /// the spawned task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
        Self: Sized,
    {
        self.spawn_boxed(Box::pin(future));
    }

    /// Object-safe spawn entry point used when the spawner is held as
    /// `dyn TaskSpawner`. Implementations provide this instead of `spawn`.
    fn spawn_boxed(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Tokio-based spawner for the standalone server.
///
/// Uses a Tokio runtime handle to spawn tasks. This is the only
/// [`TaskSpawner`] the standalone server wires up today; the trait exists so
/// an embedder hosting these adapters inside a different async runtime can
/// substitute its own.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn_boxed(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self.handle.spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawned_task_runs_detached_from_the_caller() {
        let spawner = TokioSpawner::current();
        let generated = Arc::new(AtomicBool::new(false));
        let generated_clone = generated.clone();

        // Mirrors how `TtsAdapter::generate` fires a detached task and returns
        // immediately rather than awaiting synthesis inline.
        spawner.spawn(async move {
            generated_clone.store(true, Ordering::SeqCst);
        });

        // Give the task a turn to run before checking it landed.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(generated.load(Ordering::SeqCst));
    }
}
