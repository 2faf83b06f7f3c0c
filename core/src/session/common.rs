//! Scaffolding shared by the TTS, STT, and Video session adapters: which
//! deadlines are due at a given instant, a capped late-joiner ring buffer,
//! and the background loop that drives the alarm reducer off the persisted
//! alarm instant.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::client_registry::ClientRegistry;
use crate::durable_store::now_millis;
use crate::protocol_constants::CLEANUP_GRACE;
use crate::runtime::TaskSpawner;
use crate::state_store::{AdapterState, StateStore};

/// Which of the four deadline fields are due at `now`, computed once per
/// alarm firing so each variant's reducer inspects them in the fixed order
/// the design calls for (cleanup, keep-alive, inactivity, reconnect).
#[derive(Debug, Clone, Copy, Default)]
pub struct DueDeadlines {
    pub cleanup: bool,
    pub keep_alive: bool,
    pub inactivity: bool,
    pub reconnect: bool,
}

pub fn due_deadlines(state: &AdapterState, now: u64) -> DueDeadlines {
    DueDeadlines {
        cleanup: state.cleanup_deadline.is_some_and(|d| d <= now),
        keep_alive: state.keep_alive_deadline.is_some_and(|d| d <= now),
        inactivity: state.inactivity_deadline.is_some_and(|d| d <= now),
        reconnect: state.allow_reconnect && state.reconnect_deadline.is_some_and(|d| d <= now),
    }
}

/// A capped FIFO of the most recent late-joiner artifacts (STT's last-100
/// transcription ring; reused wherever a session needs a bounded replay buffer).
pub struct RingBuffer<T> {
    cap: usize,
    items: VecDeque<T>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Wires `clients` so every client disconnect (any role) schedules
/// `cleanupDeadline = now + 100ms` on `state`, per (I3) and the
/// `ClientRegistry` disconnect contract. `unregister` runs from a
/// synchronous `Drop`, so the actual write is spawned.
pub fn wire_disconnect_cleanup(clients: &Arc<ClientRegistry>, state: Arc<StateStore>, spawner: &Arc<dyn TaskSpawner>) {
    let spawner = spawner.clone();
    clients.set_on_disconnect(Arc::new(move || {
        let state = state.clone();
        spawner.spawn_boxed(Box::pin(async move {
            state.schedule_cleanup(CLEANUP_GRACE.as_millis() as u64).await;
        }));
    }));
}

/// Repeatedly sleeps until the persisted alarm instant, then invokes `fire`
/// with the firing instant, looping for the session's lifetime. Spawned as
/// one background task per session via the [`TaskSpawner`] abstraction
/// (the standalone server has no native alarm callback, unlike a hosted
/// durable-object runtime, so this polls the same persisted instant instead).
pub fn spawn_alarm_loop<F, Fut>(
    spawner: &Arc<dyn TaskSpawner>,
    state: Arc<StateStore>,
    mut fire: F,
) where
    F: FnMut(u64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    spawner.spawn_boxed(Box::pin(async move {
        loop {
            let next = state.alarm_instant().await;
            match next {
                Some(instant) => {
                    let now = now_millis();
                    if instant > now {
                        tokio::time::sleep(Duration::from_millis(instant - now)).await;
                    }
                    fire(now_millis()).await;
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let mut ring: RingBuffer<i32> = RingBuffer::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.snapshot(), vec![2, 3]);
    }

    #[test]
    fn due_deadlines_respects_allow_reconnect_gate() {
        let mut state = AdapterState::new("s");
        state.reconnect_deadline = Some(10);
        state.allow_reconnect = false;
        let due = due_deadlines(&state, 100);
        assert!(!due.reconnect, "reconnect must not fire while allowReconnect is false");
    }
}
