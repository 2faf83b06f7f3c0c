//! Bounded, ordered byte queue with cooperative draining (STT hot path).
//!
//! Draining is batched rather than one-send-per-enqueue so the upstream link
//! sees steady frames instead of a flood of tiny ones; exclusivity is a flag
//! rather than a held lock so a single drain turn can yield control back to
//! the runtime without blocking new enqueues.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol_constants::{
    SEND_QUEUE_MAX_BATCHES_PER_TURN, SEND_QUEUE_MAX_BATCH_BYTES, SEND_QUEUE_MAX_QUEUE_BYTES,
    SEND_QUEUE_MAX_SLICE, SEND_QUEUE_MIN_BATCH_BYTES,
};
use crate::runtime::TaskSpawner;

/// The upstream sink a [`SendQueue`] drains into. Implementations own
/// reconnect policy; `ensure_open` may attempt a (re)connect and should
/// return quickly with `false` if the link cannot be opened right now.
#[async_trait]
pub trait SendQueueUpstream: Send + Sync {
    async fn ensure_open(&self) -> bool;
    async fn send_binary(&self, frame: Bytes);
    async fn send_finalize(&self);
    async fn send_close_stream(&self);
}

struct Inner {
    entries: VecDeque<Bytes>,
    queued_bytes: usize,
    pending_finalize: bool,
    pending_close: bool,
    draining: bool,
}

impl Inner {
    fn has_work(&self) -> bool {
        self.queued_bytes >= SEND_QUEUE_MIN_BATCH_BYTES
            || (self.queued_bytes > 0 && (self.pending_finalize || self.pending_close))
    }
}

pub struct SendQueue {
    inner: Mutex<Inner>,
    upstream: Arc<dyn SendQueueUpstream>,
    spawner: Arc<dyn TaskSpawner>,
}

impl SendQueue {
    pub fn new(upstream: Arc<dyn SendQueueUpstream>, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                queued_bytes: 0,
                pending_finalize: false,
                pending_close: false,
                draining: false,
            }),
            upstream,
            spawner,
        })
    }

    /// Appends `buf`, dropping from the head while over `MAX_QUEUE`, then
    /// nudges the drain loop.
    pub fn enqueue(self: &Arc<Self>, buf: Bytes) {
        {
            let mut inner = self.inner.lock();
            inner.queued_bytes += buf.len();
            inner.entries.push_back(buf);
            while inner.queued_bytes > SEND_QUEUE_MAX_QUEUE_BYTES {
                match inner.entries.pop_front() {
                    Some(dropped) => {
                        inner.queued_bytes -= dropped.len();
                        log::warn!(
                            "[SendQueue] over MAX_QUEUE, dropped {} bytes from head",
                            dropped.len()
                        );
                    }
                    None => break,
                }
            }
        }
        self.nudge();
    }

    pub fn request_finalize(self: &Arc<Self>) {
        self.inner.lock().pending_finalize = true;
        self.nudge();
    }

    pub fn request_close(self: &Arc<Self>) {
        self.inner.lock().pending_close = true;
        self.nudge();
    }

    fn nudge(self: &Arc<Self>) {
        let should_spawn = {
            let inner = self.inner.lock();
            !inner.draining && inner.has_work()
        };
        if should_spawn {
            let this = self.clone();
            self.spawner
                .spawn_boxed(Box::pin(async move { this.drain_turn().await }));
        }
    }

    /// One cooperative drain turn: claims exclusivity, ships batches until
    /// `MAX_BATCHES_PER_TURN` or `MAX_SLICE` is hit (scheduling another turn
    /// if work remains), then handles terminal sentinels once empty.
    async fn drain_turn(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.draining || !inner.has_work() {
                return;
            }
            inner.draining = true;
        }

        let started = Instant::now();
        let mut batches_this_turn = 0usize;

        loop {
            let still_has_work = self.inner.lock().has_work();
            if !still_has_work {
                break;
            }
            if !self.upstream.ensure_open().await {
                break;
            }

            let batch = self.pop_batch();
            if batch.is_empty() {
                break;
            }
            self.upstream.send_binary(batch).await;
            batches_this_turn += 1;

            if batches_this_turn >= SEND_QUEUE_MAX_BATCHES_PER_TURN
                || started.elapsed() >= SEND_QUEUE_MAX_SLICE
            {
                self.inner.lock().draining = false;
                self.nudge();
                return;
            }
        }

        self.flush_terminal_sentinel().await;

        self.inner.lock().draining = false;
        if self.inner.lock().has_work() {
            self.nudge();
        }
    }

    /// Pops entries from the head into a single concatenated frame, always
    /// shipping at least one entry even if it alone exceeds `MAX_BATCH`.
    fn pop_batch(&self) -> Bytes {
        let mut inner = self.inner.lock();
        let mut parts: Vec<Bytes> = Vec::new();
        let mut batch_len = 0usize;
        while let Some(front_len) = inner.entries.front().map(Bytes::len) {
            if !parts.is_empty() && batch_len + front_len > SEND_QUEUE_MAX_BATCH_BYTES {
                break;
            }
            let entry = inner.entries.pop_front().expect("front was just peeked");
            inner.queued_bytes -= entry.len();
            batch_len += entry.len();
            parts.push(entry);
            if batch_len >= SEND_QUEUE_MAX_BATCH_BYTES {
                break;
            }
        }
        drop(inner);

        if parts.len() == 1 {
            return parts.pop().unwrap();
        }
        let mut frame = Vec::with_capacity(batch_len);
        for part in parts {
            frame.extend_from_slice(&part);
        }
        Bytes::from(frame)
    }

    async fn flush_terminal_sentinel(&self) {
        let (do_finalize, do_close) = {
            let mut inner = self.inner.lock();
            if inner.queued_bytes != 0 {
                (false, false)
            } else if inner.pending_finalize {
                inner.pending_finalize = false;
                (true, false)
            } else if inner.pending_close {
                inner.pending_close = false;
                (false, true)
            } else {
                (false, false)
            }
        };

        if do_finalize {
            if self.upstream.ensure_open().await {
                self.upstream.send_finalize().await;
            }
        } else if do_close && self.upstream.ensure_open().await {
            self.upstream.send_close_stream().await;
        }
    }

    #[cfg(test)]
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeUpstream {
        open: std::sync::atomic::AtomicBool,
        sent_frames: AsyncMutex<Vec<Bytes>>,
        finalize_count: AtomicUsize,
        close_count: AtomicUsize,
    }

    #[async_trait]
    impl SendQueueUpstream for FakeUpstream {
        async fn ensure_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send_binary(&self, frame: Bytes) {
            self.sent_frames.lock().await.push(frame);
        }
        async fn send_finalize(&self) {
            self.finalize_count.fetch_add(1, Ordering::SeqCst);
        }
        async fn send_close_stream(&self) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open_upstream() -> Arc<FakeUpstream> {
        let u = Arc::new(FakeUpstream::default());
        u.open.store(true, Ordering::SeqCst);
        u
    }

    #[tokio::test]
    async fn enqueue_below_min_batch_does_not_drain_immediately() {
        let upstream = open_upstream();
        let queue = SendQueue::new(upstream.clone(), Arc::new(TokioSpawner::current()));
        queue.enqueue(Bytes::from(vec![0u8; 100]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(queue.queued_bytes(), 100, "below MIN_BATCH, nothing should drain yet");
    }

    #[tokio::test]
    async fn enqueue_above_min_batch_drains_to_upstream() {
        let upstream = open_upstream();
        let queue = SendQueue::new(upstream.clone(), Arc::new(TokioSpawner::current()));
        queue.enqueue(Bytes::from(vec![7u8; SEND_QUEUE_MIN_BATCH_BYTES + 1]));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(queue.queued_bytes(), 0);
        assert_eq!(upstream.sent_frames.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn overflow_drops_from_head_and_logs() {
        let upstream = Arc::new(FakeUpstream::default()); // stays closed, so nothing drains
        let queue = SendQueue::new(upstream, Arc::new(TokioSpawner::current()));
        queue.enqueue(Bytes::from(vec![1u8; SEND_QUEUE_MAX_QUEUE_BYTES]));
        queue.enqueue(Bytes::from(vec![2u8; 10]));
        assert!(queue.queued_bytes() <= SEND_QUEUE_MAX_QUEUE_BYTES);
    }

    #[tokio::test]
    async fn finalize_is_sent_once_queue_drains_to_empty() {
        let upstream = open_upstream();
        let queue = SendQueue::new(upstream.clone(), Arc::new(TokioSpawner::current()));
        queue.enqueue(Bytes::from(vec![1u8; SEND_QUEUE_MIN_BATCH_BYTES + 1]));
        queue.request_finalize();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(upstream.finalize_count.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.close_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_sent_when_no_finalize_pending() {
        let upstream = open_upstream();
        let queue = SendQueue::new(upstream.clone(), Arc::new(TokioSpawner::current()));
        queue.request_close();
        queue.enqueue(Bytes::from(vec![1u8; SEND_QUEUE_MIN_BATCH_BYTES + 1]));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(upstream.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_upstream_halts_drain_without_losing_data() {
        let upstream = Arc::new(FakeUpstream::default());
        let queue = SendQueue::new(upstream.clone(), Arc::new(TokioSpawner::current()));
        queue.enqueue(Bytes::from(vec![1u8; SEND_QUEUE_MIN_BATCH_BYTES + 1]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(queue.queued_bytes() > 0, "drain should stall while upstream is closed");
    }
}
