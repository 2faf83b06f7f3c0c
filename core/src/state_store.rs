//! In-memory mirror of the persisted [`AdapterState`] record.
//!
//! The adapter never calls `setAlarm`/`deleteAlarm` on the durable store
//! directly — it only ever writes deadline fields through [`StateStore`].
//! [`StateStore::reschedule_alarm`] is the single source of truth mapping
//! "currently defined deadlines" to "the one persisted alarm instant".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::durable_store::{get_typed, now_millis, put_typed, DurableStore, STATE_KEY};
use crate::protocol_constants::{DEADLINE_CHURN_GUARD, INACTIVITY_CHURN_GUARD};

/// The full persisted record for one session. Absence of an optional field
/// is semantically distinct from its default (see [`StatePatch`] for how
/// partial updates preserve that distinction).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdapterState {
    pub session_name: String,
    pub allow_reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_deadline: Option<u64>,
    pub inactivity_deadline: Option<u64>,
    pub cleanup_deadline: Option<u64>,
    pub keep_alive_deadline: Option<u64>,
    pub upstream_session_id: Option<String>,
    pub upstream_adapter_id: Option<String>,
    pub pending_finalize: bool,
    pub pending_close: bool,
    pub closing_due_to_inactivity: bool,
    // TTS-only
    pub selected_voice: Option<String>,
    // STT-only
    pub mic_track_name: Option<String>,
    pub sfu_callback_url: Option<String>,
    // Video-only
    pub video_track_name: Option<String>,
}

impl AdapterState {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            ..Default::default()
        }
    }

    /// Collects every currently-defined deadline field.
    fn deadlines(&self) -> [Option<u64>; 4] {
        [
            self.reconnect_deadline,
            self.inactivity_deadline,
            self.cleanup_deadline,
            self.keep_alive_deadline,
        ]
    }

    /// Invariant (I5): the alarm equals the min of defined deadlines, or is absent.
    pub fn next_alarm(&self) -> Option<u64> {
        self.deadlines().into_iter().flatten().min()
    }
}

/// A merge-patch over [`AdapterState`]. `None` means "leave untouched";
/// nullable fields use `Option<Option<T>>` so a patch can distinguish
/// "don't touch" from "clear to absent".
#[derive(Debug, Default, Clone)]
pub struct StatePatch {
    pub allow_reconnect: Option<bool>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_deadline: Option<Option<u64>>,
    pub inactivity_deadline: Option<Option<u64>>,
    pub cleanup_deadline: Option<Option<u64>>,
    pub keep_alive_deadline: Option<Option<u64>>,
    pub upstream_session_id: Option<Option<String>>,
    pub upstream_adapter_id: Option<Option<String>>,
    pub pending_finalize: Option<bool>,
    pub pending_close: Option<bool>,
    pub closing_due_to_inactivity: Option<bool>,
    pub selected_voice: Option<Option<String>>,
    pub mic_track_name: Option<Option<String>>,
    pub sfu_callback_url: Option<Option<String>>,
    pub video_track_name: Option<Option<String>>,
}

impl StatePatch {
    fn apply(self, state: &mut AdapterState) {
        macro_rules! merge {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    state.$field = v;
                }
            };
        }
        merge!(allow_reconnect);
        merge!(reconnect_attempts);
        merge!(reconnect_deadline);
        merge!(inactivity_deadline);
        merge!(cleanup_deadline);
        merge!(keep_alive_deadline);
        merge!(upstream_session_id);
        merge!(upstream_adapter_id);
        merge!(pending_finalize);
        merge!(pending_close);
        merge!(closing_due_to_inactivity);
        merge!(selected_voice);
        merge!(mic_track_name);
        merge!(sfu_callback_url);
        merge!(video_track_name);
    }
}

/// Named deadline/session-id fields, used by `delete_keys` (the Destroy wipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    ReconnectDeadline,
    InactivityDeadline,
    CleanupDeadline,
    KeepAliveDeadline,
    UpstreamSessionId,
    UpstreamAdapterId,
}

impl StateField {
    fn clear(self, state: &mut AdapterState) {
        match self {
            Self::ReconnectDeadline => state.reconnect_deadline = None,
            Self::InactivityDeadline => state.inactivity_deadline = None,
            Self::CleanupDeadline => state.cleanup_deadline = None,
            Self::KeepAliveDeadline => state.keep_alive_deadline = None,
            Self::UpstreamSessionId => state.upstream_session_id = None,
            Self::UpstreamAdapterId => state.upstream_adapter_id = None,
        }
    }
}

/// Wraps a [`DurableStore`] with an in-memory mirror and alarm bookkeeping.
pub struct StateStore {
    durable: Arc<dyn DurableStore>,
    mirror: RwLock<AdapterState>,
    restored: AtomicBool,
    restored_notify: Notify,
}

impl StateStore {
    pub fn new(durable: Arc<dyn DurableStore>, session_name: impl Into<String>) -> Self {
        Self {
            durable,
            mirror: RwLock::new(AdapterState::new(session_name)),
            restored: AtomicBool::new(false),
            restored_notify: Notify::new(),
        }
    }

    /// Loads the persisted record once, under the initialization gate. Every
    /// other request/alarm handler must call [`Self::wait_until_restored`]
    /// before touching the mirror, preventing any observer of pre-init state.
    pub async fn restore(&self) {
        if self.restored.load(Ordering::Acquire) {
            return;
        }
        let loaded: Option<AdapterState> = get_typed(self.durable.as_ref(), STATE_KEY)
            .await
            .unwrap_or(None);
        if let Some(loaded) = loaded {
            *self.mirror.write() = loaded;
        }
        self.restored.store(true, Ordering::Release);
        self.restored_notify.notify_waiters();
    }

    /// Blocks until [`Self::restore`] has completed. Cheap no-op once restored.
    pub async fn wait_until_restored(&self) {
        if self.restored.load(Ordering::Acquire) {
            return;
        }
        self.restored_notify.notified().await;
    }

    /// Returns a clone of the current in-memory state.
    pub fn snapshot(&self) -> AdapterState {
        self.mirror.read().clone()
    }

    /// Merges `patch` into the mirror, persists, and (unless suppressed)
    /// recomputes the alarm.
    pub async fn update(&self, patch: StatePatch, skip_alarm_reschedule: bool) {
        let persisted = {
            let mut guard = self.mirror.write();
            patch.apply(&mut guard);
            guard.clone()
        };
        let _ = put_typed(self.durable.as_ref(), STATE_KEY, &persisted).await;
        if !skip_alarm_reschedule {
            self.reschedule_alarm().await;
        }
    }

    /// Symmetric deletion of named fields.
    pub async fn delete_keys(&self, keys: &[StateField], skip_alarm_reschedule: bool) {
        let persisted = {
            let mut guard = self.mirror.write();
            for key in keys {
                key.clear(&mut guard);
            }
            guard.clone()
        };
        let _ = put_typed(self.durable.as_ref(), STATE_KEY, &persisted).await;
        if !skip_alarm_reschedule {
            self.reschedule_alarm().await;
        }
    }

    /// Takes the min of all currently-defined deadline fields and calls
    /// `set_alarm`; if none are defined, calls `delete_alarm`. This is the
    /// only place the alarm is ever written (I5).
    pub async fn reschedule_alarm(&self) {
        let next = self.mirror.read().next_alarm();
        match next {
            Some(instant) => {
                let _ = self.durable.set_alarm(instant).await;
            }
            None => {
                let _ = self.durable.delete_alarm().await;
            }
        }
    }

    /// Sets `inactivityDeadline` to `now + timeout`, but never moves it
    /// earlier (P9) and never re-arms it within the churn guard window.
    pub async fn schedule_inactivity(&self, timeout_millis: u64) {
        let now = now_millis();
        let candidate = now + timeout_millis;
        let should_set = {
            let guard = self.mirror.read();
            match guard.inactivity_deadline {
                None => true,
                Some(existing) => {
                    candidate > existing
                        && now.saturating_sub(existing.saturating_sub(timeout_millis))
                            > INACTIVITY_CHURN_GUARD.as_millis() as u64
                }
            }
        };
        if should_set {
            self.update(
                StatePatch {
                    inactivity_deadline: Some(Some(candidate)),
                    ..Default::default()
                },
                false,
            )
            .await;
        }
    }

    /// Sets `cleanupDeadline = now + 100ms`, idempotent with a churn guard,
    /// per (I3).
    pub async fn schedule_cleanup(&self, grace_millis: u64) {
        let already_set = self.mirror.read().cleanup_deadline.is_some();
        if already_set {
            return;
        }
        let deadline = now_millis() + grace_millis;
        self.update(
            StatePatch {
                cleanup_deadline: Some(Some(deadline)),
                ..Default::default()
            },
            false,
        )
        .await;
    }

    /// Unconditionally sets `keepAliveDeadline = now + interval_millis`. Unlike
    /// `schedule_inactivity`, this is re-armed on every KeepAlive heartbeat
    /// regardless of the previous value.
    pub async fn schedule_keep_alive(&self, interval_millis: u64) {
        self.update(
            StatePatch {
                keep_alive_deadline: Some(Some(now_millis() + interval_millis)),
                ..Default::default()
            },
            false,
        )
        .await;
    }

    /// The currently persisted alarm instant, if any.
    pub async fn alarm_instant(&self) -> Option<u64> {
        self.durable.get_alarm().await.unwrap_or(None)
    }

    /// Hard teardown: wipes deadline/session-id fields without recomputing
    /// the alarm, then removes the alarm and deletes the persisted record.
    pub async fn wipe_and_destroy(&self) {
        self.delete_keys(
            &[
                StateField::ReconnectDeadline,
                StateField::InactivityDeadline,
                StateField::CleanupDeadline,
                StateField::KeepAliveDeadline,
                StateField::UpstreamSessionId,
                StateField::UpstreamAdapterId,
            ],
            true,
        )
        .await;
        let _ = self.durable.delete_alarm().await;
        let _ = self.durable.delete_all().await;
    }

    /// Schedules `reconnectDeadline` only if earlier than any existing value,
    /// honoring the 250ms churn guard (§4.5).
    pub async fn schedule_reconnect_deadline(&self, candidate: u64) {
        let should_set = {
            let guard = self.mirror.read();
            match guard.reconnect_deadline {
                None => true,
                Some(existing) => {
                    candidate < existing
                        || existing.saturating_sub(candidate) > DEADLINE_CHURN_GUARD.as_millis() as u64
                }
            }
        };
        if should_set {
            self.update(
                StatePatch {
                    reconnect_deadline: Some(Some(candidate)),
                    ..Default::default()
                },
                false,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::InMemoryDurableStore;

    fn store() -> StateStore {
        StateStore::new(Arc::new(InMemoryDurableStore::new()), "s1")
    }

    #[tokio::test]
    async fn restore_is_idempotent_and_gates_readers() {
        let s = store();
        s.restore().await;
        s.wait_until_restored().await;
        assert_eq!(s.snapshot().session_name, "s1");
    }

    #[tokio::test]
    async fn update_merges_without_disturbing_other_fields() {
        let s = store();
        s.update(
            StatePatch {
                allow_reconnect: Some(true),
                ..Default::default()
            },
            false,
        )
        .await;
        s.update(
            StatePatch {
                reconnect_attempts: Some(2),
                ..Default::default()
            },
            false,
        )
        .await;
        let snap = s.snapshot();
        assert!(snap.allow_reconnect);
        assert_eq!(snap.reconnect_attempts, 2);
    }

    #[tokio::test]
    async fn reschedule_alarm_picks_min_of_deadlines() {
        let s = store();
        s.update(
            StatePatch {
                inactivity_deadline: Some(Some(500)),
                cleanup_deadline: Some(Some(100)),
                ..Default::default()
            },
            false,
        )
        .await;
        let alarm = s.durable.get_alarm().await.unwrap();
        assert_eq!(alarm, Some(100));
    }

    #[tokio::test]
    async fn alarm_is_deleted_when_no_deadlines_defined() {
        let s = store();
        s.update(
            StatePatch {
                inactivity_deadline: Some(Some(500)),
                ..Default::default()
            },
            false,
        )
        .await;
        s.update(
            StatePatch {
                inactivity_deadline: Some(None),
                ..Default::default()
            },
            false,
        )
        .await;
        assert_eq!(s.durable.get_alarm().await.unwrap(), None);
    }

    #[tokio::test]
    async fn skip_alarm_reschedule_leaves_alarm_untouched() {
        let s = store();
        s.update(
            StatePatch {
                inactivity_deadline: Some(Some(500)),
                ..Default::default()
            },
            false,
        )
        .await;
        s.update(
            StatePatch {
                inactivity_deadline: Some(None),
                ..Default::default()
            },
            true,
        )
        .await;
        // Alarm was never recomputed, so it still reflects the stale deadline.
        assert_eq!(s.durable.get_alarm().await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn inactivity_deadline_never_moves_earlier() {
        let s = store();
        s.schedule_inactivity(10_000).await;
        let first = s.snapshot().inactivity_deadline.unwrap();
        s.schedule_inactivity(1).await;
        let second = s.snapshot().inactivity_deadline.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn schedule_keep_alive_always_moves_forward() {
        let s = store();
        s.schedule_keep_alive(5_000).await;
        let first = s.snapshot().keep_alive_deadline.unwrap();
        s.schedule_keep_alive(5_000).await;
        let second = s.snapshot().keep_alive_deadline.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn wipe_and_destroy_clears_alarm_and_record() {
        let s = store();
        s.update(
            StatePatch {
                inactivity_deadline: Some(Some(500)),
                upstream_session_id: Some(Some("sess".into())),
                ..Default::default()
            },
            false,
        )
        .await;
        s.wipe_and_destroy().await;
        assert_eq!(s.alarm_instant().await, None);
        assert_eq!(s.durable.get(STATE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_keys_wipes_named_fields_only() {
        let s = store();
        s.update(
            StatePatch {
                upstream_session_id: Some(Some("sess".into())),
                selected_voice: Some(Some("zeus".into())),
                ..Default::default()
            },
            false,
        )
        .await;
        s.delete_keys(&[StateField::UpstreamSessionId], true).await;
        let snap = s.snapshot();
        assert!(snap.upstream_session_id.is_none());
        assert_eq!(snap.selected_voice.as_deref(), Some("zeus"));
    }
}
