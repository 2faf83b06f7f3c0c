//! Tracks accepted WebSocket clients for one session, tagged by role.
//!
//! Adapted from the connection manager's registration/force-close shape,
//! generalized from a flat, untyped connection set into a role-tagged
//! registry with single-subscriber supersession per role.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::durable_store::now_millis;

/// Invoked once per client disconnect (handle drop), regardless of role.
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// The closed set of roles a client socket can be tagged with, drawn from
/// across all session flavors. A single session only ever uses the subset
/// relevant to its own flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    SfuSubscriber,
    SfuAudio,
    SfuVideo,
    TranscriptionStream,
    Viewer,
}

impl ClientRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SfuSubscriber => "sfu-subscriber",
            Self::SfuAudio => "sfu-audio",
            Self::SfuVideo => "sfu-video",
            Self::TranscriptionStream => "transcription-stream",
            Self::Viewer => "viewer",
        }
    }

    /// `sfu-subscriber`, `sfu-audio`, and `sfu-video` each permit at most one
    /// OPEN socket at a time (P1); `transcription-stream` and `viewer` do not.
    pub fn is_single_subscriber(self) -> bool {
        matches!(self, Self::SfuSubscriber | Self::SfuAudio | Self::SfuVideo)
    }
}

#[derive(Debug, Clone)]
pub struct ClientAttachment {
    pub id: String,
    pub role: ClientRole,
    pub created_at: u64,
}

struct Registered {
    attachment: ClientAttachment,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// A registered socket's handle back into the registry. Dropping it
/// unregisters the socket; the owning task should also observe
/// `cancel_token` to know when it has been superseded or force-closed.
pub struct ClientHandle {
    pub attachment: ClientAttachment,
    pub cancel_token: CancellationToken,
    registry: Arc<ClientRegistry>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.attachment.id
    }

    pub fn role(&self) -> ClientRole {
        self.attachment.role
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.registry.unregister(&self.attachment.id);
    }
}

/// Per-session registry of accepted WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<String, Registered>,
    next_seq: AtomicU64,
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_seq: AtomicU64::new(1),
            on_disconnect: Mutex::new(None),
        }
    }

    /// Registers a callback invoked once per client disconnect (any role),
    /// so the owning adapter can schedule `cleanupDeadline` per (I3) without
    /// this registry needing to know about `StateStore`.
    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.on_disconnect.lock() = Some(hook);
    }

    /// Registers a newly-accepted socket under `role`, returning a handle plus
    /// the receiving half of its outbound channel (drained by the socket's
    /// write loop). If `role` is single-subscriber, any existing OPEN socket
    /// of that role is closed first with code 1000, "Superseded by newer
    /// subscriber" (P1).
    pub fn register(
        self: &Arc<Self>,
        role: ClientRole,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        if role.is_single_subscriber() {
            self.close(role, 1000, "Superseded by newer subscriber");
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{seq}-{}", role.as_str(), Uuid::new_v4());
        let attachment = ClientAttachment {
            id: id.clone(),
            role,
            created_at: now_millis(),
        };
        let (outbound, inbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.clients.insert(
            id.clone(),
            Registered {
                attachment: attachment.clone(),
                outbound,
                cancel: cancel.clone(),
            },
        );
        log::info!("[ClientRegistry] registered {id} role={}", role.as_str());

        (
            ClientHandle {
                attachment,
                cancel_token: cancel,
                registry: self.clone(),
            },
            inbound,
        )
    }

    fn unregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            log::info!("[ClientRegistry] unregistered {id}");
            if let Some(hook) = self.on_disconnect.lock().clone() {
                hook();
            }
        }
    }

    /// Sends `message` to exactly one registered socket, by id. Used for
    /// replaying late-joiner state to a single newly-accepted client rather
    /// than broadcasting to the whole role.
    pub fn send_to(&self, id: &str, message: Message) {
        if let Some(entry) = self.clients.get(id) {
            let _ = entry.outbound.send(message);
        }
    }

    /// Sends `message` to every currently-registered socket of `role`.
    /// A send failure (the socket's write loop has already exited) is
    /// ignored; that socket's own teardown will unregister it.
    pub fn fan_out(&self, role: ClientRole, message: Message) {
        for entry in self.clients.iter() {
            if entry.attachment.role == role {
                let _ = entry.outbound.send(message.clone());
            }
        }
    }

    /// Closes every registered socket of `role` with the given close code
    /// and reason, and cancels each one's token so its read/write loop exits.
    pub fn close(&self, role: ClientRole, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let ids: Vec<String> = self
            .clients
            .iter()
            .filter(|e| e.attachment.role == role)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Some(entry) = self.clients.get(&id) {
                let _ = entry.outbound.send(frame.clone());
                entry.cancel.cancel();
            }
        }
    }

    /// Force-closes every registered socket regardless of role, used on destroy.
    pub fn close_all(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        for entry in self.clients.iter() {
            let _ = entry.outbound.send(frame.clone());
            entry.cancel.cancel();
        }
    }

    pub fn count(&self, role: ClientRole) -> usize {
        self.clients.iter().filter(|e| e.attachment.role == role).count()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_unique_ids_and_tracks_count() {
        let registry = Arc::new(ClientRegistry::new());
        let (h1, _r1) = registry.register(ClientRole::Viewer);
        let (h2, _r2) = registry.register(ClientRole::Viewer);
        assert_ne!(h1.id(), h2.id());
        assert_eq!(registry.count(ClientRole::Viewer), 2);
    }

    #[test]
    fn single_subscriber_role_supersedes_prior_socket() {
        let registry = Arc::new(ClientRegistry::new());
        let (first, mut first_rx) = registry.register(ClientRole::SfuAudio);
        assert_eq!(registry.count(ClientRole::SfuAudio), 1);

        let (_second, _second_rx) = registry.register(ClientRole::SfuAudio);

        assert!(first.cancel_token.is_cancelled());
        let msg = first_rx.try_recv().expect("close frame should be queued");
        match msg {
            Message::Close(Some(frame)) => assert_eq!(frame.code, 1000),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn fan_out_only_reaches_matching_role() {
        let registry = Arc::new(ClientRegistry::new());
        let (_viewer, mut viewer_rx) = registry.register(ClientRole::Viewer);
        let (_audio, mut audio_rx) = registry.register(ClientRole::SfuAudio);

        registry.fan_out(ClientRole::Viewer, Message::Text("frame".into()));

        assert!(viewer_rx.try_recv().is_ok());
        assert!(audio_rx.try_recv().is_err());
    }

    #[test]
    fn dropping_handle_unregisters_it() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, _rx) = registry.register(ClientRole::Viewer);
        assert_eq!(registry.count(ClientRole::Viewer), 1);
        drop(handle);
        assert_eq!(registry.count(ClientRole::Viewer), 0);
    }

    #[test]
    fn close_all_cancels_every_socket() {
        let registry = Arc::new(ClientRegistry::new());
        let (h1, _r1) = registry.register(ClientRole::Viewer);
        let (h2, _r2) = registry.register(ClientRole::TranscriptionStream);
        registry.close_all(1001, "destroying");
        assert!(h1.cancel_token.is_cancelled());
        assert!(h2.cancel_token.is_cancelled());
    }
}
