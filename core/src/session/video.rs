//! The Video session adapter: relays JPEG frames from the SFU's video track
//! to viewer sockets, retaining the most recent frame for late joiners.

use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client_registry::{ClientHandle, ClientRegistry, ClientRole};
use crate::codec::PacketCodec;
use crate::error::{AdapterError, AdapterResult};
use crate::session::common::due_deadlines;
use crate::sfu_client::SfuClient;
use crate::state_store::{StatePatch, StateStore};

pub struct VideoAdapter {
    session_name: String,
    pub state: Arc<StateStore>,
    clients: Arc<ClientRegistry>,
    sfu: Arc<dyn SfuClient>,
    sfu_callback_base: String,
    last_frame: Mutex<Option<Bytes>>,
}

impl VideoAdapter {
    pub fn new(
        session_name: impl Into<String>,
        state: Arc<StateStore>,
        clients: Arc<ClientRegistry>,
        sfu: Arc<dyn SfuClient>,
        sfu_callback_base: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_name: session_name.into(),
            state,
            clients,
            sfu,
            sfu_callback_base,
            last_frame: Mutex::new(None),
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Publishes the caller's camera track into the SFU via autoDiscover.
    pub async fn connect(&self, sdp: String) -> AdapterResult<String> {
        self.state.wait_until_restored().await;
        let upstream_session_id = self.sfu.create_session().await?;
        let discovered = self.sfu.add_tracks_auto_discover(&upstream_session_id, &sdp, "video").await?;
        let video_track_name = discovered
            .tracks
            .first()
            .map(|t| t.track_name.clone())
            .ok_or_else(|| AdapterError::SfuError("no video track discovered".into()))?;

        self.state
            .update(
                StatePatch {
                    upstream_session_id: Some(Some(upstream_session_id)),
                    video_track_name: Some(Some(video_track_name)),
                    ..Default::default()
                },
                false,
            )
            .await;
        Ok(discovered.sdp_answer)
    }

    /// Idempotent: repeating `start-forwarding` while already forwarding is a no-op success.
    pub async fn start_forwarding(&self) -> AdapterResult<()> {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        if snap.upstream_adapter_id.is_some() {
            return Ok(());
        }
        let (upstream_session_id, video_track_name) = match (snap.upstream_session_id.clone(), snap.video_track_name.clone()) {
            (Some(s), Some(t)) => (s, t),
            _ => return Err(AdapterError::PreconditionFailed("not connected".into())),
        };
        let endpoint = format!("{}/{}/video/sfu-subscribe", self.sfu_callback_base, self.session_name);
        let pulled = self
            .sfu
            .pull_track_to_websocket(&upstream_session_id, &video_track_name, &endpoint, "jpeg")
            .await?;
        self.state
            .update(
                StatePatch {
                    upstream_adapter_id: Some(Some(pulled.adapter_id)),
                    allow_reconnect: Some(true),
                    ..Default::default()
                },
                false,
            )
            .await;
        Ok(())
    }

    /// Idempotent: repeating `stop-forwarding` while already stopped is a no-op success.
    pub async fn stop_forwarding(&self) -> AdapterResult<()> {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        if let Some(upstream_adapter_id) = snap.upstream_adapter_id.clone() {
            self.sfu.close_websocket_adapter(&upstream_adapter_id).await?;
        }
        self.state
            .update(
                StatePatch {
                    upstream_adapter_id: Some(None),
                    allow_reconnect: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await;
        Ok(())
    }

    pub fn sfu_subscribe(self: &Arc<Self>) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        self.clients.register(ClientRole::SfuVideo)
    }

    /// Accepts a viewer socket; if a frame has already been captured, sends
    /// it immediately so the new viewer doesn't wait for the next one.
    pub fn viewer(self: &Arc<Self>) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        let (handle, rx) = self.clients.register(ClientRole::Viewer);
        if let Some(frame) = self.last_frame.lock().clone() {
            self.clients.send_to(handle.id(), Message::Binary(frame));
        }
        (handle, rx)
    }

    /// Decodes one SFU-framed JPEG packet, retains it as the late-joiner
    /// artifact, and fans the raw JPEG bytes out to every viewer.
    pub async fn ingest_frame(&self, frame: &[u8]) {
        let Ok(packet) = PacketCodec::decode(frame) else {
            return;
        };
        if packet.payload.is_empty() {
            return;
        }
        *self.last_frame.lock() = Some(packet.payload.clone());
        self.clients.fan_out(ClientRole::Viewer, Message::Binary(packet.payload));
        self.state.schedule_inactivity(crate::protocol_constants::DEFAULT_INACTIVITY_TIMEOUT.as_millis() as u64).await;
    }

    /// Invoked by the per-session alarm loop at the persisted deadline instant.
    /// No reconnect or keep-alive steps: video has no upstream AI link.
    pub async fn alarm(&self, now: u64) {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        let due = due_deadlines(&snap, now);

        if due.cleanup {
            self.state
                .update(StatePatch { cleanup_deadline: Some(None), ..Default::default() }, false)
                .await;
        }

        if due.inactivity {
            if self.clients.count(ClientRole::Viewer) == 0 && self.clients.count(ClientRole::SfuVideo) == 0 {
                self.clients.close_all(1000, "Inactive");
            }
            self.state
                .update(StatePatch { inactivity_deadline: Some(None), ..Default::default() }, false)
                .await;
        }
    }

    pub async fn destroy(&self) {
        self.clients.close_all(1000, "Session destroyed");
        *self.last_frame.lock() = None;
        self.state.wipe_and_destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::InMemoryDurableStore;
    use crate::sfu_client::{AddTracksResult, DiscoveredTrack, PullTrackResult, PushTrackResult};
    use async_trait::async_trait;

    struct FakeSfu;

    #[async_trait]
    impl SfuClient for FakeSfu {
        async fn create_session(&self) -> AdapterResult<String> {
            Ok("upstream-sess".into())
        }

        async fn add_tracks_auto_discover(&self, _session_id: &str, _sdp: &str, _kind: &str) -> AdapterResult<AddTracksResult> {
            Ok(AddTracksResult {
                sdp_answer: "v=0-answer".into(),
                tracks: vec![DiscoveredTrack { track_name: "video-1".into(), kind: "video".into() }],
            })
        }

        async fn pull_remote_track_to_player(&self, _: &str, _: &str, _: &str, _: &str) -> AdapterResult<String> {
            unimplemented!("not used by video")
        }

        async fn push_track_from_websocket(&self, _: &str, _: &str) -> AdapterResult<PushTrackResult> {
            unimplemented!("not used by video")
        }

        async fn pull_track_to_websocket(&self, _session_id: &str, _track_name: &str, _endpoint: &str, _output_codec: &str) -> AdapterResult<PullTrackResult> {
            Ok(PullTrackResult { adapter_id: "adapter-1".into(), json: serde_json::json!({}) })
        }

        async fn close_websocket_adapter(&self, _adapter_id: &str) -> AdapterResult<()> {
            Ok(())
        }
    }

    fn adapter() -> Arc<VideoAdapter> {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryDurableStore::new()), "s1"));
        VideoAdapter::new(
            "s1",
            state,
            Arc::new(ClientRegistry::new()),
            Arc::new(FakeSfu),
            "https://callback.example".into(),
        )
    }

    #[tokio::test]
    async fn start_forwarding_without_connect_is_precondition_failed() {
        let adapter = adapter();
        let err = adapter.start_forwarding().await.unwrap_err();
        assert!(matches!(err, AdapterError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn connect_publishes_camera_track_via_auto_discover() {
        let adapter = adapter();
        let answer = adapter.connect("v=0-offer".into()).await.unwrap();
        assert_eq!(answer, "v=0-answer");
        assert_eq!(adapter.state.snapshot().video_track_name.as_deref(), Some("video-1"));
    }

    #[tokio::test]
    async fn start_forwarding_is_idempotent() {
        let adapter = adapter();
        adapter.connect("v=0-offer".into()).await.unwrap();
        adapter.start_forwarding().await.unwrap();
        adapter.start_forwarding().await.unwrap();
        let snap = adapter.state.snapshot();
        assert!(snap.allow_reconnect);
        assert_eq!(snap.upstream_adapter_id.as_deref(), Some("adapter-1"));
    }

    #[tokio::test]
    async fn ingest_frame_retains_last_frame_for_late_joiners() {
        let adapter = adapter();
        let framed = PacketCodec::encode(0, 0, &[0xFF, 0xD8, 0xFF, 0xD9]);
        adapter.ingest_frame(&framed).await;
        assert_eq!(adapter.last_frame.lock().as_deref(), Some(&[0xFF, 0xD8, 0xFF, 0xD9][..]));
    }

    #[tokio::test]
    async fn viewer_joining_after_a_frame_gets_it_immediately() {
        let adapter = adapter();
        let framed = PacketCodec::encode(0, 0, &[1, 2, 3, 4]);
        adapter.ingest_frame(&framed).await;

        let (_handle, mut rx) = adapter.viewer();
        let msg = rx.try_recv().expect("late joiner should receive the retained frame");
        match msg {
            Message::Binary(bytes) => assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}
