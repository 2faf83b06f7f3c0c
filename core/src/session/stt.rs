//! The STT session adapter: forwards mic audio from the SFU to the AI
//! provider over a bounded send queue, and fans transcripts out to
//! transcription-stream clients.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::client_registry::{ClientHandle, ClientRegistry, ClientRole};
use crate::codec::PacketCodec;
use crate::durable_store::now_millis;
use crate::error::{AdapterError, AdapterResult};
use crate::protocol_constants::{
    DEFAULT_INACTIVITY_TIMEOUT, KEEPALIVE_INTERVAL, MAX_RECONNECT_ATTEMPTS,
    TRANSCRIPTION_RING_CAPACITY,
};
use crate::runtime::TaskSpawner;
use crate::send_queue::{SendQueue, SendQueueUpstream};
use crate::session::common::{due_deadlines, RingBuffer};
use crate::sfu_client::SfuClient;
use crate::state_store::{StatePatch, StateStore};
use crate::transcoder::{stereo_to_mono, AudioTranscoder, ResampleDirection};
use crate::upstream::{reconnect_delay_ms, UpstreamDispatch, UpstreamMediaLink};

pub struct SttAdapter {
    session_name: String,
    pub state: Arc<StateStore>,
    clients: Arc<ClientRegistry>,
    sfu: Arc<dyn SfuClient>,
    spawner: Arc<dyn TaskSpawner>,
    upstream: UpstreamMediaLink,
    transcoder: Mutex<AudioTranscoder>,
    send_queue: Arc<SendQueue>,
    transcripts: Mutex<RingBuffer<serde_json::Value>>,
    sfu_callback_base: String,
}

struct SttDispatch {
    adapter: Weak<SttAdapter>,
}

#[async_trait]
impl UpstreamDispatch for SttDispatch {
    async fn on_text(&self, text: String) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_upstream_text(text).await;
        }
    }

    async fn on_binary(&self, _data: Bytes) {
        // The STT upstream never sends binary frames; only JSON transcripts.
    }

    async fn on_close(&self) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_upstream_close().await;
        }
    }
}

struct QueueUpstream {
    adapter: Weak<SttAdapter>,
}

#[async_trait]
impl SendQueueUpstream for QueueUpstream {
    async fn ensure_open(&self) -> bool {
        match self.adapter.upgrade() {
            Some(adapter) => adapter.upstream.ensure_open().await.is_ok(),
            None => false,
        }
    }

    async fn send_binary(&self, frame: Bytes) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.upstream.send_binary(frame).await;
        }
    }

    async fn send_finalize(&self) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter
                .upstream
                .send_text(json!({"type": "Finalize"}).to_string())
                .await;
        }
    }

    async fn send_close_stream(&self) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter
                .upstream
                .send_text(json!({"type": "CloseStream"}).to_string())
                .await;
        }
    }
}

impl SttAdapter {
    pub fn new(
        session_name: impl Into<String>,
        state: Arc<StateStore>,
        clients: Arc<ClientRegistry>,
        sfu: Arc<dyn SfuClient>,
        spawner: Arc<dyn TaskSpawner>,
        upstream_url: String,
        upstream_bearer_token: String,
        sfu_callback_base: String,
    ) -> Arc<Self> {
        let session_name = session_name.into();
        Arc::new_cyclic(move |weak: &Weak<SttAdapter>| {
            let dispatch = Arc::new(SttDispatch { adapter: weak.clone() });
            let upstream = UpstreamMediaLink::new(upstream_url, upstream_bearer_token, dispatch, spawner.clone());
            let send_queue = SendQueue::new(Arc::new(QueueUpstream { adapter: weak.clone() }), spawner.clone());
            Self {
                session_name,
                state,
                clients,
                sfu,
                spawner,
                upstream,
                transcoder: Mutex::new(AudioTranscoder::new(ResampleDirection::Downsample48To16)),
                send_queue,
                transcripts: Mutex::new(RingBuffer::new(TRANSCRIPTION_RING_CAPACITY)),
                sfu_callback_base,
            }
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Publishes the caller's mic track into the SFU via autoDiscover and
    /// pre-warms the upstream provider link while forwarding stays paused.
    pub async fn connect(&self, sdp: String) -> AdapterResult<String> {
        self.state.wait_until_restored().await;
        let upstream_session_id = self.sfu.create_session().await?;
        let discovered = self.sfu.add_tracks_auto_discover(&upstream_session_id, &sdp, "audio").await?;
        let mic_track_name = discovered
            .tracks
            .first()
            .map(|t| t.track_name.clone())
            .ok_or_else(|| AdapterError::SfuError("no audio track discovered".into()))?;

        self.state
            .update(
                StatePatch {
                    upstream_session_id: Some(Some(upstream_session_id)),
                    mic_track_name: Some(Some(mic_track_name)),
                    allow_reconnect: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await;
        let _ = self.upstream.ensure_open().await;
        self.state.schedule_keep_alive(KEEPALIVE_INTERVAL.as_millis() as u64).await;
        if self.clients.count(ClientRole::SfuAudio) == 0 {
            self.state
                .schedule_inactivity(DEFAULT_INACTIVITY_TIMEOUT.as_millis() as u64)
                .await;
        }
        Ok(discovered.sdp_answer)
    }

    /// Idempotent: repeating `start-forwarding` while already forwarding is a no-op success.
    pub async fn start_forwarding(&self) -> AdapterResult<()> {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        if snap.upstream_adapter_id.is_some() {
            return Ok(());
        }
        let (upstream_session_id, mic_track_name) = match (snap.upstream_session_id.clone(), snap.mic_track_name.clone()) {
            (Some(s), Some(t)) => (s, t),
            _ => return Err(AdapterError::PreconditionFailed("not connected".into())),
        };
        let endpoint = format!("{}/{}/stt/sfu-subscribe", self.sfu_callback_base, self.session_name);
        let pulled = self
            .sfu
            .pull_track_to_websocket(&upstream_session_id, &mic_track_name, &endpoint, "pcm")
            .await?;
        self.state
            .update(
                StatePatch {
                    upstream_adapter_id: Some(Some(pulled.adapter_id)),
                    allow_reconnect: Some(true),
                    keep_alive_deadline: Some(None),
                    inactivity_deadline: Some(None),
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
        self.send_queue.request_finalize();
        self.state
            .update(
                StatePatch {
                    upstream_adapter_id: Some(None),
                    pending_finalize: Some(true),
                    allow_reconnect: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await;
        let _ = self.upstream.ensure_open().await;
        self.state.schedule_keep_alive(KEEPALIVE_INTERVAL.as_millis() as u64).await;
        Ok(())
    }

    pub async fn reconnect_upstream(&self) -> AdapterResult<()> {
        self.upstream.mark_disconnected();
        self.upstream
            .ensure_open()
            .await
            .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
    }

    pub fn sfu_subscribe(self: &Arc<Self>) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        self.clients.register(ClientRole::SfuAudio)
    }

    /// Accepts a transcription-stream socket and replays the last 100
    /// transcripts so a late joiner sees recent history.
    pub fn transcription_stream(self: &Arc<Self>) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        let (handle, rx) = self.clients.register(ClientRole::TranscriptionStream);
        for entry in self.transcripts.lock().snapshot() {
            self.clients.send_to(handle.id(), Message::Text(entry.to_string().into()));
        }
        (handle, rx)
    }

    /// Ingests one SFU-framed audio packet: decode, transcode to mono 16k,
    /// enqueue for delivery to the upstream AI provider.
    pub fn ingest_audio(&self, frame: &[u8]) {
        let Ok(packet) = PacketCodec::decode(frame) else {
            return;
        };
        if packet.payload.is_empty() {
            return;
        }
        let mono16k = {
            let mut t = self.transcoder.lock();
            t.resample(&stereo_to_mono(&packet.payload))
        };
        if !mono16k.is_empty() {
            self.send_queue.enqueue(Bytes::from(mono16k));
        }
    }

    async fn handle_upstream_text(&self, text: String) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            return;
        };
        // "created" is a provider housekeeping field, never a completion signal.
        if value.get("created").is_some() && value.get("text").is_none() && value.get("channel").is_none() {
            return;
        }

        self.transcripts.lock().push(value.clone());
        let from_finalize = value.get("from_finalize").and_then(serde_json::Value::as_bool).unwrap_or(false);
        let now = now_millis();
        self.clients.fan_out(
            ClientRole::TranscriptionStream,
            Message::Text(json!({"type": "transcription", "data": value, "timestamp": now}).to_string().into()),
        );
        if from_finalize {
            self.clients.fan_out(
                ClientRole::TranscriptionStream,
                Message::Text(json!({"type": "segment_finalized", "timestamp": now}).to_string().into()),
            );
        }

        self.state
            .schedule_inactivity(DEFAULT_INACTIVITY_TIMEOUT.as_millis() as u64)
            .await;

        if self.state.snapshot().closing_due_to_inactivity {
            self.check_inactivity_end_of_stream().await;
        }
    }

    async fn handle_upstream_close(&self) {
        if self.state.snapshot().closing_due_to_inactivity {
            self.check_inactivity_end_of_stream().await;
            return;
        }
        let snap = self.state.snapshot();
        if snap.allow_reconnect && snap.reconnect_attempts < MAX_RECONNECT_ATTEMPTS {
            self.schedule_reconnect(snap.reconnect_attempts).await;
        }
    }

    async fn check_inactivity_end_of_stream(&self) {
        if self.clients.count(ClientRole::SfuAudio) != 0 {
            return;
        }
        let now = now_millis();
        self.clients.fan_out(
            ClientRole::TranscriptionStream,
            Message::Text(json!({"type": "stt_done", "timestamp": now}).to_string().into()),
        );
        self.clients.close(ClientRole::TranscriptionStream, 1000, "Transcription complete");
        self.state
            .update(
                StatePatch {
                    closing_due_to_inactivity: Some(false),
                    allow_reconnect: Some(false),
                    pending_close: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await;
    }

    async fn schedule_reconnect(&self, attempts: u32) {
        let delay = reconnect_delay_ms(attempts);
        self.state
            .update(
                StatePatch {
                    reconnect_attempts: Some(attempts + 1),
                    ..Default::default()
                },
                true,
            )
            .await;
        self.state.schedule_reconnect_deadline(now_millis() + delay).await;
    }

    /// Invoked by the per-session alarm loop at the persisted deadline instant.
    pub async fn alarm(self: &Arc<Self>, now: u64) {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        let due = due_deadlines(&snap, now);

        if due.cleanup {
            self.state
                .update(StatePatch { cleanup_deadline: Some(None), ..Default::default() }, false)
                .await;
        }

        if due.keep_alive {
            let pre_forwarding = snap.upstream_session_id.is_some() && snap.upstream_adapter_id.is_none();
            if self.upstream.is_open() && pre_forwarding {
                self.upstream.send_text(json!({"type": "KeepAlive"}).to_string()).await;
                self.state.schedule_keep_alive(KEEPALIVE_INTERVAL.as_millis() as u64).await;
            } else {
                self.state
                    .update(StatePatch { keep_alive_deadline: Some(None), ..Default::default() }, false)
                    .await;
            }
        }

        if due.inactivity {
            if self.clients.count(ClientRole::SfuAudio) == 0 {
                self.send_queue.request_close();
                self.state
                    .update(
                        StatePatch {
                            pending_close: Some(true),
                            closing_due_to_inactivity: Some(true),
                            ..Default::default()
                        },
                        true,
                    )
                    .await;
            }
            self.state
                .update(StatePatch { inactivity_deadline: Some(None), ..Default::default() }, false)
                .await;
        }

        if due.reconnect {
            match self.upstream.ensure_open().await {
                Ok(()) => {
                    self.state
                        .update(
                            StatePatch {
                                reconnect_attempts: Some(0),
                                reconnect_deadline: Some(None),
                                ..Default::default()
                            },
                            false,
                        )
                        .await;
                }
                Err(_) => self.schedule_reconnect(snap.reconnect_attempts).await,
            }
        }
    }

    pub async fn destroy(&self) {
        self.upstream.mark_disconnected();
        self.clients.close_all(1000, "Session destroyed");
        *self.transcripts.lock() = RingBuffer::new(TRANSCRIPTION_RING_CAPACITY);
        self.state.wipe_and_destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::InMemoryDurableStore;
    use crate::runtime::TokioSpawner;
    use crate::sfu_client::{AddTracksResult, DiscoveredTrack, PullTrackResult, PushTrackResult};

    struct FakeSfu;

    #[async_trait]
    impl SfuClient for FakeSfu {
        async fn create_session(&self) -> AdapterResult<String> {
            Ok("upstream-sess".into())
        }

        async fn add_tracks_auto_discover(&self, _session_id: &str, _sdp: &str, _kind: &str) -> AdapterResult<AddTracksResult> {
            Ok(AddTracksResult {
                sdp_answer: "v=0-answer".into(),
                tracks: vec![DiscoveredTrack { track_name: "mic-1".into(), kind: "audio".into() }],
            })
        }

        async fn pull_remote_track_to_player(&self, _player_session_id: &str, _publisher_session_id: &str, _track_name: &str, _sdp: &str) -> AdapterResult<String> {
            unimplemented!("not used by stt")
        }

        async fn push_track_from_websocket(&self, _track_name: &str, _endpoint: &str) -> AdapterResult<PushTrackResult> {
            unimplemented!("not used by stt")
        }

        async fn pull_track_to_websocket(&self, _session_id: &str, _track_name: &str, _endpoint: &str, _output_codec: &str) -> AdapterResult<PullTrackResult> {
            Ok(PullTrackResult { adapter_id: "adapter-1".into(), json: json!({}) })
        }

        async fn close_websocket_adapter(&self, _adapter_id: &str) -> AdapterResult<()> {
            Ok(())
        }
    }

    fn adapter() -> Arc<SttAdapter> {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryDurableStore::new()), "s1"));
        SttAdapter::new(
            "s1",
            state,
            Arc::new(ClientRegistry::new()),
            Arc::new(FakeSfu),
            Arc::new(TokioSpawner::current()),
            "ws://upstream.example/stt".into(),
            "token".into(),
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
    async fn connect_publishes_mic_track_and_arms_keep_alive() {
        let adapter = adapter();
        let answer = adapter.connect("v=0-offer".into()).await.unwrap();
        assert_eq!(answer, "v=0-answer");
        assert_eq!(adapter.state.snapshot().mic_track_name.as_deref(), Some("mic-1"));
        assert!(adapter.state.snapshot().keep_alive_deadline.is_some());
    }

    #[tokio::test]
    async fn start_forwarding_pulls_track_and_cancels_keep_alive() {
        let adapter = adapter();
        adapter.connect("v=0-offer".into()).await.unwrap();
        adapter.start_forwarding().await.unwrap();
        let snap = adapter.state.snapshot();
        assert_eq!(snap.upstream_adapter_id.as_deref(), Some("adapter-1"));
        assert!(snap.allow_reconnect);
        assert!(snap.keep_alive_deadline.is_none());
    }

    #[tokio::test]
    async fn start_forwarding_is_idempotent() {
        let adapter = adapter();
        adapter.connect("v=0-offer".into()).await.unwrap();
        adapter.start_forwarding().await.unwrap();
        adapter.start_forwarding().await.unwrap();
        assert_eq!(adapter.state.snapshot().upstream_adapter_id.as_deref(), Some("adapter-1"));
    }

    #[tokio::test]
    async fn stop_forwarding_closes_sfu_adapter_and_requests_finalize() {
        let adapter = adapter();
        adapter.connect("v=0-offer".into()).await.unwrap();
        adapter.start_forwarding().await.unwrap();
        adapter.stop_forwarding().await.unwrap();
        let snap = adapter.state.snapshot();
        assert!(snap.upstream_adapter_id.is_none());
        assert!(snap.pending_finalize);
        assert!(!snap.allow_reconnect);
    }

    #[tokio::test]
    async fn created_only_payload_is_not_treated_as_transcript() {
        let adapter = adapter();
        adapter.handle_upstream_text(json!({"created": "2026-01-01"}).to_string()).await;
        assert!(adapter.transcripts.lock().snapshot().is_empty());
    }

    #[tokio::test]
    async fn real_transcript_is_retained_and_fanned_out() {
        let adapter = adapter();
        adapter
            .handle_upstream_text(json!({"text": "hello", "created": "x"}).to_string())
            .await;
        assert_eq!(adapter.transcripts.lock().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn ingest_audio_ignores_empty_payload_packets() {
        let adapter = adapter();
        let frame = PacketCodec::end_of_stream(0, 0);
        adapter.ingest_audio(&frame);
        assert_eq!(adapter.send_queue.queued_bytes(), 0);
    }
}
