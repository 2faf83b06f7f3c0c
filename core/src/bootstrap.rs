//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::client_registry::ClientRegistry;
use crate::durable_store::{DurableStore, FileDurableStore, InMemoryDurableStore};
use crate::error::{AdapterError, AdapterResult};
use crate::protocol_constants::HTTP_TIMEOUT_SECS;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::session::common::{spawn_alarm_loop, wire_disconnect_cleanup};
use crate::session::stt::SttAdapter;
use crate::session::tts::{TtsAdapter, TtsFallback};
use crate::session::video::VideoAdapter;
use crate::sfu_client::{HttpSfuClient, SfuClient};
use crate::state_store::StateStore;

/// Environment consumed by every session adapter, gathered in one place so
/// the server binary has a single struct to parse from YAML/env/CLI.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub sfu_base_url: String,
    pub sfu_app_id: String,
    pub sfu_bearer_token: String,
    pub ai_account_id: String,
    pub ai_api_token: String,
    pub tts_model_id: String,
    pub stt_model_id: String,
    /// Base URL this server is reachable at, used to build the SFU's pull
    /// callback endpoints (`.../subscribe`, `.../sfu-subscribe`).
    pub public_base_url: String,
    /// When set, session state survives process restarts under
    /// `<data_dir>/<session_name>/`. When absent, sessions are in-memory only.
    pub data_dir: Option<PathBuf>,
}

impl AdapterConfig {
    /// Template for the TTS upstream connect URL, with a `{voice}`
    /// placeholder the adapter fills in once a speaker is published
    /// (spec: `speaker=<voice>` is only known at publish time, not at
    /// adapter construction).
    fn tts_upstream_url_template(&self) -> String {
        format!(
            "wss://api.deepgram.com/v1/speak?model={}&encoding=linear16&sample_rate=24000&container=none&speaker={{voice}}",
            self.tts_model_id
        )
    }

    fn stt_upstream_url(&self) -> String {
        format!(
            "wss://api.deepgram.com/v1/listen?model={}&encoding=linear16&sample_rate=16000",
            self.stt_model_id
        )
    }
}

/// One-shot HTTP fallback for TTS, used when the streaming upstream is down
/// at `generate` time. Talks to the same provider's batch synthesis endpoint.
pub struct HttpTtsFallback {
    http: Client,
    account_id: String,
    api_token: String,
    model_id: String,
}

impl HttpTtsFallback {
    pub fn new(account_id: String, api_token: String, model_id: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .expect("failed to build fallback HTTP client"),
            account_id,
            api_token,
            model_id,
        }
    }
}

#[async_trait]
impl TtsFallback for HttpTtsFallback {
    async fn synthesize(&self, text: &str, voice: &str) -> AdapterResult<Vec<u8>> {
        let response = self
            .http
            .post("https://api.deepgram.com/v1/speak")
            .bearer_auth(&self.api_token)
            .query(&[
                ("model", self.model_id.as_str()),
                ("account", self.account_id.as_str()),
                ("speaker", voice),
                ("encoding", "linear16"),
                ("sample_rate", "24000"),
            ])
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| AdapterError::UpstreamUnavailable(format!("fallback synthesis request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AdapterError::UpstreamUnavailable(format!(
                "fallback synthesis returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AdapterError::UpstreamUnavailable(format!("fallback synthesis body read failed: {e}")))
    }
}

/// Container for every wired service, plus the lazily-populated per-flavor
/// session registries. This is the single place session adapters are born.
#[derive(Clone)]
pub struct BootstrappedServices {
    pub config: AdapterConfig,
    pub sfu: Arc<dyn SfuClient>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub fallback: Arc<dyn TtsFallback>,
    pub cancel_token: CancellationToken,
    tts_sessions: Arc<DashMap<String, Arc<TtsAdapter>>>,
    stt_sessions: Arc<DashMap<String, Arc<SttAdapter>>>,
    video_sessions: Arc<DashMap<String, Arc<VideoAdapter>>>,
}

impl BootstrappedServices {
    fn durable_store(&self, session_name: &str) -> Arc<dyn DurableStore> {
        match &self.config.data_dir {
            Some(dir) => {
                let path = dir.join(session_name);
                match FileDurableStore::new(&path) {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        log::warn!("[Bootstrap] falling back to in-memory state for {session_name}: {e}");
                        Arc::new(InMemoryDurableStore::new())
                    }
                }
            }
            None => Arc::new(InMemoryDurableStore::new()),
        }
    }

    /// Returns the existing TTS adapter for `session_name`, creating and
    /// restoring it (plus spawning its alarm loop) on first access.
    pub async fn tts(&self, session_name: &str) -> Arc<TtsAdapter> {
        if let Some(existing) = self.tts_sessions.get(session_name) {
            return existing.clone();
        }
        let state = Arc::new(StateStore::new(self.durable_store(session_name), session_name));
        state.restore().await;
        let clients = Arc::new(ClientRegistry::new());
        wire_disconnect_cleanup(&clients, state.clone(), &self.spawner);
        let endpoint_base = format!("{}/tts", self.config.public_base_url);
        let adapter = TtsAdapter::new(
            session_name,
            state.clone(),
            clients,
            self.sfu.clone(),
            self.spawner.clone(),
            self.fallback.clone(),
            self.config.tts_upstream_url_template(),
            self.config.ai_api_token.clone(),
            endpoint_base,
        );
        spawn_alarm_loop(&self.spawner, state, {
            let adapter = adapter.clone();
            move |now| {
                let adapter = adapter.clone();
                async move { adapter.alarm(now).await }
            }
        });
        self.tts_sessions.insert(session_name.to_string(), adapter.clone());
        adapter
    }

    pub async fn stt(&self, session_name: &str) -> Arc<SttAdapter> {
        if let Some(existing) = self.stt_sessions.get(session_name) {
            return existing.clone();
        }
        let state = Arc::new(StateStore::new(self.durable_store(session_name), session_name));
        state.restore().await;
        let clients = Arc::new(ClientRegistry::new());
        wire_disconnect_cleanup(&clients, state.clone(), &self.spawner);
        let adapter = SttAdapter::new(
            session_name,
            state.clone(),
            clients,
            self.sfu.clone(),
            self.spawner.clone(),
            self.config.stt_upstream_url(),
            self.config.ai_api_token.clone(),
            self.config.public_base_url.clone(),
        );
        spawn_alarm_loop(&self.spawner, state, {
            let adapter = adapter.clone();
            move |now| {
                let adapter = adapter.clone();
                async move { adapter.alarm(now).await }
            }
        });
        self.stt_sessions.insert(session_name.to_string(), adapter.clone());
        adapter
    }

    pub async fn video(&self, session_name: &str) -> Arc<VideoAdapter> {
        if let Some(existing) = self.video_sessions.get(session_name) {
            return existing.clone();
        }
        let state = Arc::new(StateStore::new(self.durable_store(session_name), session_name));
        state.restore().await;
        let clients = Arc::new(ClientRegistry::new());
        wire_disconnect_cleanup(&clients, state.clone(), &self.spawner);
        let adapter = VideoAdapter::new(
            session_name,
            state.clone(),
            clients,
            self.sfu.clone(),
            self.config.public_base_url.clone(),
        );
        spawn_alarm_loop(&self.spawner, state, {
            let adapter = adapter.clone();
            move |now| {
                let adapter = adapter.clone();
                async move { adapter.alarm(now).await }
            }
        });
        self.video_sessions.insert(session_name.to_string(), adapter.clone());
        adapter
    }

    /// Tears down every variant adapter registered for `session_name`, if any.
    pub async fn destroy_session(&self, session_name: &str) {
        if let Some((_, adapter)) = self.tts_sessions.remove(session_name) {
            adapter.destroy().await;
        }
        if let Some((_, adapter)) = self.stt_sessions.remove(session_name) {
            adapter.destroy().await;
        }
        if let Some((_, adapter)) = self.video_sessions.remove(session_name) {
            adapter.destroy().await;
        }
    }

    /// Initiates graceful shutdown: cancels background work and force-closes
    /// every client socket across every live session.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown");
        self.cancel_token.cancel();
        let names: Vec<String> = self
            .tts_sessions
            .iter()
            .map(|e| e.key().clone())
            .chain(self.stt_sessions.iter().map(|e| e.key().clone()))
            .chain(self.video_sessions.iter().map(|e| e.key().clone()))
            .collect();
        for name in names {
            self.destroy_session(&name).await;
        }
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root where all services are instantiated and
/// wired together. Session adapters themselves are created lazily per
/// `<sid>` on first HTTP/WebSocket access (see [`BootstrappedServices::tts`]
/// and friends).
pub fn bootstrap_services(config: AdapterConfig) -> BootstrappedServices {
    let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
    let sfu: Arc<dyn SfuClient> = Arc::new(HttpSfuClient::new(
        config.sfu_base_url.clone(),
        config.sfu_app_id.clone(),
        config.sfu_bearer_token.clone(),
    ));
    let fallback: Arc<dyn TtsFallback> = Arc::new(HttpTtsFallback::new(
        config.ai_account_id.clone(),
        config.ai_api_token.clone(),
        config.tts_model_id.clone(),
    ));

    BootstrappedServices {
        config,
        sfu,
        spawner,
        fallback,
        cancel_token: CancellationToken::new(),
        tts_sessions: Arc::new(DashMap::new()),
        stt_sessions: Arc::new(DashMap::new()),
        video_sessions: Arc::new(DashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AdapterConfig {
        AdapterConfig {
            sfu_base_url: "https://sfu.example".into(),
            sfu_app_id: "app-1".into(),
            sfu_bearer_token: "sfu-token".into(),
            ai_account_id: "acct-1".into(),
            ai_api_token: "ai-token".into(),
            tts_model_id: "aura-asteria-en".into(),
            stt_model_id: "nova-2".into(),
            public_base_url: "wss://self.example".into(),
            data_dir: None,
        }
    }

    #[tokio::test]
    async fn tts_returns_the_same_adapter_for_repeat_calls() {
        let services = bootstrap_services(test_config());
        let a = services.tts("s1").await;
        let b = services.tts("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_session_names_get_distinct_adapters() {
        let services = bootstrap_services(test_config());
        let a = services.tts("s1").await;
        let b = services.tts("s2").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn destroy_session_removes_it_from_the_registry() {
        let services = bootstrap_services(test_config());
        let first = services.tts("s1").await;
        services.destroy_session("s1").await;
        let second = services.tts("s1").await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn client_disconnect_schedules_cleanup_deadline() {
        let services = bootstrap_services(test_config());
        let adapter = services.tts("s1").await;
        let (handle, _rx) = adapter.subscribe();
        assert!(adapter.state.snapshot().cleanup_deadline.is_none());

        drop(handle);
        // The write is spawned off the synchronous Drop; give it a turn.
        for _ in 0..50 {
            if adapter.state.snapshot().cleanup_deadline.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(adapter.state.snapshot().cleanup_deadline.is_some());
    }
}
