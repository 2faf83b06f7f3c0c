//! REST client for the SFU's session/track/adapter surface.
//!
//! Adapted from the exponential-backoff retry wrapper used around outbound
//! calls to a flaky peer: the same shape (fixed delay ladder, retry only on
//! transient failures, give up on anything else) now wraps JSON REST calls
//! instead of SOAP ones.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdapterError, AdapterResult};

const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// A track discovered after an SDP offer/answer exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredTrack {
    pub track_name: String,
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct AddTracksResult {
    pub sdp_answer: String,
    pub tracks: Vec<DiscoveredTrack>,
}

#[derive(Debug, Clone)]
pub struct PushTrackResult {
    pub session_id: String,
    pub adapter_id: String,
    pub json: Value,
}

#[derive(Debug, Clone)]
pub struct PullTrackResult {
    pub adapter_id: String,
    pub json: Value,
}

/// The SFU's REST surface, as the session adapters need it.
#[async_trait]
pub trait SfuClient: Send + Sync {
    async fn create_session(&self) -> AdapterResult<String>;

    /// `kind` filters discovered tracks to `"audio"` or `"video"`.
    async fn add_tracks_auto_discover(
        &self,
        session_id: &str,
        sdp: &str,
        kind: &str,
    ) -> AdapterResult<AddTracksResult>;

    async fn pull_remote_track_to_player(
        &self,
        player_session_id: &str,
        publisher_session_id: &str,
        track_name: &str,
        sdp: &str,
    ) -> AdapterResult<String>;

    async fn push_track_from_websocket(
        &self,
        track_name: &str,
        endpoint: &str,
    ) -> AdapterResult<PushTrackResult>;

    /// `output_codec` is `"pcm"` or `"jpeg"`.
    async fn pull_track_to_websocket(
        &self,
        session_id: &str,
        track_name: &str,
        endpoint: &str,
        output_codec: &str,
    ) -> AdapterResult<PullTrackResult>;

    /// Idempotent: a 503 with `tracks[0].errorCode == "adapter_not_found"`
    /// counts as success (the adapter is already gone).
    async fn close_websocket_adapter(&self, adapter_id: &str) -> AdapterResult<()>;
}

pub struct HttpSfuClient {
    http: Client,
    base_url: String,
    app_id: String,
    bearer_token: String,
}

impl HttpSfuClient {
    pub fn new(base_url: impl Into<String>, app_id: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            app_id: app_id.into(),
            bearer_token: bearer_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/apps/{}{}", self.base_url.trim_end_matches('/'), self.app_id, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.bearer_token)
    }

    async fn request_json(&self, builder: reqwest::RequestBuilder) -> AdapterResult<Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error("SFU request", &e))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        if status == StatusCode::SERVICE_UNAVAILABLE && is_adapter_not_found(&body) {
            return Ok(body);
        }

        if status.is_server_error() {
            return Err(AdapterError::UpstreamUnavailable(format!(
                "SFU returned {status}: {body}"
            )));
        }

        Err(AdapterError::SfuError(format!("SFU returned {status}: {body}")))
    }
}

fn is_adapter_not_found(body: &Value) -> bool {
    body.get("tracks")
        .and_then(|t| t.get(0))
        .and_then(|t| t.get("errorCode"))
        .and_then(Value::as_str)
        == Some("adapter_not_found")
}

fn classify_transport_error(action: &str, e: &reqwest::Error) -> AdapterError {
    AdapterError::UpstreamUnavailable(format!("{action} failed: {e}"))
}

async fn with_retry<T, F, Fut>(action: &str, mut operation: F) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let mut last_error = None;
    for (attempt, delay_ms) in std::iter::once(&0).chain(RETRY_DELAYS_MS.iter()).enumerate() {
        if attempt > 0 {
            log::info!("[Sfu] retrying {action} (attempt {}) after {delay_ms}ms", attempt + 1);
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
        }
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e @ AdapterError::UpstreamUnavailable(_)) => {
                log::warn!("[Sfu] {action} transient failure: {e}");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.expect("retry loop always sets last_error before exhausting attempts"))
}

#[async_trait]
impl SfuClient for HttpSfuClient {
    async fn create_session(&self) -> AdapterResult<String> {
        with_retry("create_session", || async {
            let body = self
                .request_json(self.authed(self.http.post(self.url("/sessions/new"))))
                .await?;
            body.get("sessionId")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| AdapterError::SfuError("missing sessionId in response".into()))
        })
        .await
    }

    async fn add_tracks_auto_discover(
        &self,
        session_id: &str,
        sdp: &str,
        kind: &str,
    ) -> AdapterResult<AddTracksResult> {
        with_retry("add_tracks_auto_discover", || async {
            let body = self
                .request_json(self.authed(
                    self.http
                        .post(self.url(&format!("/sessions/{session_id}/tracks/new")))
                        .json(&serde_json::json!({ "autoDiscover": true, "sessionDescription": { "type": "offer", "sdp": sdp } })),
                ))
                .await?;
            let sdp_answer = body
                .get("sessionDescription")
                .and_then(|s| s.get("sdp"))
                .and_then(Value::as_str)
                .ok_or_else(|| AdapterError::SfuError("missing sdp answer".into()))?
                .to_string();
            let tracks = body
                .get("tracks")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter(|t| t.get("kind").and_then(Value::as_str) == Some(kind))
                        .filter_map(|t| {
                            Some(DiscoveredTrack {
                                track_name: t.get("trackName")?.as_str()?.to_string(),
                                kind: kind.to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(AddTracksResult { sdp_answer, tracks })
        })
        .await
    }

    async fn pull_remote_track_to_player(
        &self,
        player_session_id: &str,
        publisher_session_id: &str,
        track_name: &str,
        sdp: &str,
    ) -> AdapterResult<String> {
        with_retry("pull_remote_track_to_player", || async {
            let body = self
                .request_json(self.authed(
                    self.http
                        .post(self.url(&format!("/sessions/{player_session_id}/tracks/new")))
                        .json(&serde_json::json!({
                            "tracks": [{ "location": "remote", "sessionId": publisher_session_id, "trackName": track_name }],
                            "sessionDescription": { "type": "offer", "sdp": sdp }
                        })),
                ))
                .await?;
            body.get("sessionDescription")
                .and_then(|s| s.get("sdp"))
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| AdapterError::SfuError("missing sdp answer".into()))
        })
        .await
    }

    async fn push_track_from_websocket(
        &self,
        track_name: &str,
        endpoint: &str,
    ) -> AdapterResult<PushTrackResult> {
        with_retry("push_track_from_websocket", || async {
            let body = self
                .request_json(self.authed(self.http.post(self.url("/websocket/push")).json(&serde_json::json!({
                    "trackName": track_name,
                    "websocket": endpoint,
                    "inputCodec": "pcm",
                    "mode": "buffer",
                }))))
                .await?;
            Ok(PushTrackResult {
                session_id: body
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                adapter_id: body
                    .get("adapterId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::SfuError("missing adapterId".into()))?
                    .to_string(),
                json: body,
            })
        })
        .await
    }

    async fn pull_track_to_websocket(
        &self,
        session_id: &str,
        track_name: &str,
        endpoint: &str,
        output_codec: &str,
    ) -> AdapterResult<PullTrackResult> {
        with_retry("pull_track_to_websocket", || async {
            let body = self
                .request_json(self.authed(self.http.post(self.url("/websocket/pull")).json(&serde_json::json!({
                    "sessionId": session_id,
                    "trackName": track_name,
                    "websocket": endpoint,
                    "outputCodec": output_codec,
                }))))
                .await?;
            Ok(PullTrackResult {
                adapter_id: body
                    .get("adapterId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::SfuError("missing adapterId".into()))?
                    .to_string(),
                json: body,
            })
        })
        .await
    }

    async fn close_websocket_adapter(&self, adapter_id: &str) -> AdapterResult<()> {
        with_retry("close_websocket_adapter", || async {
            self.request_json(self.authed(self.http.delete(self.url(&format!("/websocket/{adapter_id}")))))
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_adapter_not_found_from_tracks_array() {
        let body = serde_json::json!({ "tracks": [{ "errorCode": "adapter_not_found" }] });
        assert!(is_adapter_not_found(&body));
    }

    #[test]
    fn does_not_misdetect_unrelated_error_codes() {
        let body = serde_json::json!({ "tracks": [{ "errorCode": "track_not_found" }] });
        assert!(!is_adapter_not_found(&body));
    }

    #[tokio::test]
    async fn with_retry_gives_up_immediately_on_non_transient_error() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: AdapterResult<()> = with_retry("op", || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AdapterError::BadPayload("nope".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_errors_up_to_the_delay_ladder() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: AdapterResult<()> = with_retry("op", || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AdapterError::UpstreamUnavailable("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), RETRY_DELAYS_MS.len() + 1);
    }
}
