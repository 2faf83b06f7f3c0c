//! WebSocket link to the AI provider: bearer-authenticated upgrade, message
//! dispatch, and dedup'd (re)connection.
//!
//! Reconnect *scheduling* (attempt counters, backoff deadlines) is session
//! state owned by `state_store::StateStore`; this module only establishes
//! the socket and notifies the session when it closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::dedup_connector::{DedupConnectError, DedupedConnector};
use crate::protocol_constants::UPSTREAM_OPEN_TIMEOUT;
use crate::runtime::TaskSpawner;

/// Variant-specific handling of frames received from the upstream link.
#[async_trait]
pub trait UpstreamDispatch: Send + Sync {
    async fn on_text(&self, text: String);
    async fn on_binary(&self, data: Bytes);
    /// Invoked once, from the read loop, when the socket closes for any reason.
    async fn on_close(&self);
}

/// A live link: an outbound channel into the write loop, plus a flag the
/// dedup connector's `is_open` check reads.
pub struct LinkHandle {
    outbound: tokio::sync::mpsc::UnboundedSender<WsMessage>,
    open: Arc<AtomicBool>,
}

impl LinkHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Establishes and maintains the WebSocket to the AI provider.
pub struct UpstreamMediaLink {
    url: RwLock<String>,
    bearer_token: String,
    dispatch: Arc<dyn UpstreamDispatch>,
    spawner: Arc<dyn TaskSpawner>,
    connector: DedupedConnector<Arc<LinkHandle>>,
}

impl UpstreamMediaLink {
    pub fn new(
        url: impl Into<String>,
        bearer_token: impl Into<String>,
        dispatch: Arc<dyn UpstreamDispatch>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            url: RwLock::new(url.into()),
            bearer_token: bearer_token.into(),
            dispatch,
            spawner,
            connector: DedupedConnector::new(),
        }
    }

    /// Replaces the connect URL used by the next `ensure_open()`. Callers
    /// must set this before the first connect attempt that needs it (e.g.
    /// once a TTS voice is known); it does not affect an already-open link.
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }

    pub fn is_open(&self) -> bool {
        self.connector.current().map(|h| h.is_open()).unwrap_or(false)
    }

    /// Ensures the link is open, deduplicating concurrent callers (P5). On
    /// success, message handlers are already installed and dispatching.
    pub async fn ensure_open(&self) -> Result<(), DedupConnectError> {
        let url = self.url.read().clone();
        let token = self.bearer_token.clone();
        let dispatch = self.dispatch.clone();
        let spawner = self.spawner.clone();
        self.connector
            .connect(
                |handle| handle.is_open(),
                move || async move { open_link(url, token, dispatch, spawner).await },
            )
            .await?;
        Ok(())
    }

    /// Marks the link disconnected without waiting for the read loop to
    /// notice; used when the session is tearing down explicitly.
    pub fn mark_disconnected(&self) {
        if let Some(handle) = self.connector.current() {
            handle.open.store(false, Ordering::SeqCst);
        }
        self.connector.mark_disconnected();
    }

    pub async fn send_text(&self, text: String) -> bool {
        match self.connector.current() {
            Some(handle) if handle.is_open() => handle.outbound.send(WsMessage::Text(text)).is_ok(),
            _ => false,
        }
    }

    pub async fn send_binary(&self, data: Bytes) -> bool {
        match self.connector.current() {
            Some(handle) if handle.is_open() => {
                handle.outbound.send(WsMessage::Binary(data.to_vec())).is_ok()
            }
            _ => false,
        }
    }
}

async fn open_link(
    url: String,
    bearer_token: String,
    dispatch: Arc<dyn UpstreamDispatch>,
    spawner: Arc<dyn TaskSpawner>,
) -> Result<Arc<LinkHandle>, DedupConnectError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| DedupConnectError::from(format!("invalid upstream url: {e}")))?;
    let auth_value = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
        .map_err(|e| DedupConnectError::from(format!("invalid bearer token: {e}")))?;
    request.headers_mut().insert("Authorization", auth_value);

    let connect_fut = tokio_tungstenite::connect_async(request);
    let (stream, _response) = tokio::time::timeout(UPSTREAM_OPEN_TIMEOUT, connect_fut)
        .await
        .map_err(|_| DedupConnectError::from("upstream open timed out".to_string()))?
        .map_err(|e| DedupConnectError::from(format!("upstream connect failed: {e}")))?;

    log::info!("[Upstream] connected");

    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WsMessage>();
    let open = Arc::new(AtomicBool::new(true));

    spawner.spawn_boxed(Box::pin(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    }));

    let open_for_reader = open.clone();
    spawner.spawn_boxed(Box::pin(async move {
        while let Some(next) = read.next().await {
            match next {
                Ok(WsMessage::Text(text)) => dispatch.on_text(text).await,
                Ok(WsMessage::Binary(data)) => dispatch.on_binary(Bytes::from(data)).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[Upstream] read error: {e}");
                    break;
                }
            }
        }
        open_for_reader.store(false, Ordering::SeqCst);
        dispatch.on_close().await;
        log::info!("[Upstream] closed");
    }));

    Ok(Arc::new(LinkHandle { outbound: tx, open }))
}

/// Exponential backoff per the upstream reconnect contract: `min(1000 *
/// 2^attempts, 30_000)` milliseconds.
pub fn reconnect_delay_ms(attempts: u32) -> u64 {
    let base = crate::protocol_constants::RECONNECT_BASE_DELAY_MS;
    let max = crate::protocol_constants::RECONNECT_MAX_DELAY_MS;
    base.saturating_mul(1u64 << attempts.min(20)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_follows_exponential_backoff_with_cap() {
        assert_eq!(reconnect_delay_ms(0), 1_000);
        assert_eq!(reconnect_delay_ms(1), 2_000);
        assert_eq!(reconnect_delay_ms(2), 4_000);
        assert_eq!(reconnect_delay_ms(5), 30_000, "must cap at MAX_RECONNECT delay");
        assert_eq!(reconnect_delay_ms(30), 30_000, "must not overflow at high attempt counts");
    }
}
