//! WebSocket handlers for SFU-side media sockets and client subscriptions.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::client_registry::ClientHandle;

/// Drains `rx` to the socket's write half and forwards inbound binary
/// frames to `on_binary`, until the socket closes or `handle` is cancelled
/// (superseded or force-closed by destroy).
async fn drain_outbound_only(socket: WebSocket, handle: ClientHandle, mut rx: mpsc::UnboundedReceiver<Message>) {
    let (mut sender, mut receiver) = socket.split();
    let cancel = handle.cancel_token.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => if sender.send(msg).await.is_err() { break },
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    drop(handle);
}

pub async fn subscribe_ws(Path(sid): Path<String>, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let adapter = state.services.tts(&sid).await;
    ws.on_upgrade(move |socket| async move {
        let (handle, rx) = adapter.subscribe();
        drain_outbound_only(socket, handle, rx).await;
    })
}

pub async fn viewer_ws(Path(sid): Path<String>, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let adapter = state.services.video(&sid).await;
    ws.on_upgrade(move |socket| async move {
        let (handle, rx) = adapter.viewer();
        drain_outbound_only(socket, handle, rx).await;
    })
}

pub async fn transcription_stream_ws(Path(sid): Path<String>, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let adapter = state.services.stt(&sid).await;
    ws.on_upgrade(move |socket| async move {
        let (handle, rx) = adapter.transcription_stream();
        drain_outbound_only(socket, handle, rx).await;
    })
}

pub async fn stt_sfu_subscribe_ws(Path(sid): Path<String>, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let adapter = state.services.stt(&sid).await;
    ws.on_upgrade(move |socket| async move {
        let (handle, mut rx) = adapter.sfu_subscribe();
        let (mut sender, mut receiver) = socket.split();
        let cancel = handle.cancel_token.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outbound = rx.recv() => {
                    match outbound {
                        Some(msg) => if sender.send(msg).await.is_err() { break },
                        None => break,
                    }
                }
                inbound = receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => adapter.ingest_audio(&data),
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    }
                }
            }
        }
        drop(handle);
    })
}

pub async fn video_sfu_subscribe_ws(Path(sid): Path<String>, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let adapter = state.services.video(&sid).await;
    ws.on_upgrade(move |socket| async move {
        let (handle, mut rx) = adapter.sfu_subscribe();
        let (mut sender, mut receiver) = socket.split();
        let cancel = handle.cancel_token.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outbound = rx.recv() => {
                    match outbound {
                        Some(msg) => if sender.send(msg).await.is_err() { break },
                        None => break,
                    }
                }
                inbound = receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => adapter.ingest_frame(&data).await,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    }
                }
            }
        }
        drop(handle);
    })
}
