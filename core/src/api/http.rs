//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to session adapters for business logic.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::ws::{subscribe_ws, viewer_ws, video_sfu_subscribe_ws, stt_sfu_subscribe_ws, transcription_stream_ws};
use crate::api::AppState;
use crate::error::AdapterResult;
use crate::protocol_constants::SERVICE_ID;

#[derive(Deserialize)]
struct PublishRequest {
    speaker: String,
}

#[derive(Deserialize)]
struct ConnectRequest {
    #[serde(rename = "sessionDescription")]
    session_description: String,
}

#[derive(Deserialize)]
struct GenerateRequest {
    text: String,
}

/// Creates the Axum router with every session endpoint from the external interface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/{sid}/debug/state", get(debug_state))
        .route("/{sid}", delete(destroy_session))
        .route("/{sid}/publisher", get(publisher_ui))
        .route("/{sid}/player", get(player_ui))
        .route("/{sid}/publish", post(tts_publish))
        .route("/{sid}/unpublish", post(tts_unpublish))
        .route("/{sid}/connect", post(tts_connect))
        .route("/{sid}/generate", post(tts_generate))
        .route("/{sid}/subscribe", get(subscribe_ws))
        .route("/{sid}/stt/connect", post(stt_connect))
        .route("/{sid}/stt/start-forwarding", post(stt_start_forwarding))
        .route("/{sid}/stt/stop-forwarding", post(stt_stop_forwarding))
        .route("/{sid}/stt/reconnect-upstream", post(stt_reconnect_upstream))
        .route("/{sid}/stt/sfu-subscribe", get(stt_sfu_subscribe_ws))
        .route("/{sid}/stt/transcription-stream", get(transcription_stream_ws))
        .route("/{sid}/video/connect", post(video_connect))
        .route("/{sid}/video/start-forwarding", post(video_start_forwarding))
        .route("/{sid}/video/stop-forwarding", post(video_stop_forwarding))
        .route("/{sid}/video/sfu-subscribe", get(video_sfu_subscribe_ws))
        .route("/{sid}/video/viewer", get(viewer_ws))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": SERVICE_ID }))
}

async fn debug_state(Path(sid): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    let tts = state.services.tts(&sid).await.state.snapshot();
    let stt = state.services.stt(&sid).await.state.snapshot();
    let video = state.services.video(&sid).await.state.snapshot();
    Json(json!({ "tts": tts, "stt": stt, "video": video }))
}

async fn destroy_session(Path(sid): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    state.services.destroy_session(&sid).await;
    StatusCode::ACCEPTED
}

async fn publisher_ui() -> impl IntoResponse {
    Html(include_str!("../../assets/publisher.html"))
}

async fn player_ui() -> impl IntoResponse {
    Html(include_str!("../../assets/player.html"))
}

fn ok_json<T: serde::Serialize>(body: T) -> Response {
    Json(body).into_response()
}

async fn tts_publish(
    Path(sid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<PublishRequest>,
) -> AdapterResult<Response> {
    let adapter = state.services.tts(&sid).await;
    let json = adapter.publish(payload.speaker).await?;
    Ok(ok_json(json))
}

async fn tts_unpublish(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.tts(&sid).await;
    adapter.unpublish().await?;
    Ok(ok_json(json!({ "ok": true })))
}

async fn tts_connect(
    Path(sid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ConnectRequest>,
) -> AdapterResult<Response> {
    let adapter = state.services.tts(&sid).await;
    let answer = adapter.connect(payload.session_description).await?;
    Ok(ok_json(json!({ "sessionDescription": answer })))
}

async fn tts_generate(
    Path(sid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> impl IntoResponse {
    let adapter = state.services.tts(&sid).await;
    adapter.generate(payload.text);
    StatusCode::ACCEPTED
}

async fn stt_connect(
    Path(sid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ConnectRequest>,
) -> AdapterResult<Response> {
    let adapter = state.services.stt(&sid).await;
    let answer = adapter.connect(payload.session_description).await?;
    Ok(ok_json(json!({ "sessionDescription": answer })))
}

async fn stt_start_forwarding(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.stt(&sid).await;
    adapter.start_forwarding().await?;
    Ok(ok_json(json!({ "ok": true })))
}

async fn stt_stop_forwarding(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.stt(&sid).await;
    adapter.stop_forwarding().await?;
    Ok(ok_json(json!({ "ok": true })))
}

async fn stt_reconnect_upstream(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.stt(&sid).await;
    adapter.reconnect_upstream().await?;
    Ok(ok_json(json!({ "ok": true })))
}

async fn video_connect(
    Path(sid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ConnectRequest>,
) -> AdapterResult<Response> {
    let adapter = state.services.video(&sid).await;
    let answer = adapter.connect(payload.session_description).await?;
    Ok(ok_json(json!({ "sessionDescription": answer })))
}

async fn video_start_forwarding(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.video(&sid).await;
    adapter.start_forwarding().await?;
    Ok(ok_json(json!({ "ok": true })))
}

async fn video_stop_forwarding(Path(sid): Path<String>, State(state): State<AppState>) -> AdapterResult<Response> {
    let adapter = state.services.video(&sid).await;
    adapter.stop_forwarding().await?;
    Ok(ok_json(json!({ "ok": true })))
}
