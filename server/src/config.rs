//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mediaplane_core::AdapterConfig;
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to. 0 selects the first free port in
    /// `49400..=49410`.
    /// Override: `MEDIAPLANE_BIND_PORT`
    pub bind_port: u16,

    /// Base URL of the SFU's REST control surface.
    /// Override: `MEDIAPLANE_SFU_BASE_URL`
    pub sfu_base_url: String,

    /// SFU application id used when creating sessions.
    /// Override: `MEDIAPLANE_SFU_APP_ID`
    pub sfu_app_id: String,

    /// Bearer token authenticating requests to the SFU.
    /// Override: `MEDIAPLANE_SFU_BEARER_TOKEN`
    pub sfu_bearer_token: String,

    /// Account id for the upstream AI provider (TTS/STT).
    /// Override: `MEDIAPLANE_AI_ACCOUNT_ID`
    pub ai_account_id: String,

    /// API token for the upstream AI provider.
    /// Override: `MEDIAPLANE_AI_API_TOKEN`
    pub ai_api_token: String,

    /// Model id used for text-to-speech synthesis.
    /// Override: `MEDIAPLANE_TTS_MODEL_ID`
    pub tts_model_id: String,

    /// Model id used for speech-to-text transcription.
    /// Override: `MEDIAPLANE_STT_MODEL_ID`
    pub stt_model_id: String,

    /// Base URL this server is reachable at, used when registering
    /// SFU-side callback endpoints.
    /// Override: `MEDIAPLANE_PUBLIC_BASE_URL`
    pub public_base_url: String,

    /// Directory for durable per-session state. When unset, state lives
    /// only in memory and does not survive a restart.
    /// Override: `MEDIAPLANE_DATA_DIR`
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 49400,
            sfu_base_url: String::new(),
            sfu_app_id: String::new(),
            sfu_bearer_token: String::new(),
            ai_account_id: String::new(),
            ai_api_token: String::new(),
            tts_model_id: "aura-asteria-en".into(),
            stt_model_id: "nova-2".into(),
            public_base_url: String::new(),
            data_dir: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEDIAPLANE_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_SFU_BASE_URL") {
            self.sfu_base_url = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_SFU_APP_ID") {
            self.sfu_app_id = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_SFU_BEARER_TOKEN") {
            self.sfu_bearer_token = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_AI_ACCOUNT_ID") {
            self.ai_account_id = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_AI_API_TOKEN") {
            self.ai_api_token = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_TTS_MODEL_ID") {
            self.tts_model_id = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_STT_MODEL_ID") {
            self.stt_model_id = val;
        }
        if let Ok(val) = std::env::var("MEDIAPLANE_PUBLIC_BASE_URL") {
            self.public_base_url = val;
        }
        // Note: MEDIAPLANE_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to the core library's bootstrap configuration.
    pub fn to_adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            sfu_base_url: self.sfu_base_url.clone(),
            sfu_app_id: self.sfu_app_id.clone(),
            sfu_bearer_token: self.sfu_bearer_token.clone(),
            ai_account_id: self.ai_account_id.clone(),
            ai_api_token: self.ai_api_token.clone(),
            tts_model_id: self.tts_model_id.clone(),
            stt_model_id: self.stt_model_id.clone(),
            public_base_url: self.public_base_url.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}
