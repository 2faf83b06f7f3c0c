//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the external contracts (SFU wire packet, AI
//! provider handshakes, send-queue batching) and changing them would break
//! protocol compliance or the documented timing behavior.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Audio format
// ─────────────────────────────────────────────────────────────────────────────

/// SFU-side sample rate: 48 kHz stereo PCM16.
pub const SFU_SAMPLE_RATE_HZ: u32 = 48_000;
pub const SFU_CHANNELS: u16 = 2;

/// TTS upstream sample rate: 24 kHz mono PCM16.
pub const TTS_UPSTREAM_SAMPLE_RATE_HZ: u32 = 24_000;

/// STT upstream sample rate: 16 kHz mono PCM16.
pub const STT_UPSTREAM_SAMPLE_RATE_HZ: u32 = 16_000;

/// Maximum chunk size used when fanning out encoded packets to clients.
pub const MAX_FANOUT_CHUNK_BYTES: usize = 16 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// SendQueue (STT hot path)
// ─────────────────────────────────────────────────────────────────────────────

pub const SEND_QUEUE_MIN_BATCH_BYTES: usize = 3_200;
pub const SEND_QUEUE_MAX_BATCH_BYTES: usize = 16_000;
pub const SEND_QUEUE_MAX_QUEUE_BYTES: usize = 2 * 1024 * 1024;
pub const SEND_QUEUE_MAX_BATCHES_PER_TURN: usize = 8;
pub const SEND_QUEUE_MAX_SLICE: Duration = Duration::from_millis(10);

// ─────────────────────────────────────────────────────────────────────────────
// Upstream link / reconnect
// ─────────────────────────────────────────────────────────────────────────────

/// Hard timeout waiting for the upstream WebSocket to open.
pub const UPSTREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff: `min(base * 2^attempts, cap)`.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Minimum gap enforced between successive reschedules of the same deadline
/// field, to avoid churn from rapid back-to-back writes.
pub const DEADLINE_CHURN_GUARD: Duration = Duration::from_millis(250);

/// Churn guard specifically for `inactivityDeadline`/`cleanupDeadline`
/// (never shortened, never re-armed within this window).
pub const INACTIVITY_CHURN_GUARD: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts (§5)
// ─────────────────────────────────────────────────────────────────────────────

/// Default inactivity timeout before a session tears itself down.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Grace period after the last client disconnects before cleanup runs.
pub const CLEANUP_GRACE: Duration = Duration::from_millis(100);

/// Interval between KeepAlive heartbeats during the STT pre-forwarding window.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Debug no-client grace window used by `reconnect-upstream`.
pub const DEBUG_NO_CLIENT_GRACE: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Late-joiner retention
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the transcription ring buffer retained for late-joining clients.
pub const TRANSCRIPTION_RING_CAPACITY: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier used on the health endpoint.
pub const SERVICE_ID: &str = "media-control-plane";

/// Timeout for SFU REST / AI provider HTTP calls.
pub const HTTP_TIMEOUT_SECS: u64 = 10;
