//! Protocol constants for xstream.
//!
//! Wire values in this module are fixed by the protocol and MUST NOT be
//! changed; timing values are defaults that the config structs start from.

use std::time::Duration;

// =============================================================================
// RECORD LAYER (TLS-shaped wrapper)
// =============================================================================

/// Record header size: type (1) + version (2) + length (2).
pub const RECORD_HEADER_SIZE: usize = 5;

/// Record type carrying an encrypted connection frame (TLS application data).
pub const RECORD_TYPE_FRAME: u8 = 0x17;

/// Record type carrying encrypted connection control (TLS alert).
pub const RECORD_TYPE_CONTROL: u8 = 0x15;

/// Record type used by the hello exchange (TLS handshake).
pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Record version bytes (TLS 1.2).
pub const RECORD_VERSION: u16 = 0x0303;

/// Largest record body representable by the 16-bit length field.
pub const MAX_RECORD_BODY: usize = 0xffff;

/// ChangeCipherSpec wrapper written once at the start of every data phase.
pub const DATA_PHASE_PREFIX: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

// =============================================================================
// CONNECTION CONTROL CODES (record type 0x15)
// =============================================================================

/// Liveness ping.
pub const CONN_PING: u8 = 0x01;

/// Answer to a ping.
pub const CONN_PING_ACK: u8 = 0x02;

/// Third leg of the ping, lets the answering side sample RTT too.
pub const CONN_PING_ACK_ACK: u8 = 0x03;

/// Graceful close request.
pub const CONN_CLOSE: u8 = 0x04;

/// Graceful close acknowledgment.
pub const CONN_CLOSE_ACK: u8 = 0x05;

// =============================================================================
// FRAME ACTIONS
// =============================================================================

/// Frame carries a nested StreamFrame.
pub const ACTION_STREAM: u8 = 0;

/// Cumulative (and selective) acknowledgment.
pub const ACTION_ACK: u8 = 1;

/// Request to resend a list of indices.
pub const ACTION_RESEND: u8 = 2;

/// Start of a new index epoch.
pub const ACTION_INDEX_RESET: u8 = 3;

/// Acknowledgment of a new index epoch.
pub const ACTION_INDEX_RESET_ACK: u8 = 4;

/// RTT stamp.
pub const ACTION_TTL: u8 = 5;

/// RTT stamp echo.
pub const ACTION_TTL_ACK: u8 = 6;

// =============================================================================
// STREAM FRAME FLAGS
// =============================================================================

/// Frame carries payload bytes.
pub const FLAG_DATA: u8 = 0x01;

/// First frame of a stream.
pub const FLAG_OPEN: u8 = 0x02;

/// Stream close (and close acknowledgment).
pub const FLAG_CLOSE: u8 = 0x04;

/// Stream is scheduled at low priority.
pub const FLAG_NONE_PRIORITY: u8 = 0x10;

/// Stream skips per-stream reordering.
pub const FLAG_CAPPED: u8 = 0x20;

/// Stream never idles out.
pub const FLAG_NONE_EXPIRY: u8 = 0x40;

// =============================================================================
// SIZES
// =============================================================================

/// Frame header: action (1) + index (4) + ack (4).
pub const FRAME_HEADER_SIZE: usize = 9;

/// StreamFrame header: stream id (2) + flag (1) + index (4).
pub const STREAM_FRAME_HEADER_SIZE: usize = 7;

/// Default maximum segment size for stream payloads.
pub const DEFAULT_MSS: usize = 1400;

/// Smallest MSS accepted during negotiation.
pub const MIN_MSS: usize = 256;

/// Largest MSS whose stream frames still fit one encrypted record.
pub const MAX_MSS: usize =
    MAX_RECORD_BODY - FRAME_HEADER_SIZE - STREAM_FRAME_HEADER_SIZE - AEAD_TAG_SIZE;

/// Reserved id of the session control stream.
pub const CONTROL_STREAM_ID: u16 = 0;

// =============================================================================
// INDEX SPACE
// =============================================================================

/// Index reserved for unordered / control frames.
pub const UNORDERED_INDEX: u32 = 0;

/// Low 31 bits of a wire index: the index within its epoch.
pub const INDEX_MASK: u32 = 0x7fff_ffff;

/// High bit of a wire index or ack: parity of the index epoch.
pub const INDEX_EPOCH_BIT: u32 = 0x8000_0000;

/// Default 31-bit boundary that triggers an INDEX_RESET.
pub const DEFAULT_INDEX_LIMIT: u32 = INDEX_MASK;

/// Inbound indices further than this past `recv_index` are dropped.
pub const MAX_RECV_WINDOW: u32 = 1 << 20;

// =============================================================================
// TIMING - CENTER
// =============================================================================

/// Floor of the RTT estimate.
pub const MIN_TTL: Duration = Duration::from_millis(50);

/// RTT estimate before the first sample.
pub const INITIAL_TTL: Duration = Duration::from_millis(300);

/// Floor of the retransmission timeout.
pub const RESEND_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);

/// Retries of a single frame before the session is torn down.
pub const MAX_SEND_RETRIES: u32 = 60;

/// Cadence of the low-frequency ACK control frame.
pub const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the gap scan that emits RESEND requests.
pub const RESEND_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Gap scanning is skipped while the RTT estimate exceeds this.
pub const RESEND_SCAN_MAX_TTL: Duration = Duration::from_millis(1500);

/// Base interval between RTT stamps.
pub const TTL_STAMP_INTERVAL: Duration = Duration::from_secs(15);

/// Bytes written since the last stamp that make the next stamp come early.
pub const TTL_STAMP_BURST_BYTES: u64 = 4 * 1024 * 1024;

/// Frames delivered synchronously before yielding to the next tick.
pub const DRAIN_BATCH: usize = 128;

/// Cadence of the ready-stream re-sort.
pub const RESORT_INTERVAL: Duration = Duration::from_secs(1);

/// In-flight siblings requeued on a retransmission timeout.
pub const RESEND_REQUEUE_BATCH: usize = 32;

/// Indices listed in one selective ACK.
pub const MAX_SACK_INDICES: usize = 64;

// =============================================================================
// TIMING - STREAM
// =============================================================================

/// Default idle expiry of a stream.
pub const STREAM_EXPIRY: Duration = Duration::from_secs(900);

/// Priority decays to zero after this long without progress.
pub const STREAM_DECAY_WINDOW: Duration = Duration::from_secs(30);

/// Score factor while frames pulled from a stream are still being served.
pub const STREAM_ATTEMPT_DECAY: f64 = 0.5;

/// Wait for the peer's CLOSE before finalizing a stream.
pub const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// TIMING - CONNECTION
// =============================================================================

/// Send a ping once the connection has been quiet this long.
pub const PING_IDLE: Duration = Duration::from_secs(15);

/// Close the connection if the ping is not answered in this window.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Force-close a connection whose CLOSE is not acknowledged in this window.
pub const CONNECTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Base lifetime of a connection before rotation.
pub const CONNECTION_EXPIRY_TIME: Duration = Duration::from_secs(300);

/// Base data volume of a connection before rotation.
pub const CONNECTION_EXPIRY_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// TIMING - SESSION
// =============================================================================

/// Grace period of a session that lost every connection.
pub const SESSION_SUSPEND_GRACE: Duration = Duration::from_secs(60);

/// A client session closes if the server never confirms it within this.
pub const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between key exchanges.
pub const KEY_EXCHANGE_INTERVAL: Duration = Duration::from_secs(1800);

/// Key exchange is deferred while the RTT estimate exceeds this.
pub const KEY_EXCHANGE_MAX_TTL: Duration = Duration::from_secs(2);

/// Give up on an unanswered key exchange after this.
pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Persisted sessions older than this require a full handshake.
pub const SESSION_RECORD_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Accepted clock skew of a hello timestamp.
pub const HELLO_MAX_SKEW: Duration = Duration::from_secs(300);

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Protocol marker at the start of every hello.
pub const PROTOCOL_MARKER: [u8; 4] = *b"XSTM";

/// Session id size.
pub const SESSION_ID_SIZE: usize = 8;

/// Session auth key size.
pub const AUTH_KEY_SIZE: usize = 16;

/// Symmetric key size.
pub const KEY_SIZE: usize = 32;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Hello signature size (BLAKE2s-256 MAC).
pub const SIGNATURE_SIZE: usize = 32;

/// Poly1305 tag size.
pub const AEAD_TAG_SIZE: usize = 16;
