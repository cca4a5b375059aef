//! Periodic session key exchange.
//!
//! The client starts an exchange every `interval`:
//!
//! ```text
//! client                          server
//!   | -- Start { seq, pub_c } -->   |  derive + commit new key
//!   | <-- Ack { seq, pub_s } ----   |
//!   |  derive + commit new key      |
//!   | -- Confirm { seq, mac } -->   |  verify mac
//! ```
//!
//! The new session key salts the record keys of connections forked after
//! the exchange; connections already up keep their keys. Both sides commit
//! before the last message they send, so a fork racing the confirm still
//! agrees on the key. Starting is deferred while the path TTL is above
//! `max_ttl`.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::kdf;
use super::keys::{EphemeralKeypair, Role, SessionKey};
use crate::core::{
    CryptoError, KEY_EXCHANGE_INTERVAL, KEY_EXCHANGE_MAX_TTL, KEY_EXCHANGE_TIMEOUT,
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};

const CONFIRM_LABEL: &[u8] = b"xstream v1 rekey confirm";

/// How long a start deferred by a slow path waits before trying again.
const DEFER_STEP: Duration = Duration::from_secs(10);

/// Messages of the exchange, carried on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RekeyMessage {
    /// Client proposes a new ephemeral key.
    Start {
        /// Exchange sequence number.
        seq: u32,
        /// Client ephemeral public key.
        public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Server answers with its ephemeral key.
    Ack {
        /// Exchange sequence number.
        seq: u32,
        /// Server ephemeral public key.
        public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Client proves it derived the same key.
    Confirm {
        /// Exchange sequence number.
        seq: u32,
        /// MAC under the new key.
        mac: [u8; SIGNATURE_SIZE],
    },
}

impl RekeyMessage {
    /// Sequence number the message belongs to.
    pub fn seq(&self) -> u32 {
        match self {
            RekeyMessage::Start { seq, .. }
            | RekeyMessage::Ack { seq, .. }
            | RekeyMessage::Confirm { seq, .. } => *seq,
        }
    }
}

/// Result of feeding one message to a [`KeyExchange`].
#[derive(Debug, Default)]
pub struct RekeyStep {
    /// Message to send back, if any.
    pub reply: Option<RekeyMessage>,
    /// New session key to install now.
    pub new_key: Option<SessionKey>,
    /// Exchange finished on this side.
    pub completed: bool,
}

/// Timing of the key exchange.
#[derive(Debug, Clone)]
pub struct KeyExchangeConfig {
    /// Time between exchanges.
    pub interval: Duration,
    /// Starting is deferred while the TTL is above this.
    pub max_ttl: Duration,
    /// An exchange not finished within this is abandoned.
    pub timeout: Duration,
}

impl Default for KeyExchangeConfig {
    fn default() -> Self {
        Self {
            interval: KEY_EXCHANGE_INTERVAL,
            max_ttl: KEY_EXCHANGE_MAX_TTL,
            timeout: KEY_EXCHANGE_TIMEOUT,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    /// Client sent Start.
    Started {
        seq: u32,
        keypair: EphemeralKeypair,
        at: Instant,
    },
    /// Server sent Ack and committed `key`.
    Acked { seq: u32, key: SessionKey, at: Instant },
}

/// Key exchange state machine of one session.
#[derive(Debug)]
pub struct KeyExchange {
    role: Role,
    config: KeyExchangeConfig,
    seq: u32,
    phase: Phase,
    next_start: Instant,
    completed: u32,
}

impl KeyExchange {
    /// Create the state machine; the first exchange is due one interval
    /// from `now`.
    pub fn new(role: Role, config: KeyExchangeConfig, now: Instant) -> Self {
        let next_start = now + config.interval;
        Self {
            role,
            config,
            seq: 0,
            phase: Phase::Idle,
            next_start,
            completed: 0,
        }
    }

    /// Last sequence number used or seen.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Number of exchanges completed on this side.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// No exchange in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// Start an exchange if one is due. Client only.
    pub fn poll_start(&mut self, now: Instant, ttl: Duration) -> Option<RekeyMessage> {
        if self.role != Role::Client || !self.is_idle() || now < self.next_start {
            return None;
        }
        if ttl > self.config.max_ttl {
            debug!(ttl_ms = ttl.as_millis() as u64, "key exchange deferred");
            self.next_start = now + DEFER_STEP;
            return None;
        }

        self.seq = self.seq.wrapping_add(1);
        let keypair = EphemeralKeypair::generate();
        let public = keypair.public_key();
        debug!(seq = self.seq, "key exchange started");
        self.phase = Phase::Started {
            seq: self.seq,
            keypair,
            at: now,
        };
        Some(RekeyMessage::Start {
            seq: self.seq,
            public,
        })
    }

    /// Feed one received message. `current` is the session key in use.
    ///
    /// Messages for a stale or unknown sequence number are ignored.
    pub fn handle(
        &mut self,
        msg: RekeyMessage,
        current: &SessionKey,
        now: Instant,
    ) -> Result<RekeyStep, CryptoError> {
        match msg {
            RekeyMessage::Start { seq, public } => {
                if self.role != Role::Server || seq <= self.seq {
                    debug!(seq, last = self.seq, "ignoring key exchange start");
                    return Ok(RekeyStep::default());
                }
                self.seq = seq;
                let keypair = EphemeralKeypair::generate();
                let shared = keypair.diffie_hellman(&public);
                let key = kdf::rekey(current, &shared, seq)?;
                self.phase = Phase::Acked {
                    seq,
                    key: key.clone(),
                    at: now,
                };
                Ok(RekeyStep {
                    reply: Some(RekeyMessage::Ack {
                        seq,
                        public: keypair.public_key(),
                    }),
                    new_key: Some(key),
                    completed: false,
                })
            }
            RekeyMessage::Ack { seq, public } => {
                let keypair = match std::mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::Started {
                        seq: started,
                        keypair,
                        ..
                    } if started == seq => keypair,
                    other => {
                        self.phase = other;
                        debug!(seq, "ignoring key exchange ack");
                        return Ok(RekeyStep::default());
                    }
                };
                let shared = keypair.diffie_hellman(&public);
                let key = kdf::rekey(current, &shared, seq)?;
                let mac = kdf::sign(&key, &[CONFIRM_LABEL, &seq.to_be_bytes()])?;
                self.finish(now);
                Ok(RekeyStep {
                    reply: Some(RekeyMessage::Confirm { seq, mac }),
                    new_key: Some(key),
                    completed: true,
                })
            }
            RekeyMessage::Confirm { seq, mac } => {
                let key = match std::mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::Acked {
                        seq: acked, key, ..
                    } if acked == seq => key,
                    other => {
                        self.phase = other;
                        debug!(seq, "ignoring key exchange confirm");
                        return Ok(RekeyStep::default());
                    }
                };
                kdf::verify(&key, &[CONFIRM_LABEL, &seq.to_be_bytes()], &mac)?;
                self.finish(now);
                Ok(RekeyStep {
                    reply: None,
                    new_key: None,
                    completed: true,
                })
            }
        }
    }

    fn finish(&mut self, now: Instant) {
        self.completed += 1;
        self.next_start = now + self.config.interval;
        debug!(seq = self.seq, completed = self.completed, "key exchange complete");
    }

    /// Next instant [`handle_timeout`](Self::handle_timeout) has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Idle if self.role == Role::Client => Some(self.next_start),
            Phase::Idle => None,
            Phase::Started { at, .. } | Phase::Acked { at, .. } => Some(*at + self.config.timeout),
        }
    }

    /// Abandon an exchange that ran past its timeout.
    pub fn handle_timeout(&mut self, now: Instant) {
        let started = match &self.phase {
            Phase::Started { at, .. } | Phase::Acked { at, .. } => *at,
            Phase::Idle => return,
        };
        if now >= started + self.config.timeout {
            warn!(seq = self.seq, "key exchange timed out");
            self.phase = Phase::Idle;
            self.next_start = now + self.config.timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(now: Instant) -> (KeyExchange, KeyExchange) {
        let config = KeyExchangeConfig {
            interval: Duration::from_secs(60),
            ..Default::default()
        };
        (
            KeyExchange::new(Role::Client, config.clone(), now),
            KeyExchange::new(Role::Server, config, now),
        )
    }

    #[test]
    fn test_full_exchange_agrees() {
        let t0 = Instant::now();
        let (mut client, mut server) = pair(t0);
        let current = SessionKey::from_bytes([1; 32]);

        assert!(client.poll_start(t0, Duration::from_millis(50)).is_none());
        assert_eq!(client.poll_timeout(), Some(t0 + Duration::from_secs(60)));
        assert_eq!(server.poll_timeout(), None);

        let t1 = t0 + Duration::from_secs(60);
        let start = client.poll_start(t1, Duration::from_millis(50)).unwrap();
        assert_eq!(start.seq(), 1);

        let step = server.handle(start, &current, t1).unwrap();
        let server_key = step.new_key.unwrap();
        assert!(!step.completed);

        let step = client.handle(step.reply.unwrap(), &current, t1).unwrap();
        let client_key = step.new_key.unwrap();
        assert!(step.completed);
        assert_eq!(client_key, server_key);
        assert_ne!(client_key, current);

        let step = server.handle(step.reply.unwrap(), &current, t1).unwrap();
        assert!(step.completed);
        assert!(step.reply.is_none());
        assert_eq!(client.completed(), 1);
        assert_eq!(server.completed(), 1);
        assert!(client.is_idle() && server.is_idle());
    }

    #[test]
    fn test_start_deferred_on_slow_path() {
        let t0 = Instant::now();
        let (mut client, _) = pair(t0);
        let due = t0 + Duration::from_secs(60);
        assert!(client.poll_start(due, Duration::from_secs(3)).is_none());
        assert_eq!(client.poll_timeout(), Some(due + DEFER_STEP));
        assert!(client.poll_start(due + DEFER_STEP, Duration::from_millis(100)).is_some());
    }

    #[test]
    fn test_stale_start_ignored() {
        let t0 = Instant::now();
        let (_, mut server) = pair(t0);
        let current = SessionKey::from_bytes([1; 32]);
        let start = RekeyMessage::Start {
            seq: 1,
            public: EphemeralKeypair::generate().public_key(),
        };
        assert!(server.handle(start.clone(), &current, t0).unwrap().reply.is_some());
        let step = server.handle(start, &current, t0).unwrap();
        assert!(step.reply.is_none() && step.new_key.is_none());
    }

    #[test]
    fn test_bad_confirm_rejected() {
        let t0 = Instant::now();
        let (_, mut server) = pair(t0);
        let current = SessionKey::from_bytes([1; 32]);
        let start = RekeyMessage::Start {
            seq: 1,
            public: EphemeralKeypair::generate().public_key(),
        };
        server.handle(start, &current, t0).unwrap();
        let forged = RekeyMessage::Confirm {
            seq: 1,
            mac: [0; SIGNATURE_SIZE],
        };
        assert_eq!(
            server.handle(forged, &current, t0).err(),
            Some(CryptoError::BadSignature)
        );
        assert_eq!(server.completed(), 0);
    }

    #[test]
    fn test_unanswered_start_times_out() {
        let t0 = Instant::now();
        let (mut client, _) = pair(t0);
        let due = t0 + Duration::from_secs(60);
        client.poll_start(due, Duration::ZERO).unwrap();
        assert_eq!(client.poll_timeout(), Some(due + KEY_EXCHANGE_TIMEOUT));

        client.handle_timeout(due + KEY_EXCHANGE_TIMEOUT);
        assert!(client.is_idle());
        // A retry uses a fresh sequence number.
        let retry_at = due + KEY_EXCHANGE_TIMEOUT * 2;
        assert_eq!(client.poll_start(retry_at, Duration::ZERO).unwrap().seq(), 2);
    }
}
