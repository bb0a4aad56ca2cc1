//! QUIC connection ID and stateless reset token handling
//!
//! Covers the identifier value types the registry is keyed on, generation of
//! new local IDs, derivation of the stateless reset tokens published for
//! them, and per-connection bookkeeping of issued IDs by sequence number
//! (RFC 9000 Section 5.1).

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{PacketError, QuicError, Result};

/// Maximum length of a connection ID (RFC 9000)
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Default length of locally generated connection IDs
pub const DEFAULT_CONNECTION_ID_LENGTH: usize = 8;

/// Stateless reset token length (128 bits)
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

/// Length of the key stateless reset tokens are derived from
pub const STATELESS_RESET_KEY_LENGTH: usize = 32;

/// Opaque routing key of a connection, 0 to 20 bytes.
///
/// Equality and hashing are byte-exact.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    /// Create a connection ID from raw bytes
    pub fn new(data: impl Into<Bytes>) -> std::result::Result<Self, PacketError> {
        let data = data.into();
        if data.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(PacketError::InvalidConnectionIdLength(data.len()));
        }
        Ok(Self(data))
    }

    /// Copy a connection ID out of a packet buffer
    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, PacketError> {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// The zero-length connection ID
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Generate a random connection ID
    pub fn generate_random(length: usize) -> Result<Self> {
        if length > MAX_CONNECTION_ID_LENGTH {
            return Err(QuicError::Protocol(format!(
                "Connection ID length {} exceeds maximum {}",
                length, MAX_CONNECTION_ID_LENGTH
            )));
        }

        let mut data = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut data);
        Ok(Self(Bytes::from(data)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(empty)");
        }
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Stateless reset token bound to a connection ID
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatelessResetToken([u8; STATELESS_RESET_TOKEN_LENGTH]);

impl StatelessResetToken {
    pub const fn new(data: [u8; STATELESS_RESET_TOKEN_LENGTH]) -> Self {
        Self(data)
    }

    /// Read a token from exactly 16 bytes
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let data: [u8; STATELESS_RESET_TOKEN_LENGTH] = data.try_into().ok()?;
        Some(Self(data))
    }

    /// Generate a random stateless reset token
    pub fn generate_random() -> Self {
        let mut data = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        rand::thread_rng().fill_bytes(&mut data);
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; STATELESS_RESET_TOKEN_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for StatelessResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatelessResetToken({})", hex::encode(self.0))
    }
}

/// Secret that the stateless reset tokens of an endpoint are derived from.
///
/// Tokens must stay stable across restarts for the same key, otherwise a peer
/// cannot authenticate a reset sent after local state loss.
#[derive(Clone)]
pub struct StatelessResetKey([u8; STATELESS_RESET_KEY_LENGTH]);

impl StatelessResetKey {
    pub fn new(key: [u8; STATELESS_RESET_KEY_LENGTH]) -> Self {
        Self(key)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; STATELESS_RESET_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Parse a hex encoded 32 byte key
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| QuicError::Config(format!("Invalid stateless reset key: {}", e)))?;
        let key: [u8; STATELESS_RESET_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            QuicError::Config(format!(
                "Stateless reset key must be {} bytes, got {}",
                STATELESS_RESET_KEY_LENGTH,
                b.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Derive the token published for `connection_id` (HMAC-SHA256, truncated)
    pub fn token_for(&self, connection_id: &ConnectionId) -> StatelessResetToken {
        // HMAC accepts keys of any length, so this cannot fail for a 32 byte key.
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.0)
            .unwrap_or_else(|_| unreachable!("HMAC takes keys of any length"));
        mac.update(connection_id.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&digest[..STATELESS_RESET_TOKEN_LENGTH]);
        StatelessResetToken(token)
    }
}

impl fmt::Debug for StatelessResetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatelessResetKey(..)")
    }
}

/// Source of new local connection IDs
pub trait ConnectionIdGenerator: Send + Sync {
    fn generate(&self) -> Result<ConnectionId>;

    /// Length of every generated ID. Short headers carry no length, so the
    /// endpoint parses them with this.
    fn connection_id_len(&self) -> usize;
}

/// Generates uniformly random IDs of a fixed length
#[derive(Debug, Clone)]
pub struct RandomConnectionIdGenerator {
    length: usize,
}

impl RandomConnectionIdGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.min(MAX_CONNECTION_ID_LENGTH),
        }
    }
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_ID_LENGTH)
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate(&self) -> Result<ConnectionId> {
        ConnectionId::generate_random(self.length)
    }

    fn connection_id_len(&self) -> usize {
        self.length
    }
}

#[derive(Debug, Clone)]
struct IssuedConnectionId {
    id: ConnectionId,
    issued_at: Instant,
}

/// Tracks the connection IDs a connection has issued to its peer
#[derive(Debug)]
pub struct ConnectionIdManager {
    /// Currently active IDs indexed by sequence number
    active: BTreeMap<u64, IssuedConnectionId>,
    /// Recently retired IDs, newest last
    retired: VecDeque<(u64, ConnectionId)>,
    next_sequence_number: u64,
    /// Peer's active_connection_id_limit
    active_limit: usize,
    max_retired: usize,
}

impl ConnectionIdManager {
    /// Start tracking with the ID used during the handshake (sequence 0)
    pub fn new(initial: ConnectionId, active_limit: usize) -> Self {
        let mut active = BTreeMap::new();
        active.insert(
            0,
            IssuedConnectionId {
                id: initial,
                issued_at: Instant::now(),
            },
        );

        Self {
            active,
            retired: VecDeque::new(),
            next_sequence_number: 1,
            active_limit: active_limit.max(1),
            max_retired: 16,
        }
    }

    /// Record a newly issued ID and return its sequence number
    pub fn issue(&mut self, id: ConnectionId) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.active.insert(
            sequence_number,
            IssuedConnectionId {
                id,
                issued_at: Instant::now(),
            },
        );
        sequence_number
    }

    /// Retire an ID after RETIRE_CONNECTION_ID from the peer.
    ///
    /// Returns `Ok(None)` for a sequence number that was already retired.
    /// A sequence number never issued is a protocol violation.
    pub fn retire(&mut self, sequence_number: u64) -> Result<Option<ConnectionId>> {
        if sequence_number >= self.next_sequence_number {
            return Err(QuicError::Protocol(format!(
                "retired connection ID sequence number {} was never issued",
                sequence_number
            )));
        }

        let Some(issued) = self.active.remove(&sequence_number) else {
            return Ok(None);
        };

        self.retired.push_back((sequence_number, issued.id.clone()));
        while self.retired.len() > self.max_retired {
            self.retired.pop_front();
        }
        Ok(Some(issued.id))
    }

    /// Number of IDs that can be issued before reaching the peer's limit
    pub fn remaining_capacity(&self) -> usize {
        self.active_limit.saturating_sub(self.active.len())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.active.values().any(|issued| &issued.id == id)
    }

    /// Any active ID, preferring the most recently issued
    pub fn current(&self) -> Option<&ConnectionId> {
        self.active.values().next_back().map(|issued| &issued.id)
    }

    pub fn active_ids(&self) -> impl Iterator<Item = (u64, &ConnectionId)> {
        self.active.iter().map(|(seq, issued)| (*seq, &issued.id))
    }

    pub fn stats(&self) -> ConnectionIdStats {
        ConnectionIdStats {
            active_count: self.active.len(),
            retired_count: self.retired.len(),
            next_sequence_number: self.next_sequence_number,
            oldest_issued_at: self.active.values().map(|issued| issued.issued_at).min(),
        }
    }
}

/// Statistics for connection ID management
#[derive(Debug, Clone)]
pub struct ConnectionIdStats {
    pub active_count: usize,
    pub retired_count: usize,
    pub next_sequence_number: u64,
    pub oldest_issued_at: Option<Instant>,
}
