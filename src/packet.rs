//! Datagram types and the minimal header inspection used for routing
//!
//! Only the invariant parts of the header are read: the form bit, the
//! version and connection IDs of long headers, the Initial token, and the
//! destination ID of short headers. Everything past that belongs to packet
//! protection and the frame codec.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::connection_id::{ConnectionId, StatelessResetToken, STATELESS_RESET_TOKEN_LENGTH};
use crate::error::PacketError;
use crate::varint;
use crate::version::QuicVersion;

/// Minimum size of a datagram carrying a client Initial (RFC 9000 Section 14.1)
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Size of the stateless resets we send. Packets of this size or smaller
/// never get a reset in response, which rules out reset loops between peers.
/// First byte, longest connection ID, longest packet number, one payload
/// byte and the token.
pub const MIN_STATELESS_RESET_SIZE: usize = 1 + 20 + 4 + 1 + STATELESS_RESET_TOKEN_LENGTH;

/// Smallest datagram that can be a stateless reset sent by a peer
pub const MIN_RECEIVED_STATELESS_RESET_SIZE: usize = 5 + STATELESS_RESET_TOKEN_LENGTH;

/// A datagram read from the socket, consumed by exactly one `handle_packet` call
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub remote_addr: SocketAddr,
    pub rcv_time: Instant,
    pub data: Bytes,
}

impl ReceivedPacket {
    pub fn new(remote_addr: SocketAddr, data: Bytes) -> Self {
        Self {
            remote_addr,
            rcv_time: Instant::now(),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A datagram queued for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

/// Long header packet types (RFC 9000 Section 17.2, RFC 9369 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongPacketType {
    fn from_bits(bits: u8, version: QuicVersion) -> Option<Self> {
        let packet_type = match (version, bits & 0x03) {
            (QuicVersion::V1, 0) | (QuicVersion::V2, 1) => Self::Initial,
            (QuicVersion::V1, 1) | (QuicVersion::V2, 2) => Self::ZeroRtt,
            (QuicVersion::V1, 2) | (QuicVersion::V2, 3) => Self::Handshake,
            (QuicVersion::V1, 3) | (QuicVersion::V2, 0) => Self::Retry,
            _ => return None,
        };
        Some(packet_type)
    }
}

/// Routing-relevant view of a packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    Long {
        version: QuicVersion,
        /// `None` when the version is not one we know the type bits of
        packet_type: Option<LongPacketType>,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Address validation token, Initial packets only
        token: Option<Bytes>,
    },
    Short {
        dcid: ConnectionId,
    },
}

impl PacketHeader {
    pub fn destination_connection_id(&self) -> &ConnectionId {
        match self {
            Self::Long { dcid, .. } | Self::Short { dcid } => dcid,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long { .. })
    }
}

/// Parse just enough of `data` to route it.
///
/// Short headers do not encode the destination ID length, so the length of
/// locally generated IDs has to be supplied.
pub fn inspect_header(data: &Bytes, short_dcid_len: usize) -> Result<PacketHeader, PacketError> {
    let first = *data.first().ok_or(PacketError::TooSmall { size: 0 })?;

    if first & 0x80 == 0 {
        let end = 1 + short_dcid_len;
        if data.len() < end {
            return Err(PacketError::TooSmall { size: data.len() });
        }
        let dcid = ConnectionId::new(data.slice(1..end))?;
        return Ok(PacketHeader::Short { dcid });
    }

    if data.len() < 7 {
        return Err(PacketError::TooSmall { size: data.len() });
    }
    let version = QuicVersion::from_bytes([data[1], data[2], data[3], data[4]]);

    let mut offset = 5;
    let dcid = read_connection_id(data, &mut offset)?;
    let scid = read_connection_id(data, &mut offset)?;

    let packet_type = if version.is_supported() {
        LongPacketType::from_bits(first >> 4, version)
    } else {
        None
    };

    let token = match packet_type {
        Some(LongPacketType::Initial) => {
            let (len, consumed) = varint::decode(&data[offset..]).ok_or(PacketError::IncompleteData)?;
            offset += consumed;
            let end = offset
                .checked_add(len as usize)
                .filter(|end| *end <= data.len())
                .ok_or(PacketError::IncompleteData)?;
            Some(data.slice(offset..end))
        }
        _ => None,
    };

    Ok(PacketHeader::Long {
        version,
        packet_type,
        dcid,
        scid,
        token,
    })
}

fn read_connection_id(data: &Bytes, offset: &mut usize) -> Result<ConnectionId, PacketError> {
    let len = *data.get(*offset).ok_or(PacketError::IncompleteData)? as usize;
    *offset += 1;
    if data.len() < *offset + len {
        return Err(PacketError::IncompleteData);
    }
    let id = ConnectionId::new(data.slice(*offset..*offset + len))?;
    *offset += len;
    Ok(id)
}

/// Token a peer's stateless reset would carry in its last 16 bytes
pub fn stateless_reset_tail(data: &[u8]) -> Option<StatelessResetToken> {
    if data.len() < MIN_RECEIVED_STATELESS_RESET_SIZE || data[0] & 0x80 != 0 {
        return None;
    }
    StatelessResetToken::from_slice(&data[data.len() - STATELESS_RESET_TOKEN_LENGTH..])
}

/// Build a stateless reset answering a packet of `trigger_size` bytes.
///
/// Returns `None` when the trigger is too small to answer without risking a
/// reset loop.
pub fn build_stateless_reset(token: &StatelessResetToken, trigger_size: usize) -> Option<Bytes> {
    if trigger_size <= MIN_STATELESS_RESET_SIZE {
        return None;
    }

    let mut random = [0u8; MIN_STATELESS_RESET_SIZE - STATELESS_RESET_TOKEN_LENGTH];
    rand::thread_rng().fill_bytes(&mut random);
    // Looks like a short header: form bit clear, fixed bit set
    random[0] = (random[0] & 0x7f) | 0x40;

    let mut packet = BytesMut::with_capacity(MIN_STATELESS_RESET_SIZE);
    packet.put_slice(&random);
    packet.put_slice(token.as_bytes());
    Some(packet.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_header(first: u8, version: u32, dcid: &[u8], scid: &[u8], token: Option<&[u8]>) -> Bytes {
        let mut buf = vec![first];
        buf.extend_from_slice(&version.to_be_bytes());
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(scid.len() as u8);
        buf.extend_from_slice(scid);
        if let Some(token) = token {
            varint::encode(token.len() as u64, &mut buf);
            buf.extend_from_slice(token);
        }
        buf.resize(64, 0);
        Bytes::from(buf)
    }

    #[test]
    fn test_short_header() {
        let data = Bytes::from_static(&[0x41, 1, 2, 3, 4, 5, 6, 7, 8, 0xaa, 0xbb]);
        let header = inspect_header(&data, 8).unwrap();
        assert_eq!(
            header,
            PacketHeader::Short {
                dcid: ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap()
            }
        );
        assert!(inspect_header(&data.slice(..5), 8).is_err());
    }

    #[test]
    fn test_v1_initial_with_token() {
        let data = long_header(0xc0, 1, &[9; 8], &[7; 4], Some(b"tok"));
        match inspect_header(&data, 8).unwrap() {
            PacketHeader::Long {
                version,
                packet_type,
                dcid,
                scid,
                token,
            } => {
                assert_eq!(version, QuicVersion::V1);
                assert_eq!(packet_type, Some(LongPacketType::Initial));
                assert_eq!(dcid.as_bytes(), &[9; 8]);
                assert_eq!(scid.as_bytes(), &[7; 4]);
                assert_eq!(token.as_deref(), Some(&b"tok"[..]));
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn test_v2_type_bits() {
        // 0b01 is Initial in v2 and 0-RTT in v1
        let v2 = long_header(0xd0, QuicVersion::V2.value(), &[1; 8], &[], Some(b""));
        let v1 = long_header(0xd0, 1, &[1; 8], &[], None);

        assert!(matches!(
            inspect_header(&v2, 8).unwrap(),
            PacketHeader::Long { packet_type: Some(LongPacketType::Initial), .. }
        ));
        assert!(matches!(
            inspect_header(&v1, 8).unwrap(),
            PacketHeader::Long { packet_type: Some(LongPacketType::ZeroRtt), .. }
        ));
    }

    #[test]
    fn test_unknown_version_keeps_ids() {
        let data = long_header(0xc0, 0x1a2a3a4a, &[3; 5], &[4; 6], None);
        let header = inspect_header(&data, 8).unwrap();
        assert!(matches!(header, PacketHeader::Long { packet_type: None, token: None, .. }));
        assert_eq!(header.destination_connection_id().as_bytes(), &[3; 5]);
    }

    #[test]
    fn test_malformed_long_headers() {
        assert!(inspect_header(&Bytes::new(), 8).is_err());
        let mut too_long = vec![0xc0, 0, 0, 0, 1, 21];
        too_long.extend_from_slice(&[0u8; 30]);
        assert_eq!(
            inspect_header(&Bytes::from(too_long), 8),
            Err(PacketError::InvalidConnectionIdLength(21))
        );
        let truncated = Bytes::from_static(&[0xc0, 0, 0, 0, 1, 8, 1, 2]);
        assert_eq!(inspect_header(&truncated, 8), Err(PacketError::IncompleteData));
    }

    #[test]
    fn test_stateless_reset_is_shorter_than_trigger() {
        let token = StatelessResetToken::new([5; 16]);
        assert!(build_stateless_reset(&token, MIN_STATELESS_RESET_SIZE).is_none());

        let reset = build_stateless_reset(&token, 100).unwrap();
        assert_eq!(reset.len(), MIN_STATELESS_RESET_SIZE);
        assert_eq!(reset[0] & 0xc0, 0x40);
        assert_eq!(stateless_reset_tail(&reset), Some(token));
    }

    #[test]
    fn test_reset_tail_requires_short_header() {
        let mut data = vec![0xc0u8; 40];
        assert_eq!(stateless_reset_tail(&data), None);
        data[0] = 0x40;
        assert!(stateless_reset_tail(&data).is_some());
        assert_eq!(stateless_reset_tail(&data[..20]), None);
    }
}
