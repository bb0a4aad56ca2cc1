//! QUIC versions and the version to ALPN mapping
//!
//! The handshake asks [`version_to_alpn`] once per attempt for the ALPN token
//! to offer. Versions without a token cannot carry HTTP/3 and the handshake
//! must fail instead of proceeding.

use rand::RngCore;

use crate::error::PacketError;

/// ALPN protocol negotiated during the TLS handshake, for QUIC v1 and v2
pub const NEXT_PROTO_H3: &str = "h3";

/// QUIC version identifier (32-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuicVersion(u32);

impl QuicVersion {
    /// QUIC version 1 (RFC 9000)
    pub const V1: QuicVersion = QuicVersion(0x00000001);

    /// QUIC version 2 (RFC 9369)
    pub const V2: QuicVersion = QuicVersion(0x6b3343cf);

    /// Version field of a version negotiation packet
    pub const NEGOTIATION: QuicVersion = QuicVersion(0);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Reserved versions have the form 0x?a?a?a?a and are never supported
    pub fn is_reserved(&self) -> bool {
        (self.0 & 0x0f0f0f0f) == 0x0a0a0a0a
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(self)
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
            other => write!(f, "{:#010x}", other.0),
        }
    }
}

/// Versions this stack speaks, in preference order
pub const SUPPORTED_VERSIONS: [QuicVersion; 2] = [QuicVersion::V1, QuicVersion::V2];

/// ALPN token to negotiate for `version`, or `None` for versions HTTP/3 is not mapped onto
pub fn version_to_alpn(version: QuicVersion) -> Option<&'static str> {
    match version {
        QuicVersion::V1 | QuicVersion::V2 => Some(NEXT_PROTO_H3),
        _ => None,
    }
}

/// Version negotiation packet (RFC 9000 Section 17.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    pub supported_versions: Vec<QuicVersion>,
}

impl VersionNegotiationPacket {
    /// Answer to a long header packet with an unsupported version. The
    /// connection IDs of the triggering packet are echoed back swapped.
    pub fn in_response_to(client_dcid: &[u8], client_scid: &[u8]) -> Self {
        Self {
            dcid: client_scid.to_vec(),
            scid: client_dcid.to_vec(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(7 + self.dcid.len() + self.scid.len() + 4 * self.supported_versions.len());

        // Long header form bit, remaining bits unused and randomised
        let mut first = [0u8; 1];
        rand::thread_rng().fill_bytes(&mut first);
        packet.push(0x80 | first[0]);
        packet.extend_from_slice(&QuicVersion::NEGOTIATION.to_bytes());

        packet.push(self.dcid.len() as u8);
        packet.extend_from_slice(&self.dcid);
        packet.push(self.scid.len() as u8);
        packet.extend_from_slice(&self.scid);

        for version in &self.supported_versions {
            packet.extend_from_slice(&version.to_bytes());
        }

        packet
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < 7 {
            return Err(PacketError::TooSmall { size: data.len() });
        }
        if data[0] & 0x80 == 0 {
            return Err(PacketError::InvalidHeader);
        }
        if QuicVersion::from_bytes([data[1], data[2], data[3], data[4]]) != QuicVersion::NEGOTIATION {
            return Err(PacketError::InvalidHeader);
        }

        let mut offset = 5;
        let dcid = read_length_prefixed(data, &mut offset)?;
        let scid = read_length_prefixed(data, &mut offset)?;

        let supported_versions = data[offset..]
            .chunks_exact(4)
            .map(|chunk| QuicVersion::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            dcid,
            scid,
            supported_versions,
        })
    }
}

fn read_length_prefixed(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, PacketError> {
    let len = *data.get(*offset).ok_or(PacketError::IncompleteData)? as usize;
    *offset += 1;
    let value = data
        .get(*offset..*offset + len)
        .ok_or(PacketError::IncompleteData)?
        .to_vec();
    *offset += len;
    Ok(value)
}
