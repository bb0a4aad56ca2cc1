//! QUIC variable-length integers (RFC 9000 Section 16)

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest value a varint can carry
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Encoded size of a varint, from the two high bits of its first byte
pub fn encoded_len(first_byte: u8) -> usize {
    1 << (first_byte >> 6)
}

/// Number of bytes `value` needs on the wire
pub fn size_of(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Decode a varint from the front of `data`, returning the value and bytes consumed
pub fn decode(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = encoded_len(first);
    if data.len() < len {
        return None;
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Some((value, len))
}

/// Decode a varint from a buffer, advancing it only on success
pub fn decode_buf(buf: &mut impl Buf) -> Option<u64> {
    let first = *buf.chunk().first()?;
    let len = encoded_len(first);
    if buf.remaining() < len {
        return None;
    }

    // A varint may straddle chunks of a non-contiguous buffer
    let mut tmp = [0u8; 8];
    buf.copy_to_slice(&mut tmp[..len]);
    decode(&tmp[..len]).map(|(value, _)| value)
}

/// Encode `value`, which must not exceed [`MAX_VARINT`]
pub fn encode(value: u64, buf: &mut impl BufMut) {
    debug_assert!(value <= MAX_VARINT);
    match size_of(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

/// Read one varint from an async byte stream.
///
/// Returns `Ok(None)` if the stream ends before the varint is complete.
pub async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<Option<u64>> {
    let mut buf = [0u8; 8];
    if reader.read(&mut buf[..1]).await? == 0 {
        return Ok(None);
    }

    let len = encoded_len(buf[0]);
    let mut filled = 1;
    while filled < len {
        let n = reader.read(&mut buf[filled..len]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }

    Ok(decode(&buf[..len]).map(|(value, _)| value))
}
