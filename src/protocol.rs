//! Frame codec for tokenization traffic carried directly over Ethernet.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! Link header (14 bytes):             dst_address[6] | src_address[6] | protocol_id[2]
//! Pseudo-transport header (8 bytes):  src_port[2] | dst_port[2] | length[2] | checksum[2]
//! Payload:                            UTF-8 text, (length - 8) bytes
//! ```
//!
//! The checksum field is reserved and always written as zero. It is never
//! validated on receive, so the transport carries no integrity guarantee.
//!
//! Requests carry space-separated words, replies carry space-separated
//! decimal token ids.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Link-layer header length (dst, src, protocol id).
pub const LINK_HEADER_LEN: usize = 14;

/// Pseudo-transport header length (ports, length, checksum).
pub const TRANSPORT_HEADER_LEN: usize = 8;

/// Combined header length; anything shorter is malformed.
pub const HEADER_LEN: usize = LINK_HEADER_LEN + TRANSPORT_HEADER_LEN;

/// IEEE 802 local experimental EtherType.
pub const DEFAULT_PROTOCOL_ID: u16 = 0x88B5;

/// Largest payload whose length still fits the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - TRANSPORT_HEADER_LEN;

/// A 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid hardware address '{0}', expected six hex octets like 08:c0:eb:a6:de:3d")]
pub struct MacAddrError(String);

impl FromStr for MacAddr {
    type Err = MacAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = trimmed.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| MacAddrError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacAddrError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacAddrError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacAddrError(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacAddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// The 8-byte header that mimics a transport header without a network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload length, as written by the sender.
    pub length: u16,
    /// Reserved. Always zero on encode, ignored on decode.
    pub checksum: u16,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub protocol_id: u16,
    pub header: PseudoHeader,
    pub payload: String,
}

impl Frame {
    pub fn src_port(&self) -> u16 {
        self.header.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.header.dst_port
    }

    /// Encode a reply to this frame: addresses and ports swapped.
    pub fn reply(&self, payload: &str) -> Bytes {
        encode(
            self.dst,
            self.src,
            self.protocol_id,
            self.header.dst_port,
            self.header.src_port,
            payload,
        )
    }
}

/// Frame decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Malformed { len: usize },
}

/// Total encoded length of a frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len
}

/// Build a frame. The caller keeps `payload` within [`MAX_PAYLOAD_LEN`].
pub fn encode(
    src: MacAddr,
    dst: MacAddr,
    protocol_id: u16,
    src_port: u16,
    dst_port: u16,
    payload: &str,
) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
    let body = payload.as_bytes();
    let mut buf = BytesMut::with_capacity(encoded_len(body.len()));

    buf.put_slice(&dst.0);
    buf.put_slice(&src.0);
    buf.put_u16(protocol_id);

    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u16((TRANSPORT_HEADER_LEN + body.len()) as u16);
    buf.put_u16(0);

    buf.put_slice(body);
    buf.freeze()
}

/// Read only the protocol id, without decoding the rest.
pub fn peek_protocol_id(frame: &[u8]) -> Option<u16> {
    frame
        .get(12..LINK_HEADER_LEN)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Decode a frame.
///
/// The payload is bounded by the length field when that field is consistent
/// with the bytes received; otherwise everything after the header is used.
/// Trailing NUL padding (short Ethernet frames are padded to 60 bytes) is
/// stripped, and invalid UTF-8 is replaced rather than rejected.
pub fn decode(frame: &[u8]) -> Result<Frame, FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Malformed { len: frame.len() });
    }

    let mut buf = frame;
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    buf.copy_to_slice(&mut dst);
    buf.copy_to_slice(&mut src);
    let protocol_id = buf.get_u16();

    let header = PseudoHeader {
        src_port: buf.get_u16(),
        dst_port: buf.get_u16(),
        length: buf.get_u16(),
        checksum: buf.get_u16(),
    };

    let declared = (header.length as usize).checked_sub(TRANSPORT_HEADER_LEN);
    let body = match declared {
        Some(n) if n <= buf.len() => &buf[..n],
        _ => buf,
    };
    let end = body
        .iter()
        .rposition(|&b| b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);

    Ok(Frame {
        dst: MacAddr(dst),
        src: MacAddr(src),
        protocol_id,
        header,
        payload: String::from_utf8_lossy(&body[..end]).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: MacAddr = MacAddr([0x08, 0xc0, 0xeb, 0xa6, 0xde, 0x3d]);
    const SERVER: MacAddr = MacAddr([0x08, 0xc0, 0xeb, 0xa6, 0xc6, 0x2d]);

    #[test]
    fn test_encode_layout() {
        let frame = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 12345, 67, "ab cd");
        assert_eq!(frame.len(), HEADER_LEN + 5);
        assert_eq!(&frame[0..6], &SERVER.0);
        assert_eq!(&frame[6..12], &CLIENT.0);
        assert_eq!(&frame[12..14], &[0x88, 0xb5]);
        assert_eq!(&frame[14..16], &12345u16.to_be_bytes());
        assert_eq!(&frame[16..18], &67u16.to_be_bytes());
        assert_eq!(&frame[18..20], &13u16.to_be_bytes());
        assert_eq!(&frame[20..22], &[0, 0]);
        assert_eq!(&frame[22..], b"ab cd");
    }

    #[test]
    fn test_decode_recovers_fields() {
        let bytes = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 12345, 67, "hello world");
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.src, CLIENT);
        assert_eq!(frame.dst, SERVER);
        assert_eq!(frame.protocol_id, DEFAULT_PROTOCOL_ID);
        assert_eq!(frame.src_port(), 12345);
        assert_eq!(frame.dst_port(), 67);
        assert_eq!(frame.header.checksum, 0);
        assert_eq!(frame.payload, "hello world");
    }

    #[test]
    fn test_length_field_tracks_payload() {
        for len in [0usize, 1, 38, 1478, 9000, MAX_PAYLOAD_LEN] {
            let payload = "x".repeat(len);
            let bytes = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 1, 2, &payload);
            let length = u16::from_be_bytes([bytes[18], bytes[19]]);
            assert_eq!(length as usize, TRANSPORT_HEADER_LEN + len);
        }
    }

    #[test]
    fn test_decode_short_frame() {
        assert_eq!(
            decode(&[0u8; 21]),
            Err(FrameError::Malformed { len: 21 })
        );
        let empty = decode(&[0u8; HEADER_LEN]).unwrap();
        assert_eq!(empty.payload, "");
    }

    #[test]
    fn test_decode_strips_padding() {
        let mut bytes = encode(SERVER, CLIENT, DEFAULT_PROTOCOL_ID, 67, 12345, "101 7 102").to_vec();
        // Minimum Ethernet frame size padding
        bytes.resize(60, 0);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, "101 7 102");
    }

    #[test]
    fn test_decode_bogus_length_uses_remaining_bytes() {
        let mut bytes = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 1, 2, "abc").to_vec();
        bytes[18..20].copy_from_slice(&500u16.to_be_bytes());
        assert_eq!(decode(&bytes).unwrap().payload, "abc");

        bytes[18..20].copy_from_slice(&3u16.to_be_bytes());
        assert_eq!(decode(&bytes).unwrap().payload, "abc");
    }

    #[test]
    fn test_decode_lossy_utf8() {
        let mut bytes = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 1, 2, "ab").to_vec();
        bytes.push(0xff);
        bytes[18..20].copy_from_slice(&11u16.to_be_bytes());
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, "ab\u{fffd}");
    }

    #[test]
    fn test_checksum_ignored() {
        let mut bytes = encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 1, 2, "ab").to_vec();
        bytes[20..22].copy_from_slice(&[0xde, 0xad]);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.header.checksum, 0xdead);
        assert_eq!(frame.payload, "ab");
    }

    #[test]
    fn test_reply_swaps_addressing() {
        let request = decode(&encode(CLIENT, SERVER, DEFAULT_PROTOCOL_ID, 12345, 67, "ab")).unwrap();
        let reply = decode(&request.reply("0 1")).unwrap();
        assert_eq!(reply.src, SERVER);
        assert_eq!(reply.dst, CLIENT);
        assert_eq!(reply.src_port(), 67);
        assert_eq!(reply.dst_port(), 12345);
        assert_eq!(reply.protocol_id, DEFAULT_PROTOCOL_ID);
        assert_eq!(reply.payload, "0 1");
    }

    #[test]
    fn test_peek_protocol_id() {
        let bytes = encode(CLIENT, SERVER, 0x0800, 1, 2, "");
        assert_eq!(peek_protocol_id(&bytes), Some(0x0800));
        assert_eq!(peek_protocol_id(&[0u8; 13]), None);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "08:C0:eb:a6:de:3d".parse().unwrap();
        assert_eq!(mac, CLIENT);
        assert_eq!(mac.to_string(), "08:c0:eb:a6:de:3d");
        assert_eq!("08-c0-eb-a6-de-3d".parse::<MacAddr>().unwrap(), CLIENT);
        assert!("08:c0:eb:a6:de".parse::<MacAddr>().is_err());
        assert!("08:c0:eb:a6:de:3d:00".parse::<MacAddr>().is_err());
        assert!("08:c0:eb:a6:de:zz".parse::<MacAddr>().is_err());
    }
}
