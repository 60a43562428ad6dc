//! Binary frame format.
//!
//! Every header and every body travels as one frame (16 bytes header +
//! payload):
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | magic  | version | flags  | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes|
//! +--------+---------+--------+-------------+--------+
//! | payload                                          |
//! | payload_len bytes                                |
//! +--------------------------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying brpc frames: "BRPC"
pub const MAGIC: [u8; 4] = *b"BRPC";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Payload is a call header; cleared for bodies.
    pub const HEADER: u16 = 1 << 1;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x0003;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_header(mut self) -> Self {
        self.0 |= Self::HEADER;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_header(&self) -> bool {
        self.0 & Self::HEADER != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol version.
    pub version: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Frame payload (codec-encoded header or body).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a body frame with the given payload.
    pub fn body(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Creates a header frame with the given payload.
    pub fn header(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc().with_header(),
            payload,
        }
    }

    /// Returns the encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len() as u32,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.reserve(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.payload.len() as u32);

        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let total_len = FRAME_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from_static(b"\xa1\x63seq\x01");
        let frame = Frame::header(payload.clone());

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.version, crate::PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert!(decoded.flags.is_header());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_frame_is_not_header() {
        let mut buf = Frame::body(Bytes::from_static(b"null")).encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.is_header());
    }

    #[test]
    fn test_crc_validation() {
        let frame = Frame::body(Bytes::from_static(b"{\"test\":\"data\"}"));
        let mut encoded = frame.encode().unwrap();

        // Corrupt the payload
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_incomplete_frame() {
        let mut buf = BytesMut::from(&b"BRPC\x00\x01\x00\x01"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        // Complete header, truncated payload
        let mut buf = Frame::body(Bytes::from_static(b"0123456789"))
            .encode()
            .unwrap();
        buf.truncate(FRAME_HEADER_SIZE + 4);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 4);
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&b"BRPC\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let result = Frame::body(Bytes::from(huge_payload)).encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_declared_length_too_large() {
        let mut buf = BytesMut::from(&b"BRPC\x00\x01\x00\x01\xff\xff\xff\xff\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = Frame::body(Bytes::from_static(b"{}"));
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        Frame::header(Bytes::from_static(b"h"))
            .encode_into(&mut buf)
            .unwrap();
        Frame::body(Bytes::from_static(b"b"))
            .encode_into(&mut buf)
            .unwrap();

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(first.flags.is_header());
        assert_eq!(first.payload.as_ref(), b"h");

        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!second.flags.is_header());
        assert_eq!(second.payload.as_ref(), b"b");
    }

    proptest! {
        #[test]
        fn prop_split_delivery_decodes_same_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            split in 0usize..600,
        ) {
            let encoded = Frame::body(Bytes::from(payload.clone())).encode().unwrap();
            let split = split.min(encoded.len());

            let mut buf = BytesMut::from(&encoded[..split]);
            if split < encoded.len() {
                prop_assert!(Frame::decode(&mut buf).unwrap().is_none());
                buf.extend_from_slice(&encoded[split..]);
            }
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }
}
