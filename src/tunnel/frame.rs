//! Frame encoding/decoding for the tunnel link
//!
//! Length-prefixed framing (default):
//! ```text
//! +--------+--------+--------+--------+
//! |          Stream ID (4B)           |
//! +--------+--------+--------+--------+
//! |   Length (2B)   |    Payload ...  |
//! +--------+--------+--------+--------+
//! ```
//!
//! Read-boundary framing carries no length: one tunnel read is one frame.
//! It is byte-compatible with peers that frame this way, but only correct
//! while the transport never splits or coalesces reads.
//! ```text
//! +--------+--------+--------+--------+
//! |          Stream ID (4B)           |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::codec::{read_u16, read_u32, write_u16, write_u32};
use super::{TunnelError, FRAME_BUFFER_SIZE, LENGTH_FIELD_SIZE, STREAM_ID_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// How frame boundaries are carried on the tunnel link.
///
/// Nothing on the wire identifies the mode, so both ends must be configured
/// with the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Explicit payload length after the stream identifier
    #[default]
    LengthPrefixed,
    /// Frame boundary is the boundary of a single read
    ReadBoundary,
}

impl Framing {
    /// Bytes preceding the payload
    pub const fn header_len(self) -> usize {
        match self {
            Framing::LengthPrefixed => STREAM_ID_SIZE + LENGTH_FIELD_SIZE,
            Framing::ReadBoundary => STREAM_ID_SIZE,
        }
    }

    /// Largest payload that fits the exchange buffer
    pub const fn max_payload(self) -> usize {
        FRAME_BUFFER_SIZE - self.header_len()
    }

    /// Write the header for a payload already placed at `buf[header_len()..]`.
    ///
    /// Returns the total frame length.
    pub fn write_header(self, buf: &mut [u8], conn_id: u32, payload_len: usize) -> usize {
        debug_assert!(payload_len <= self.max_payload());
        write_u32(buf, 0, conn_id);
        if self == Framing::LengthPrefixed {
            write_u16(buf, STREAM_ID_SIZE, payload_len as u16);
        }
        self.header_len() + payload_len
    }
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the payload belongs to
    pub conn_id: u32,
    /// Opaque outside-connection bytes
    pub payload: Bytes,
}

impl Frame {
    pub fn new(conn_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            conn_id,
            payload: payload.into(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self, framing: Framing) -> Result<BytesMut, TunnelError> {
        if self.payload.len() > framing.max_payload() {
            return Err(TunnelError::FrameTooLarge(
                self.payload.len(),
                framing.max_payload(),
            ));
        }
        let mut buf = BytesMut::zeroed(framing.header_len() + self.payload.len());
        buf[framing.header_len()..].copy_from_slice(&self.payload);
        framing.write_header(&mut buf, self.conn_id, self.payload.len());
        Ok(buf)
    }
}

/// Incremental decoder for bytes read from the tunnel peer
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    pending: BytesMut,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: BytesMut::with_capacity(FRAME_BUFFER_SIZE),
        }
    }

    /// Feed one read's worth of bytes.
    ///
    /// With read-boundary framing every pushed chunk must be drained with
    /// [`FrameDecoder::next_frame`] before the next push.
    pub fn push(&mut self, chunk: &[u8]) {
        debug_assert!(self.framing == Framing::LengthPrefixed || self.pending.is_empty());
        self.pending.extend_from_slice(chunk);
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Drop partially received data
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Decode the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        match self.framing {
            Framing::ReadBoundary => self.next_read_boundary(),
            Framing::LengthPrefixed => self.next_length_prefixed(),
        }
    }

    fn next_read_boundary(&mut self) -> Result<Option<Frame>, TunnelError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.pending.len() < STREAM_ID_SIZE {
            let len = self.pending.len();
            self.pending.clear();
            return Err(TunnelError::MalformedFrame(format!(
                "{} byte read is shorter than the stream identifier",
                len
            )));
        }

        let conn_id = read_u32(&self.pending, 0);
        self.pending.advance(STREAM_ID_SIZE);
        let payload = self.pending.split().freeze();
        Ok(Some(Frame { conn_id, payload }))
    }

    fn next_length_prefixed(&mut self) -> Result<Option<Frame>, TunnelError> {
        let header_len = self.framing.header_len();
        if self.pending.len() < header_len {
            return Ok(None);
        }

        let payload_len = read_u16(&self.pending, STREAM_ID_SIZE) as usize;
        if payload_len > self.framing.max_payload() {
            return Err(TunnelError::FrameTooLarge(
                payload_len,
                self.framing.max_payload(),
            ));
        }
        if self.pending.len() < header_len + payload_len {
            return Ok(None);
        }

        let conn_id = read_u32(&self.pending, 0);
        self.pending.advance(header_len);
        let payload = self.pending.split_to(payload_len).freeze();
        Ok(Some(Frame { conn_id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_boundary_wire_layout() {
        let frame = Frame::new(7, Bytes::from_static(b"GET /\n"));
        let encoded = frame.encode(Framing::ReadBoundary).unwrap();
        assert_eq!(&encoded[..], b"\x00\x00\x00\x07GET /\n");
    }

    #[test]
    fn test_length_prefixed_wire_layout() {
        let frame = Frame::new(0x0102_0304, Bytes::from_static(b"abc"));
        let encoded = frame.encode(Framing::LengthPrefixed).unwrap();
        assert_eq!(&encoded[..], b"\x01\x02\x03\x04\x00\x03abc");
    }

    #[test]
    fn test_payload_ceiling() {
        assert_eq!(Framing::ReadBoundary.max_payload(), 2044);
        assert_eq!(Framing::LengthPrefixed.max_payload(), 2042);

        let frame = Frame::new(1, vec![0u8; 2043]);
        assert!(frame.encode(Framing::ReadBoundary).is_ok());
        assert!(matches!(
            frame.encode(Framing::LengthPrefixed),
            Err(TunnelError::FrameTooLarge(2043, 2042))
        ));
    }

    #[test]
    fn test_read_boundary_one_chunk_one_frame() {
        let mut decoder = FrameDecoder::new(Framing::ReadBoundary);
        decoder.push(b"\x00\x00\x00\x09hello");

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.conn_id, 9);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_read_boundary_short_chunk_is_malformed() {
        let mut decoder = FrameDecoder::new(Framing::ReadBoundary);
        decoder.push(b"\x00\x01");
        assert!(matches!(
            decoder.next_frame(),
            Err(TunnelError::MalformedFrame(_))
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_length_prefixed_coalesced_frames() {
        let mut wire = Frame::new(1, Bytes::from_static(b"one"))
            .encode(Framing::LengthPrefixed)
            .unwrap();
        wire.extend_from_slice(
            &Frame::new(2, Bytes::from_static(b"two!"))
                .encode(Framing::LengthPrefixed)
                .unwrap(),
        );

        let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
        decoder.push(&wire);

        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::new(1, Bytes::from_static(b"one")))
        );
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::new(2, Bytes::from_static(b"two!")))
        );
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_length_prefixed_split_frame() {
        let wire = Frame::new(5, Bytes::from_static(b"split payload"))
            .encode(Framing::LengthPrefixed)
            .unwrap();

        let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
        decoder.push(&wire[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&wire[3..9]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&wire[9..]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.conn_id, 5);
        assert_eq!(&frame.payload[..], b"split payload");
    }

    #[test]
    fn test_length_prefixed_rejects_oversized_length() {
        let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
        decoder.push(b"\x00\x00\x00\x01\xff\xff");
        assert!(matches!(
            decoder.next_frame(),
            Err(TunnelError::FrameTooLarge(65535, 2042))
        ));
    }

    #[test]
    fn test_write_header_in_place() {
        let mut buf = [0u8; FRAME_BUFFER_SIZE];
        let header = Framing::LengthPrefixed.header_len();
        buf[header..header + 2].copy_from_slice(b"hi");

        let total = Framing::LengthPrefixed.write_header(&mut buf, 0xabcd, 2);

        assert_eq!(total, 8);
        assert_eq!(&buf[..total], b"\x00\x00\xab\xcd\x00\x02hi");
    }

    #[test]
    fn test_framing_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            framing: Framing,
        }
        let w: Wrapper = toml::from_str("framing = \"read_boundary\"").unwrap();
        assert_eq!(w.framing, Framing::ReadBoundary);
    }
}
