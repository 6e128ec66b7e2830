//! Length-prefixed framing on the byte stream.
//!
//! Each frame on the wire is `[i64 frame_length_including_prefix][bytes payload]`.
//! Decoding accumulates bytes until a full frame is available, then emits the payload
//! as a single buffer; partial frames remain buffered across reads. This codec does not
//! interpret payloads, that is the message codec's job, layered on top via
//! `tokio_util::codec::Framed<_, FrameCodec>`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Frames are held to this size to bound memory use for a single connection; large
/// payloads (stream chunks, uploads) should be chunked by the caller rather than sent
/// as one oversized frame.
pub const MAX_FRAME_LENGTH: i64 = 128 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 8;

/// Decodes and encodes the `[i64 length][payload]` wire framing.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            // Held until a full 8-byte header has accumulated.
            return Ok(None);
        }

        let mut len_bytes = [0_u8; LENGTH_PREFIX_BYTES];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let frame_length = i64::from_be_bytes(len_bytes);

        if frame_length < LENGTH_PREFIX_BYTES as i64 || frame_length > MAX_FRAME_LENGTH {
            return Err(TransportError::Framing(format!(
                "frame length {frame_length} outside valid range [{LENGTH_PREFIX_BYTES}, {MAX_FRAME_LENGTH}]"
            )));
        }
        let frame_length = frame_length as usize;

        if src.len() < frame_length {
            // Partial frame: reserve the remainder and wait for more bytes.
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        let payload = src.split_to(frame_length - LENGTH_PREFIX_BYTES);
        Ok(Some(payload.freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        let frame_length = LENGTH_PREFIX_BYTES as i64 + payload.len() as i64;
        if frame_length > MAX_FRAME_LENGTH {
            return Err(TransportError::Framing(format!(
                "outbound frame of {frame_length} bytes exceeds max {MAX_FRAME_LENGTH}"
            )));
        }
        dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
        dst.put_i64(frame_length);
        dst.put(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        FrameCodec.encode(Bytes::copy_from_slice(payload), &mut dst).unwrap();
        dst
    }

    #[test]
    fn round_trips_a_single_frame() {
        let mut buf = encode(b"hello");
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_an_empty_payload() {
        let mut buf = encode(b"");
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn holds_a_partial_header() {
        let mut buf = BytesMut::from(&[0_u8, 0, 0, 0][..]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn holds_a_partial_payload() {
        let mut full = encode(b"0123456789");
        let mut partial = full.split_to(12);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_i64(-1);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_i64(MAX_FRAME_LENGTH + 1);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn decodes_two_consecutive_frames_from_one_buffer() {
        let mut buf = encode(b"first");
        buf.unsplit(encode(b"second"));
        let first = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"first");
        assert_eq!(&second[..], b"second");
    }
}
