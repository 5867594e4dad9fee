//! Length-prefixed framing for the reliable session channel
//!
//! Wire layout: `[u32 big-endian length N][N bytes body]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_HEADER_SIZE, MAX_FRAME_LEN};
use crate::error::NetworkError;

/// Prefix `body` with its length header as one contiguous buffer.
///
/// The result is queued on the link as a single write so two frames can
/// never interleave.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Reassembles frames from arbitrarily chunked stream reads
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append raw bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame body, if one is fully buffered.
    ///
    /// A declared length above the cap is an error; the caller must close
    /// the channel since the stream can no longer be resynchronised.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, NetworkError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_len {
            return Err(NetworkError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Feed `data` and collect every frame it completes, in arrival order
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Bytes>, NetworkError> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_partial_header_waits() {
        let mut decoder = FrameDecoder::new();
        let frame = encode_frame(b"hello");

        assert!(decoder.decode(&frame[..2]).unwrap().is_empty());
        assert!(decoder.decode(&frame[2..6]).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 6);

        let frames = decoder.decode(&frame[6..]).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"a"));
        wire.extend_from_slice(&encode_frame(b""));
        wire.extend_from_slice(&encode_frame(b"ccc"));
        wire.extend_from_slice(&encode_frame(b"dd")[..3]);

        let frames = decoder.decode(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"a");
        assert!(frames[1].is_empty());
        assert_eq!(&frames[2][..], b"ccc");
        assert_eq!(decoder.buffered(), 3);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_len(8);
        let frame = encode_frame(&[0u8; 9]);
        assert!(matches!(
            decoder.decode(&frame),
            Err(NetworkError::FrameTooLarge { len: 9, max: 8 })
        ));
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_frames(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
            cuts in proptest::collection::vec(1usize..32, 0..16),
        ) {
            let mut wire = Vec::new();
            for body in &bodies {
                wire.extend_from_slice(&encode_frame(body));
            }

            let mut whole = FrameDecoder::new();
            let expected = whole.decode(&wire).unwrap();

            let mut chunked = FrameDecoder::new();
            let mut got = Vec::new();
            let mut rest = &wire[..];
            for cut in cuts {
                if rest.is_empty() {
                    break;
                }
                let n = cut.min(rest.len());
                got.extend(chunked.decode(&rest[..n]).unwrap());
                rest = &rest[n..];
            }
            got.extend(chunked.decode(rest).unwrap());

            prop_assert_eq!(got, expected);
            prop_assert_eq!(chunked.buffered(), 0);
        }
    }
}
