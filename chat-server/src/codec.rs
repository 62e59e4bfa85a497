//! Newline-delimited JSON framing.
//!
//! The decoder keeps whatever it has not consumed in the `BytesMut` that
//! `FramedRead` hands it, so a single socket read may produce no frame, one
//! frame, or several, and a frame may be spread over any number of reads.

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{CodecError, ProtocolError},
    message::{ClientFrame, ServerFrame},
};

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Server side of a connection: reads client frames, writes server frames.
pub type ServerCodec = FrameCodec<ClientFrame, ServerFrame>;

/// Client side of a connection: reads server frames, writes client frames.
pub type ClientCodec = FrameCodec<ServerFrame, ClientFrame>;

/// Decodes frames of type `In` and encodes frames of type `Out`.
///
/// Decoded items are `Result<In, ProtocolError>` so a malformed line is
/// reported without ending the stream; only transport failures and
/// oversized frames surface as `CodecError`.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    max_frame_length: usize,
    // Bytes of the buffer already scanned for a newline.
    next_index: usize,
    _frames: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
            _frames: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = Result<In, ProtocolError>;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(end) = newline else {
                if buf.len() > self.max_frame_length {
                    return Err(CodecError::FrameTooLong {
                        limit: self.max_frame_length,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            self.next_index = 0;
            if end > self.max_frame_length {
                return Err(CodecError::FrameTooLong {
                    limit: self.max_frame_length,
                });
            }

            let line = buf.split_to(end + 1);
            if let Some(frame) = parse_line(&line[..end]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        let rest = buf.split();
        Ok(parse_line(&rest))
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, frame: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(&frame).map_err(CodecError::Encode)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Returns `None` for blank lines so they are skipped silently.
fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<Result<T, ProtocolError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(ProtocolError::from))
}
