// src/core/protocol/codec.rs

//! The stream codec: 4-byte big-endian length prefix followed by a
//! bincode-encoded [`Frame`].

use super::messages::Frame;
use crate::core::errors::StratusError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected instead of buffered.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = StratusError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| StratusError::Codec(format!("encode failed: {e}")))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(StratusError::Codec(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = StratusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(StratusError::Codec(format!(
                "incoming frame of {length} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }
        if src.len() < LENGTH_PREFIX_SIZE + length {
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);
        let (frame, _) =
            bincode::serde::decode_from_slice(&payload, bincode::config::standard())
                .map_err(|e| StratusError::Codec(format!("decode failed: {e}")))?;
        Ok(Some(frame))
    }
}
