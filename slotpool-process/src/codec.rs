//! Framed codec for talking to worker processes over their stdio.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound on one frame body.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Length-prefixed JSON codec for messages of type `T`.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames longer than `max` fail to decode (and to encode) with
    /// `InvalidData`.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            max_frame_length: max,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Frames past half the limit are logged at debug.
    fn is_near_limit(&self, len: usize) -> bool {
        len > self.max_frame_length / 2
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let item = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame_length {
            tracing::warn!(
                frame_bytes = json.len(),
                max_frame_bytes = self.max_frame_length,
                "Refusing to encode oversized frame"
            );
        } else if self.is_near_limit(json.len()) {
            tracing::debug!(
                frame_bytes = json.len(),
                max_frame_bytes = self.max_frame_length,
                "Frame is over half the size limit"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
