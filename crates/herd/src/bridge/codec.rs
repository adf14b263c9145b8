//! Framed codecs for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, duplex streams).
//!
//! Decoding is split in two layers: framing errors are `io::Error`s and end
//! the stream, while a well-framed but malformed message is yielded as
//! `Err(ProtocolError)` so the reader can drop it and keep going.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{ProtocolError, Validate};

fn framing() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .new_codec()
}

/// Decode and validate one frame body.
pub fn decode_frame<T>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: DeserializeOwned + Validate,
{
    let item: T = serde_json::from_slice(bytes)?;
    item.validate()?;
    Ok(item)
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Encoding only needs `Serialize`; decoding yields validated messages, with
/// per-frame protocol errors surfaced as items rather than stream errors.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: framing(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Validate> Decoder for JsonCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(decode_frame(&bytes))),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Raw frame encoder, for writing bytes that did not come from a typed message.
///
/// Only used to inject malformed frames when exercising protocol error paths.
#[derive(Default)]
pub struct RawFrameCodec;

impl Encoder<Bytes> for RawFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        framing().encode(item, dst)
    }
}
