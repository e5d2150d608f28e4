//! Message envelope and stream framing.
//!
//! ## Wire format
//!
//! ```text
//! length:  u32 big-endian   (size of body)
//! body:    zstd( bincode(message) ), checksummed
//! ```
//!
//! The body of a frame is exactly what [`serialize`] returns, so a body
//! compressed once (see [`crate::payload`]) can be written verbatim to
//! any number of connections via [`Outbound::Precompiled`]. Each body is
//! a self-contained zstd frame; no dictionary or back-reference state is
//! carried from one message to the next.

use std::io::{Read, Write};
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TesseraError;
use crate::event::{ClientEvent, ServerEvent};

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Largest accepted decompressed message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Favour speed: tile payloads are produced on the capture hot path.
const COMPRESSION_LEVEL: i32 = 1;

// ── Bodies ───────────────────────────────────────────────────────

/// Compress `message` into a standalone body.
pub fn serialize<T: Serialize + ?Sized>(message: &T) -> Result<Bytes, TesseraError> {
    let writer = compress_into(message, BytesMut::new().writer())?;
    Ok(writer.into_inner().freeze())
}

/// Inverse of [`serialize`]. Malformed or truncated input is an error,
/// never a partially filled value.
pub fn deserialize<T: DeserializeOwned>(body: &[u8]) -> Result<T, TesseraError> {
    let decoder = zstd::stream::read::Decoder::new(body).map_err(decode_error)?;
    let mut plain = Vec::new();
    decoder
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut plain)
        .map_err(decode_error)?;
    if plain.len() > MAX_MESSAGE_SIZE {
        return Err(TesseraError::Decode(format!(
            "message exceeds {MAX_MESSAGE_SIZE} bytes"
        )));
    }
    bincode::deserialize(&plain).map_err(|e| TesseraError::Decode(e.to_string()))
}

fn compress_into<T: Serialize + ?Sized, W: Write>(
    message: &T,
    writer: W,
) -> Result<W, TesseraError> {
    let mut encoder = zstd::stream::write::Encoder::new(writer, COMPRESSION_LEVEL)?;
    encoder.include_checksum(true)?;
    bincode::serialize_into(&mut encoder, message)?;
    Ok(encoder.finish()?)
}

fn decode_error(e: std::io::Error) -> TesseraError {
    TesseraError::Decode(e.to_string())
}

// ── Outbound ─────────────────────────────────────────────────────

/// Something to put on the wire.
#[derive(Debug, Clone)]
pub enum Outbound<T> {
    /// Compress this message while framing it.
    Message(T),
    /// A body produced earlier by [`serialize`]; written as-is.
    Precompiled(Bytes),
}

impl<T> From<T> for Outbound<T> {
    fn from(message: T) -> Self {
        Outbound::Message(message)
    }
}

// ── MessageCodec ─────────────────────────────────────────────────

/// Length-prefixed compressed message codec.
///
/// Decodes `In` values and encodes [`Outbound<Out>`] values. The server
/// uses `MessageCodec<ClientEvent, ServerEvent>`; a viewer uses the
/// mirror image.
pub struct MessageCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

/// Server side: reads viewer events, writes server events.
pub type ServerCodec = MessageCodec<ClientEvent, ServerEvent>;
/// Viewer side: the mirror image of [`ServerCodec`].
pub type ViewerCodec = MessageCodec<ServerEvent, ClientEvent>;

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = TesseraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TesseraError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        deserialize(&body).map(Some)
    }
}

impl<In, Out: Serialize> Encoder<Outbound<Out>> for MessageCodec<In, Out> {
    type Error = TesseraError;

    fn encode(&mut self, item: Outbound<Out>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0);

        let written = match item {
            Outbound::Message(message) => compress_into(&message, (&mut *dst).writer()).map(|_| ()),
            Outbound::Precompiled(body) => {
                dst.extend_from_slice(&body);
                Ok(())
            }
        };
        if let Err(e) = written {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start - LENGTH_PREFIX;
        if len > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(TesseraError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        dst[start..start + LENGTH_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
