use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::wire::Stanza;

/// Frames larger than this are refused in both directions.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1_024 * 1_024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stanza framing failed")]
    Io(#[from] io::Error),
    #[error("stanza of {size} bytes exceeds the {limit} byte frame limit")]
    Oversized { size: usize, limit: usize },
    #[error("malformed stanza")]
    Malformed(#[source] serde_json::Error),
}

/// Length-prefixed JSON framing for [`Stanza`]s on a byte transport.
#[derive(Debug)]
pub struct StanzaCodec {
    frames: LengthDelimitedCodec,
    limit: usize,
}

impl StanzaCodec {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .max_frame_length(limit)
            .new_codec();

        Self { frames, limit }
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for StanzaCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for StanzaCodec {
    type Item = Stanza;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(CodecError::Malformed)
    }
}

impl Encoder<Stanza> for StanzaCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Stanza, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(CodecError::Malformed)?;

        if json.len() > self.limit {
            return Err(CodecError::Oversized {
                size: json.len(),
                limit: self.limit,
            });
        }

        self.frames.encode(Bytes::from(json), dst)?;

        Ok(())
    }
}
