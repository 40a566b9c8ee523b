use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::rpc::EngineMessage;
use super::EngineError;

/// Maximum frame payload size: 16 MB (capture buffers travel inline).
pub const MAX_FRAME_SIZE: usize = 16 * 1_048_576;

/// Length-prefixed JSON codec for the engine control protocol.
pub struct EngineCodec {
    inner: LengthDelimitedCodec,
}

impl EngineCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Default for EngineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<EngineMessage> for EngineCodec {
    type Error = EngineError;

    fn encode(&mut self, item: EngineMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(EngineError::FrameTooLarge {
                size: json.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

impl Decoder for EngineCodec {
    type Item = EngineMessage;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
