use bytes::Bytes;

use super::{BackMsg, ForwardMsg};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
}

pub fn decode_forward_msg(frame: &[u8]) -> Result<ForwardMsg, ProtocolError> {
    decode(frame, "forward message")
}

pub fn encode_forward_msg(msg: &ForwardMsg) -> Result<Bytes, ProtocolError> {
    encode(msg, "forward message")
}

pub fn decode_back_msg(frame: &[u8]) -> Result<BackMsg, ProtocolError> {
    decode(frame, "back message")
}

pub fn encode_back_msg(msg: &BackMsg) -> Result<Bytes, ProtocolError> {
    encode(msg, "back message")
}

fn decode<T: serde::de::DeserializeOwned>(
    frame: &[u8],
    what: &'static str,
) -> Result<T, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    serde_json::from_slice(frame).map_err(|source| ProtocolError::Decode { what, source })
}

fn encode<T: serde::Serialize>(msg: &T, what: &'static str) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::Encode { what, source })
}
