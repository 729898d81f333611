//! The wire contract between the HeronDB remote server and its clients.
//!
//! Request and response payloads are bincode. ForEach streams are framed as
//! `[len: u32 LE][payload]` where the payload is a bincode `(key, value)`
//! pair; the stream ends with an empty pair, and a pair whose key is
//! [`ERROR_KEY`] carries an error message instead of data.

mod http;

pub use http::{
    read_body, read_request_head, read_response_head, request_head, response_head, Head,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("truncated frame: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame too large: {0} bytes")]
    Oversize(u32),

    #[error("unknown op code {0}")]
    UnknownOp(u8),

    #[error("payload: {0}")]
    Payload(#[from] bincode::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations multiplexed over the `tx` and `noTx` routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Get = 1,
    Put = 2,
    Del = 3,
    Seq = 4,
    SetSeq = 5,
    ForEach = 6,
}

impl Op {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        Ok(match v {
            1 => Op::Get,
            2 => Op::Put,
            3 => Op::Del,
            4 => Op::Seq,
            5 => Op::SetSeq,
            6 => Op::ForEach,
            other => return Err(ProtoError::UnknownOp(other)),
        })
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Op::Get => "Get",
            Op::Put => "Put",
            Op::Del => "Del",
            Op::Seq => "Seq",
            Op::SetSeq => "SetSeq",
            Op::ForEach => "ForEach",
        })
    }
}

/// Body of `POST /tx/:db` and `POST /noTx/:db`.
///
/// `value` carries the already-encoded user value for `Put`, and a bincode
/// `u64` for `SetSeq`; it is empty otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: u8,
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl Request {
    pub fn new(op: Op, bucket: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self { op: op as u8, bucket: bucket.into(), key: key.into(), value }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Error payload carried by non-200 responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn encode(message: impl Into<String>) -> Vec<u8> {
        let body = ErrorBody { message: message.into() };
        // A struct of one string always serializes.
        bincode::serialize(&body).unwrap_or_default()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        bincode::deserialize(buf).ok()
    }
}

/// Server counters, served as bincode on `/stats` and JSON on `/stats.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub active_locks: u64,
    pub locks: u64,
    pub timeouts: u64,
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// Key of the stream frame that carries an error message.
pub const ERROR_KEY: &[u8] = b"___error";

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME: u32 = 64 << 20;

/// Encode one ForEach stream frame.
pub fn encode_frame(key: &[u8], value: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let payload = bincode::serialize(&(key, value))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// The end-of-stream marker: an empty pair.
pub fn terminator_frame() -> Vec<u8> {
    // Encoding two empty slices cannot fail.
    encode_frame(&[], &[]).unwrap_or_default()
}

/// Read one frame from an async stream.
pub async fn read_frame<R>(r: &mut R) -> Result<(Vec<u8>, Vec<u8>), ProtoError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(ProtoError::Oversize(len));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}
