use std::{
    collections::BTreeMap,
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Frames larger than this are rejected on both sides of the wire.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub const STATUS_OK: u8 = 0;
pub const STATUS_SERVICE_NOT_FOUND: u8 = 1;
pub const STATUS_INVOCATION_FAILED: u8 = 2;

/// One remote call on the wire. `request_id` is the correlation key: the
/// call's lifecycle ends when exactly one response with a matching id arrives
/// or its timeout elapses, whichever happens first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: u64,
    pub service_name: String,
    pub method_name: String,
    pub arguments: Vec<u8>,
    pub timeout_ms: u64,
    /// Propagated context; also the input to attribute routing.
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    /// 0 = success; anything else carries `error_message`.
    pub status: u8,
    pub result: Vec<u8>,
    pub error_message: String,
}

impl RpcResponse {
    pub fn ok(request_id: u64, result: Vec<u8>) -> Self {
        Self {
            request_id,
            status: STATUS_OK,
            result,
            error_message: String::new(),
        }
    }

    pub fn error(request_id: u64, status: u8, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            result: Vec::new(),
            error_message: message.into(),
        }
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh correlation key, unique within this process's pending tables.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Write one length-prefixed MessagePack frame: u32 big-endian length, then
/// the encoded payload.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = rmp_serde::to_vec(value).map_err(io::Error::other)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::other(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed MessagePack frame.
pub async fn read_frame<T, R>(reader: &mut R) -> io::Result<T>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::other(format!("frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    rmp_serde::from_slice(&payload).map_err(io::Error::other)
}
