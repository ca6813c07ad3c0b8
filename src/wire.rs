//! Binary wire protocol shared by all peer transports.
//!
//! Every exchange is a length-prefixed bincode frame. The envelope is
//! [`KvRequest`]: a command, the target area, and the command's payload.
//! Field meaning must stay stable across versions; peers with mismatched
//! envelopes drop frames as deserialization failures.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_WIRE_FRAME_BYTES;
use crate::types::{FilterOperator, KeyVals, Publication};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    KeySet,
    KeyDump,
    HashDump,
    DualMsg,
    FloodTopoSet,
}

/// Payload of `KEY_SET`: a merge-and-flood request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySetParams {
    pub key_vals: KeyVals,
    /// Flood trail; the last entry is the upstream sender.
    pub node_ids: Option<Vec<String>>,
    pub flood_root_id: Option<String>,
    /// Wall-clock stamp at flood time, for propagation-delay sampling.
    pub timestamp_ms: Option<i64>,
    pub sender_id: Option<String>,
}

/// Payload of `KEY_DUMP` / `HASH_DUMP`: a filtered dump, optionally with
/// the requester's digests to turn the response into a difference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyDumpParams {
    pub keys: Vec<String>,
    pub originator_ids: HashSet<String>,
    pub operator: FilterOperator,
    /// Requester's `{key -> (version, originator, ttl_version, hash)}`
    /// view; values carry no payload.
    pub key_val_hashes: Option<KeyVals>,
    pub sender_id: Option<String>,
    /// Respond with metadata only (hash-dump semantics over KEY_DUMP).
    pub do_not_publish_value: bool,
}

/// Payload of `FLOOD_TOPO_SET`. Accepted for wire compatibility; this
/// build floods to every initialized peer and ignores topology hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodTopoSetParams {
    pub root_id: String,
    pub src_id: String,
    pub set_child: bool,
    pub all_roots: bool,
}

/// Opaque distributed-spanning-tree payload carried for peers that still
/// speak the flood-optimization protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DualMessages(pub Vec<u8>);

/// Request envelope. Exactly the payload matching `command` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvRequest {
    pub command: Command,
    pub area: String,
    pub key_set_params: Option<KeySetParams>,
    pub key_dump_params: Option<KeyDumpParams>,
    pub flood_topo_set_params: Option<FloodTopoSetParams>,
    pub dual_messages: Option<DualMessages>,
}

impl KvRequest {
    pub fn key_set(area: impl Into<String>, params: KeySetParams) -> Self {
        Self {
            command: Command::KeySet,
            area: area.into(),
            key_set_params: Some(params),
            key_dump_params: None,
            flood_topo_set_params: None,
            dual_messages: None,
        }
    }

    pub fn key_dump(area: impl Into<String>, params: KeyDumpParams) -> Self {
        Self {
            command: Command::KeyDump,
            area: area.into(),
            key_set_params: None,
            key_dump_params: Some(params),
            flood_topo_set_params: None,
            dual_messages: None,
        }
    }

    pub fn hash_dump(area: impl Into<String>, params: KeyDumpParams) -> Self {
        Self {
            command: Command::HashDump,
            ..Self::key_dump(area, params)
        }
    }

    pub fn flood_topo_set(area: impl Into<String>, params: FloodTopoSetParams) -> Self {
        Self {
            command: Command::FloodTopoSet,
            area: area.into(),
            key_set_params: None,
            key_dump_params: None,
            flood_topo_set_params: Some(params),
            dual_messages: None,
        }
    }

    pub fn dual_msg(area: impl Into<String>, messages: DualMessages) -> Self {
        Self {
            command: Command::DualMsg,
            area: area.into(),
            key_set_params: None,
            key_dump_params: None,
            flood_topo_set_params: None,
            dual_messages: Some(messages),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvResponse {
    Ok,
    Publication(Publication),
    Error(String),
}

/// Hand-off envelope between a connection task and the store, including
/// the transport-level keepalive ping which is not a store command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame<T> {
    Message(T),
    Ping,
    Pong,
}

/// Write one length-prefixed bincode frame.
///
/// Serialization of our own types failing is a programming error; the
/// process aborts rather than silently dropping protocol state.
pub async fn write_frame<W, T>(writer: &mut W, frame: &Frame<T>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(frame).expect("wire frame serialization cannot fail");
    let len = u32::try_from(bytes.len()).expect("wire frame exceeds u32 length");
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<Frame<T>>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_WIRE_FRAME_BYTES {
        bail!("frame length {len} exceeds limit {MAX_WIRE_FRAME_BYTES}");
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let frame = bincode::deserialize(&buf).context("failed to decode wire frame")?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[tokio::test]
    async fn test_request_frame_round_trip() {
        let mut params = KeySetParams::default();
        params.key_vals.insert(
            "adj:node-1".to_string(),
            Value::new(4, "node-1", Some(b"payload".to_vec()), 30_000, 2),
        );
        params.node_ids = Some(vec!["node-1".to_string()]);
        let request = KvRequest::key_set("spine", params);

        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Message(request.clone()))
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Frame<KvRequest> = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, Frame::Message(request));
    }

    #[tokio::test]
    async fn test_hash_dump_request_round_trip() {
        let request = KvRequest::hash_dump("spine", KeyDumpParams::default());
        assert_eq!(request.command, Command::HashDump);

        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Message(request.clone()))
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Frame<KvRequest> = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, Frame::Message(request));
    }

    #[tokio::test]
    async fn test_ping_and_eof() {
        let mut buf = Vec::new();
        write_frame::<_, KvResponse>(&mut buf, &Frame::Ping).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Frame<KvResponse> = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, Frame::Ping);
        let eof: Option<Frame<KvResponse>> = read_frame(&mut cursor).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_WIRE_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let res: Result<Option<Frame<KvResponse>>> = read_frame(&mut cursor).await;
        assert!(res.is_err());
    }
}
