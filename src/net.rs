//! Reference TCP transport.
//!
//! One length-prefixed bincode frame per request or response on a
//! persistent connection. [`serve`] accepts peers and dispatches
//! envelope commands to the local store; [`TcpPeerClient`] implements
//! [`PeerClient`] on the initiating side. Any other transport can
//! replace this module by implementing the same trait.

use anyhow::Result;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::{PeerClient, RpcError};
use crate::constants::RPC_PROCESSING_TIMEOUT;
use crate::store::KvStore;
use crate::types::{PeerSpec, Publication};
use crate::wire::{
    read_frame, write_frame, Command, DualMessages, FloodTopoSetParams, Frame, KeyDumpParams,
    KeySetParams, KvRequest, KvResponse,
};

/// Accept peer connections forever, one task per connection.
pub async fn serve<C: PeerClient>(listener: TcpListener, store: KvStore<C>) -> Result<()> {
    info!(addr = ?listener.local_addr(), "kvstore transport listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, store).await {
                warn!(peer = %peer_addr, error = ?err, "peer connection closed with error");
            }
        });
    }
}

async fn handle_connection<C: PeerClient>(stream: TcpStream, store: KvStore<C>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        // A frame that fails to decode poisons the whole stream: drop the
        // connection and let the peer reconnect.
        let frame = match read_frame::<_, KvRequest>(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame, closing connection");
                return Err(err);
            }
        };

        match frame {
            Frame::Ping => {
                write_frame::<_, KvResponse>(&mut writer, &Frame::Pong).await?;
            }
            Frame::Pong => {}
            Frame::Message(request) => {
                let response = dispatch(&store, request).await;
                write_frame(&mut writer, &Frame::Message(response)).await?;
            }
        }
    }
}

async fn dispatch<C: PeerClient>(store: &KvStore<C>, request: KvRequest) -> KvResponse {
    debug!(command = ?request.command, area = %request.area, "transport request");
    match request.command {
        Command::KeySet => {
            let Some(params) = request.key_set_params else {
                return KvResponse::Error("missing key_set_params".to_string());
            };
            match store.set_key_vals(&request.area, params).await {
                Ok(()) => KvResponse::Ok,
                Err(err) => KvResponse::Error(err.to_string()),
            }
        }
        Command::KeyDump => {
            let Some(params) = request.key_dump_params else {
                return KvResponse::Error("missing key_dump_params".to_string());
            };
            match store.dump_key_vals(&request.area, params).await {
                Ok(publication) => KvResponse::Publication(publication),
                Err(err) => KvResponse::Error(err.to_string()),
            }
        }
        Command::HashDump => {
            let Some(params) = request.key_dump_params else {
                return KvResponse::Error("missing key_dump_params".to_string());
            };
            match store.dump_hashes(&request.area, params).await {
                Ok(publication) => KvResponse::Publication(publication),
                Err(err) => KvResponse::Error(err.to_string()),
            }
        }
        Command::FloodTopoSet => {
            let Some(params) = request.flood_topo_set_params else {
                return KvResponse::Error("missing flood_topo_set_params".to_string());
            };
            match store.flood_topo_set(&request.area, params).await {
                Ok(()) => KvResponse::Ok,
                Err(err) => KvResponse::Error(err.to_string()),
            }
        }
        Command::DualMsg => {
            let Some(messages) = request.dual_messages else {
                return KvResponse::Error("missing dual_messages".to_string());
            };
            match store.process_dual(&request.area, messages).await {
                Ok(()) => KvResponse::Ok,
                Err(err) => KvResponse::Error(err.to_string()),
            }
        }
    }
}

/// Peer client over a persistent TCP connection. Requests are serialized
/// on the connection; each carries a bounded processing timeout.
pub struct TcpPeerClient {
    conn: Mutex<Connection>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl TcpPeerClient {
    async fn round_trip(&self, frame: Frame<KvRequest>) -> Result<Frame<KvResponse>, RpcError> {
        let mut conn = self.conn.lock().await;
        let exchange = async {
            write_frame(&mut conn.writer, &frame)
                .await
                .map_err(|err| RpcError::Transport(err.to_string()))?;
            match read_frame::<_, KvResponse>(&mut conn.reader).await {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(RpcError::Transport("connection closed by peer".to_string())),
                Err(err) => Err(RpcError::Deserialize(err.to_string())),
            }
        };
        timeout(RPC_PROCESSING_TIMEOUT, exchange)
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    async fn call(&self, request: KvRequest) -> Result<KvResponse, RpcError> {
        match self.round_trip(Frame::Message(request)).await? {
            Frame::Message(response) => Ok(response),
            other => Err(RpcError::Deserialize(format!(
                "unexpected frame in response position: {other:?}"
            ))),
        }
    }
}

impl PeerClient for TcpPeerClient {
    async fn connect(spec: &PeerSpec) -> Result<Self, RpcError> {
        let addr = format!("{}:{}", spec.peer_addr, spec.ctrl_port);
        let stream = timeout(RPC_PROCESSING_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| RpcError::Connect(format!("timed out connecting to {addr}")))?
            .map_err(|err| RpcError::Connect(format!("{addr}: {err}")))?;
        let (read_half, write_half) = stream.into_split();
        debug!(addr = %addr, "peer connection established");
        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: BufWriter::new(write_half),
            }),
        })
    }

    async fn get_filtered_key_vals(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> Result<Publication, RpcError> {
        match self.call(KvRequest::key_dump(area, params)).await? {
            KvResponse::Publication(publication) => Ok(publication),
            KvResponse::Error(message) => Err(RpcError::Remote(message)),
            KvResponse::Ok => Err(RpcError::Deserialize(
                "expected publication, got ack".to_string(),
            )),
        }
    }

    async fn set_key_vals(&self, area: &str, params: KeySetParams) -> Result<(), RpcError> {
        match self.call(KvRequest::key_set(area, params)).await? {
            KvResponse::Ok => Ok(()),
            KvResponse::Error(message) => Err(RpcError::Remote(message)),
            KvResponse::Publication(_) => Err(RpcError::Deserialize(
                "expected ack, got publication".to_string(),
            )),
        }
    }

    async fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> Result<(), RpcError> {
        match self.call(KvRequest::flood_topo_set(area, params)).await? {
            KvResponse::Ok => Ok(()),
            KvResponse::Error(message) => Err(RpcError::Remote(message)),
            KvResponse::Publication(_) => Err(RpcError::Deserialize(
                "expected ack, got publication".to_string(),
            )),
        }
    }

    async fn process_dual(&self, area: &str, messages: DualMessages) -> Result<(), RpcError> {
        match self.call(KvRequest::dual_msg(area, messages)).await? {
            KvResponse::Ok => Ok(()),
            KvResponse::Error(message) => Err(RpcError::Remote(message)),
            KvResponse::Publication(_) => Err(RpcError::Deserialize(
                "expected ack, got publication".to_string(),
            )),
        }
    }

    async fn status(&self) -> Result<(), RpcError> {
        match self.round_trip(Frame::Ping).await? {
            Frame::Pong => Ok(()),
            other => Err(RpcError::Deserialize(format!(
                "unexpected keepalive response: {other:?}"
            ))),
        }
    }
}
