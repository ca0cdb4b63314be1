use crate::protocol::MemberNode;
use crate::region::Region;
use crate::snapshot::EntrySnapshot;
use crate::types::{ClusterMessage, EntryError};
use rkyv::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct NetworkServer {
    node: Arc<MemberNode>,
    listener: TcpListener,
}

impl NetworkServer {
    pub async fn bind(node: Arc<MemberNode>, address: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { node, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn start(self) -> Result<(), EntryError> {
        info!("Member {} listening on {}", self.node.info.id, self.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            debug!("Accepted connection from {}", peer_addr);

            let node = Arc::clone(&self.node);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, node).await {
                    warn!("Error handling connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(mut socket: TcpStream, node: Arc<MemberNode>) -> Result<(), EntryError> {
    while let Some(message) = read_frame(&mut socket).await? {
        debug!("Server received message: {:?}", message);

        let response = node.handle_message(message);
        write_frame(&mut socket, &response).await?;
    }
    Ok(())
}

pub struct NetworkClient {
    stream: TcpStream,
}

impl NetworkClient {
    pub async fn connect(address: SocketAddr) -> Result<Self, EntryError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: ClusterMessage) -> Result<Option<ClusterMessage>, EntryError> {
        write_frame(&mut self.stream, &message).await?;
        read_frame(&mut self.stream).await
    }

    /// Fetches `key` from the member's copy of `region_path` and binds the
    /// decoded snapshot to `bind_to`.
    pub async fn fetch_entry(
        &mut self,
        region_path: &str,
        key: &str,
        allow_tombstones: bool,
        bind_to: Arc<dyn Region>,
    ) -> Result<Option<EntrySnapshot>, EntryError> {
        let request = ClusterMessage::EntryRequest {
            region: region_path.to_string(),
            key: key.to_string(),
            allow_tombstones,
        };
        match self.send(request).await? {
            Some(ClusterMessage::EntryResponse { member, payload }) => {
                debug!("Fetched {} from member {}", key, member);
                payload
                    .map(|bytes| EntrySnapshot::decode(&mut bytes.as_slice(), bind_to))
                    .transpose()
            }
            Some(ClusterMessage::UnknownRegion { region }) => Err(EntryError::RegionNotFound(region)),
            Some(ClusterMessage::RequestFailed { member, reason }) => Err(EntryError::Network(
                format!("member {member} failed to serve {key}: {reason}"),
            )),
            other => Err(EntryError::Network(format!(
                "unexpected response to entry request: {other:?}"
            ))),
        }
    }
}

// Frames are a big-endian u32 length followed by an rkyv archive.
async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &ClusterMessage,
) -> Result<(), EntryError> {
    let serialized =
        rkyv::to_bytes::<_, 1024>(message).map_err(|e| EntryError::Network(e.to_string()))?;
    let len = u32::try_from(serialized.len())
        .map_err(|_| EntryError::Network(format!("frame too large: {} bytes", serialized.len())))?;
    stream.write_u32(len).await?;
    stream.write_all(&serialized).await?;
    stream.flush().await?;
    Ok(())
}

/// `None` when the peer closed the connection between frames. A close inside
/// a frame is an error.
async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<ClusterMessage>, EntryError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = stream.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(EntryError::Network(format!(
                "connection closed after {filled} header bytes"
            )));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(EntryError::Network(format!("frame too large: {len} bytes")));
    }
    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).await?;
    decode_message(&buf).map(Some)
}

fn decode_message(bytes: &[u8]) -> Result<ClusterMessage, EntryError> {
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = rkyv::check_archived_root::<ClusterMessage>(&aligned)
        .map_err(|e| EntryError::Network(format!("invalid frame: {e:?}")))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| EntryError::Network(format!("{e:?}")))
}
