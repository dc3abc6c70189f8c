//! Peer lookup: where does a node listen, and which versions does it speak.
//!
//! [`EpmdClient`] talks to the Erlang port mapper daemon, [`StaticLookup`]
//! serves a fixed in-memory table.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    pin,
    sync::Mutex,
};

use crate::descriptor::{NodeDescriptor, NodeType, Protocol, RemoteNode, VersionRange};
use crate::error::LookupError;

pub const EPMD_PORT: u16 = 4369;

const NAMES_REQ: u8 = 110;
const ALIVE2_X_RESP: u8 = 118;
const PORT2_RESP: u8 = 119;
const ALIVE2_REQ: u8 = 120;
const ALIVE2_RESP: u8 = 121;
const PORT_PLEASE2_REQ: u8 = 122;

/// What a node publishes about itself when it starts listening.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub descriptor: Arc<NodeDescriptor>,
    pub port: u16,
    pub node_type: NodeType,
    pub protocol: Protocol,
    pub versions: VersionRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Incarnation number stamped into every pid, port and reference.
    pub creation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDetails {
    pub name: String,
    pub port: u16,
}

/// Name service consulted by a node.
#[async_trait]
pub trait PeerLookup: Send + Sync {
    async fn register(&self, local: &LocalNode) -> Result<Registration, LookupError>;

    /// `Ok(None)` when the service does not know the node.
    async fn lookup(&self, descriptor: &Arc<NodeDescriptor>) -> Result<Option<RemoteNode>, LookupError>;

    async fn unregister(&self, local: &NodeDescriptor) -> Result<(), LookupError>;
}

/// Client for the Erlang port mapper daemon.
///
/// Registration keeps its socket open; EPMD forgets the node as soon as
/// that socket closes.
pub struct EpmdClient {
    port: u16,
    registration: Mutex<Option<TcpStream>>,
}

impl Default for EpmdClient {
    fn default() -> Self {
        Self::new(EPMD_PORT)
    }
}

impl EpmdClient {
    pub fn new(port: u16) -> Self {
        EpmdClient {
            port,
            registration: Mutex::new(None),
        }
    }

    /// Lists the nodes registered with the daemon on `host`.
    pub async fn names(&self, host: IpAddr) -> Result<Vec<NodeDetails>, LookupError> {
        let socket = TcpStream::connect(SocketAddr::new(host, self.port)).await?;
        read_all_nodes_stream(socket).await
    }
}

#[async_trait]
impl PeerLookup for EpmdClient {
    async fn register(&self, local: &LocalNode) -> Result<Registration, LookupError> {
        let mut guard = self.registration.lock().await;
        if guard.is_some() {
            return Err(LookupError::Refused("node is already registered".into()));
        }
        let mut socket = TcpStream::connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)).await?;
        let registration = register_node_stream(&mut socket, local).await?;
        log::debug!(
            "registered {} with epmd, creation {}",
            local.descriptor,
            registration.creation
        );
        *guard = Some(socket);
        Ok(registration)
    }

    async fn lookup(&self, descriptor: &Arc<NodeDescriptor>) -> Result<Option<RemoteNode>, LookupError> {
        let socket = TcpStream::connect(SocketAddr::new(descriptor.address(), self.port)).await?;
        get_dist_port_stream(socket, descriptor).await
    }

    async fn unregister(&self, local: &NodeDescriptor) -> Result<(), LookupError> {
        if let Some(mut socket) = self.registration.lock().await.take() {
            log::debug!("unregistering {} from epmd", local);
            socket.shutdown().await?;
        }
        Ok(())
    }
}

pub async fn read_all_nodes_stream(
    socket: impl AsyncRead + AsyncWrite,
) -> Result<Vec<NodeDetails>, LookupError> {
    pin!(socket);

    socket.write_u16(1).await?;
    socket.write_u8(NAMES_REQ).await?;

    let _epmd_port_no = socket.read_u32().await?;

    let mut nodes = Vec::new();
    let mut buf = String::new();
    let mut reader = BufReader::new(socket);
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            break;
        }
        let malformed = || LookupError::Malformed(buf.trim_end().to_owned());
        let (a, b) = buf.split_once(" at port ").ok_or_else(malformed)?;
        let port: u16 = b.trim().parse().map_err(|_| malformed())?;
        let name = a.strip_prefix("name ").ok_or_else(malformed)?;
        nodes.push(NodeDetails {
            name: name.to_owned(),
            port,
        });
    }

    Ok(nodes)
}

pub async fn register_node_stream(
    socket: &mut (impl AsyncRead + AsyncWrite + Unpin),
    local: &LocalNode,
) -> Result<Registration, LookupError> {
    let name = local.descriptor.node_name().as_bytes();
    let mut data = Vec::with_capacity(13 + name.len());
    data.push(ALIVE2_REQ);
    data.extend_from_slice(&local.port.to_be_bytes());
    data.push(local.node_type.code());
    data.push(local.protocol.code());
    data.extend_from_slice(&local.versions.high.to_be_bytes());
    data.extend_from_slice(&local.versions.low.to_be_bytes());
    data.extend_from_slice(&(name.len() as u16).to_be_bytes());
    data.extend_from_slice(name);
    data.extend_from_slice(&0u16.to_be_bytes());

    socket.write_u16(data.len() as u16).await?;
    socket.write_all(&data).await?;

    let typ = socket.read_u8().await?;
    let result = socket.read_u8().await?;
    let creation = match typ {
        ALIVE2_X_RESP => socket.read_u32().await?,
        ALIVE2_RESP => socket.read_u16().await? as u32,
        other => return Err(LookupError::Malformed(format!("unknown reply {} from epmd", other))),
    };
    if result > 0 {
        return Err(LookupError::Refused(format!(
            "failed to register node in local epmd (error {})",
            result
        )));
    }

    Ok(Registration { creation })
}

pub async fn get_dist_port_stream(
    socket: impl AsyncRead + AsyncWrite,
    descriptor: &Arc<NodeDescriptor>,
) -> Result<Option<RemoteNode>, LookupError> {
    pin!(socket);
    let name = descriptor.node_name();

    socket.write_u16(1 + name.len() as u16).await?;
    socket.write_u8(PORT_PLEASE2_REQ).await?;
    socket.write_all(name.as_bytes()).await?;

    let typ = socket.read_u8().await?;
    if typ != PORT2_RESP {
        return Err(LookupError::Malformed(format!("bad reply from epmd (typ: {})", typ)));
    }
    let result = socket.read_u8().await?;
    if result > 0 {
        log::debug!("epmd does not know {} (result {})", descriptor, result);
        return Ok(None);
    }

    let port = socket.read_u16().await?;
    let node_type = socket.read_u8().await?;
    let protocol = socket.read_u8().await?;
    let high = socket.read_u16().await?;
    let low = socket.read_u16().await?;

    let name_len = socket.read_u16().await?;
    let mut node_name = vec![0u8; name_len as usize];
    socket.read_exact(&mut node_name).await?;
    let extra_len = socket.read_u16().await?;
    let mut extra = vec![0u8; extra_len as usize];
    socket.read_exact(&mut extra).await?;

    let node_type = NodeType::from_code(node_type)
        .ok_or_else(|| LookupError::Malformed(format!("node type {}", node_type)))?;
    log::trace!(
        "epmd: {} listens on {} ({:?}, versions {}..={})",
        String::from_utf8_lossy(&node_name),
        port,
        node_type,
        low,
        high
    );

    Ok(Some(RemoteNode {
        descriptor: descriptor.clone(),
        protocol: Protocol::from_code(protocol),
        node_type,
        versions: VersionRange::new(low, high),
        port,
    }))
}

/// In-memory lookup table. Nodes sharing one `StaticLookup` find each other
/// through their registrations.
#[derive(Default)]
pub struct StaticLookup {
    nodes: DashMap<String, RemoteNode>,
    next_creation: AtomicU32,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, remote: RemoteNode) {
        self.nodes.insert(remote.descriptor.full_name().to_owned(), remote);
    }

    pub fn remove(&self, full_name: &str) -> Option<RemoteNode> {
        self.nodes.remove(full_name).map(|(_, remote)| remote)
    }
}

#[async_trait]
impl PeerLookup for StaticLookup {
    async fn register(&self, local: &LocalNode) -> Result<Registration, LookupError> {
        self.insert(RemoteNode {
            descriptor: local.descriptor.clone(),
            protocol: local.protocol,
            node_type: local.node_type,
            versions: local.versions,
            port: local.port,
        });
        let creation = self.next_creation.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Registration { creation })
    }

    async fn lookup(&self, descriptor: &Arc<NodeDescriptor>) -> Result<Option<RemoteNode>, LookupError> {
        Ok(self.nodes.get(descriptor.full_name()).map(|r| r.value().clone()))
    }

    async fn unregister(&self, local: &NodeDescriptor) -> Result<(), LookupError> {
        self.remove(local.full_name());
        Ok(())
    }
}
