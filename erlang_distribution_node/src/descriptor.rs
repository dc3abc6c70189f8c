//! Node identities and what a peer lookup knows about them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::DescriptorError;
use crate::etf::Atom;

/// Parsed `name@host` identity of a node.
///
/// Equality and hashing only look at the full name. Short names (no dot in
/// the host part) resolve to loopback, long names go through the system
/// resolver once, when the descriptor is created.
#[derive(Clone)]
pub struct NodeDescriptor {
    node_name: String,
    host_name: String,
    full_name: String,
    address: IpAddr,
    short: bool,
}

impl NodeDescriptor {
    /// Parses `name@host`, or a bare `name` on the local host.
    pub fn parse(input: &str) -> Result<Self, DescriptorError> {
        let input = input.trim();
        let (node_name, host_name) = match input.split_once('@') {
            Some((node, host)) => (node.to_owned(), host.to_owned()),
            None => (input.to_owned(), local_short_host()),
        };
        let valid = |part: &str| !part.is_empty() && !part.contains(|c: char| c.is_whitespace() || c == '@');
        if !valid(&node_name) || !valid(&host_name) {
            return Err(DescriptorError::Malformed(input.to_owned()));
        }

        let short = !host_name.contains('.');
        let address = if short {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            resolve(&host_name)?
        };

        Ok(NodeDescriptor {
            full_name: format!("{}@{}", node_name, host_name),
            node_name,
            host_name,
            address,
            short,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn is_short_name(&self) -> bool {
        self.short
    }

    /// Full name as the atom carried in pids and handshake messages.
    pub fn atom(&self) -> Atom {
        Atom::new(&self.full_name)
    }
}

fn local_short_host() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(|name| name.split('.').next().map(str::to_owned))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn resolve(host: &str) -> Result<IpAddr, DescriptorError> {
    let unresolved = |reason: String| DescriptorError::Unresolved {
        host: host.to_owned(),
        reason,
    };
    (host, 0)
        .to_socket_addrs()
        .map_err(|e| unresolved(e.to_string()))?
        .map(|addr| addr.ip())
        .next()
        .ok_or_else(|| unresolved("no addresses".to_owned()))
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}

impl Eq for NodeDescriptor {}

impl Hash for NodeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_name.hash(state)
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeDescriptor({} at {})", self.full_name, self.address)
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// Interned descriptors, owned by a node.
#[derive(Default)]
pub struct DescriptorCache {
    by_full_name: DashMap<String, Arc<NodeDescriptor>>,
    by_short_name: DashMap<String, Arc<NodeDescriptor>>,
    by_input: DashMap<String, Arc<NodeDescriptor>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interned descriptor for `input`, parsing it on first use.
    /// Concurrent callers racing on the same node all get the first
    /// descriptor inserted.
    pub fn get_or_parse(&self, input: &str) -> Result<Arc<NodeDescriptor>, DescriptorError> {
        if let Some(found) = self.by_input.get(input) {
            return Ok(found.value().clone());
        }
        if !input.contains('@') {
            if let Some(found) = self.by_short_name.get(input) {
                return Ok(found.value().clone());
            }
        }

        let parsed = NodeDescriptor::parse(input)?;
        let descriptor = self
            .by_full_name
            .entry(parsed.full_name.clone())
            .or_insert_with(|| Arc::new(parsed))
            .value()
            .clone();
        if descriptor.short {
            self.by_short_name
                .entry(descriptor.node_name.clone())
                .or_insert_with(|| descriptor.clone());
        }
        self.by_input
            .entry(input.to_owned())
            .or_insert_with(|| descriptor.clone());
        Ok(descriptor)
    }

    pub fn get(&self, full_name: &str) -> Option<Arc<NodeDescriptor>> {
        self.by_full_name.get(full_name).map(|d| d.value().clone())
    }

    /// Removes a descriptor and every alias pointing at it.
    pub fn evict(&self, full_name: &str) -> Option<Arc<NodeDescriptor>> {
        let (_, removed) = self.by_full_name.remove(full_name)?;
        self.by_short_name.retain(|_, d| d.full_name != full_name);
        self.by_input.retain(|_, d| d.full_name != full_name);
        Some(removed)
    }

    pub fn clear(&self) {
        self.by_full_name.clear();
        self.by_short_name.clear();
        self.by_input.clear();
    }

    pub fn len(&self) -> usize {
        self.by_full_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_full_name.is_empty()
    }
}

/// Inclusive range of distribution protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub low: u16,
    pub high: u16,
}

impl VersionRange {
    pub const fn new(low: u16, high: u16) -> Self {
        VersionRange { low, high }
    }

    pub fn overlaps(&self, other: &VersionRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    /// Common version two nodes speak: the lower of the two maxima, if the
    /// ranges overlap at all.
    pub fn negotiate(&self, other: &VersionRange) -> Option<u16> {
        if self.overlaps(other) {
            Some(self.high.min(other.high))
        } else {
            None
        }
    }

    pub fn contains(&self, version: u16) -> bool {
        (self.low..=self.high).contains(&version)
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        VersionRange::new(5, 6)
    }
}

/// Transport protocol code as published by the name service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    TcpIpV4,
    Other(u8),
}

impl Protocol {
    pub fn code(&self) -> u8 {
        match self {
            Protocol::TcpIpV4 => 0,
            Protocol::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Protocol::TcpIpV4,
            other => Protocol::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Visible node, `'M'` in the name service.
    Normal,
    /// Hidden node, `'H'` in the name service.
    Hidden,
}

impl NodeType {
    pub fn code(&self) -> u8 {
        match self {
            NodeType::Normal => b'M',
            NodeType::Hidden => b'H',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'M' => Some(NodeType::Normal),
            b'H' => Some(NodeType::Hidden),
            _ => None,
        }
    }
}

/// Everything needed to dial a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub descriptor: Arc<NodeDescriptor>,
    pub protocol: Protocol,
    pub node_type: NodeType,
    pub versions: VersionRange,
    pub port: u16,
}

impl RemoteNode {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.descriptor.address(), self.port)
    }
}
