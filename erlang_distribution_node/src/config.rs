use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::{NodeType, Protocol, VersionRange};
use crate::error::NodeError;
use crate::etf::consts::dist_flags::default_flags;
use crate::etf::DecodeLimits;

/// Environment variables consulted for a cookie, in order.
pub const COOKIE_ENV_VARS: [&str; 2] = ["ERLANG_COOKIE", "RELEASE_COOKIE"];

/// zlib settings for outbound message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    /// zlib level, `0..=9`.
    pub level: u32,
    /// Bodies whose encoding is at most this many bytes are sent as is.
    pub threshold: usize,
}

impl Default for Compression {
    fn default() -> Self {
        Compression {
            level: 6,
            threshold: 1024,
        }
    }
}

/// Everything needed to start a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub cookie: String,
    /// `0` binds an ephemeral port.
    pub listen_port: u16,
    pub versions: VersionRange,
    pub flags: u64,
    pub node_type: NodeType,
    pub protocol: Protocol,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Idle time after which an empty frame is written.
    pub tick_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub tick_timeout: Duration,
    pub max_frame_len: usize,
    /// Nesting and inflation bounds for terms read from peers.
    pub decode_limits: DecodeLimits,
    pub compression: Option<Compression>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, cookie: impl Into<String>) -> Self {
        NodeConfig {
            name: name.into(),
            cookie: cookie.into(),
            listen_port: 0,
            versions: VersionRange::default(),
            flags: default_flags(),
            node_type: NodeType::Normal,
            protocol: Protocol::TcpIpV4,
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(15),
            tick_timeout: Duration::from_secs(60),
            max_frame_len: 64 * 1024 * 1024,
            decode_limits: DecodeLimits::default(),
            compression: None,
        }
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ticks(mut self, interval: Duration, timeout: Duration) -> Self {
        self.tick_interval = interval;
        self.tick_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
        self.decode_limits = limits;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), NodeError> {
        if self.cookie.is_empty() {
            return Err(NodeError::Config("cookie must not be empty".into()));
        }
        if self.versions.low > self.versions.high {
            return Err(NodeError::Config(format!(
                "version range {}..={} is empty",
                self.versions.low, self.versions.high
            )));
        }
        if self.tick_interval.is_zero() || self.tick_timeout <= self.tick_interval {
            return Err(NodeError::Config(
                "tick timeout must be longer than a non-zero tick interval".into(),
            ));
        }
        if self.decode_limits.max_depth < 2 {
            return Err(NodeError::Config(
                "decode depth must allow at least two levels for control tuples".into(),
            ));
        }
        if let Some(compression) = self.compression {
            if compression.level > 9 {
                return Err(NodeError::Config(format!(
                    "compression level {} is out of range",
                    compression.level
                )));
            }
        }
        Ok(())
    }
}

/// Picks a cookie: `explicit`, then [`COOKIE_ENV_VARS`], then
/// `~/.erlang.cookie`.
pub fn resolve_cookie(explicit: Option<String>) -> Result<String, NodeError> {
    resolve_cookie_from(explicit, |var| std::env::var(var).ok(), dirs::home_dir())
}

fn resolve_cookie_from(
    explicit: Option<String>,
    env: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> Result<String, NodeError> {
    if let Some(cookie) = explicit.filter(|c| !c.is_empty()) {
        return Ok(cookie);
    }
    if let Some(cookie) = COOKIE_ENV_VARS.iter().find_map(|var| env(var).filter(|c| !c.is_empty())) {
        return Ok(cookie);
    }
    let path = home
        .map(|home| home.join(".erlang.cookie"))
        .ok_or_else(|| NodeError::Config("no cookie given and no home directory found".into()))?;
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => Ok(contents.trim().to_owned()),
        Ok(_) => Err(NodeError::Config(format!("{} is empty", path.display()))),
        Err(err) => Err(NodeError::Config(format!(
            "no cookie given and {} is unreadable: {}",
            path.display(),
            err
        ))),
    }
}
