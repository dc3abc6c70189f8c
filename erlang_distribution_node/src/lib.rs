//! A node that speaks the Erlang distribution protocol.
//!
//! A [`Node`] registers with a name service (normally EPMD), accepts and
//! dials connections to other nodes, and hosts [`Mailbox`]es that Erlang
//! processes can send to, link to and monitor like any other process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use erlang_distribution_node::{EpmdClient, Node, NodeConfig, Term};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::start(NodeConfig::new("rust@localhost", "secret"), Arc::new(EpmdClient::default())).await?;
//! let inbox = node.mailbox().name("inbox").build()?;
//! let message = inbox.receive().await?;
//! println!("got {}", message);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod control;
pub mod descriptor;
pub mod epmd;
pub mod error;
pub mod etf;
pub mod handshake;
pub mod mailbox;
mod node;

pub use config::{resolve_cookie, Compression, NodeConfig};
pub use descriptor::{NodeDescriptor, NodeType, VersionRange};
pub use epmd::{EpmdClient, PeerLookup, StaticLookup};
pub use error::{DecodeError, HandshakeError, NodeError, ReceiveError};
pub use etf::{Atom, Pid, Reference, Term};
pub use mailbox::{Delivery, Mailbox, MailboxHandle, MessageHandler};
pub use node::Node;
