//! A regular connection: established socket split into one reader task and
//! one writer task.
//!
//! The reader answers ticks, decodes frames and hands messages to the
//! [`InboundSink`] (the node). The writer drains the outbound queue and
//! writes a tick whenever the connection has been idle for the tick
//! interval. Either task ending closes the connection, and the sink hears
//! about it exactly once through [`InboundSink::connection_lost`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

pub use codec::{DistCodec, Frame};
pub use message::DistMessage;

use crate::config::{Compression, NodeConfig};
use crate::descriptor::NodeDescriptor;
use crate::error::NodeError;
use crate::etf::{AtomCache, DecodeLimits};
use crate::handshake::Established;

mod codec;
mod message;

/// Empty replies closer together than this are not written.
const TOCK_SUPPRESSION: Duration = Duration::from_secs(1);

/// Receiver of everything a connection reads.
pub trait InboundSink: Send + Sync {
    fn deliver(&self, connection: &Arc<Connection>, message: DistMessage);

    fn connection_lost(&self, connection: &Arc<Connection>);
}

enum Outgoing {
    Message(Bytes),
    Tock,
    Close,
}

pub struct Connection {
    peer: Arc<NodeDescriptor>,
    flags: u64,
    version: u16,
    creation: u32,
    compression: Option<Compression>,
    outbound: UnboundedSender<Outgoing>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer.full_name())
            .field("version", &self.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Starts the reader and writer tasks over an established stream.
    pub fn spawn<S>(
        stream: S,
        established: Established,
        config: &NodeConfig,
        cache: Arc<AtomCache>,
        sink: Weak<dyn InboundSink>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, queue) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            peer: established.peer,
            flags: established.flags,
            version: established.version,
            creation: established.creation,
            compression: config.compression,
            outbound,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        log::info!(
            "connection to {} up (version {}, flags {:#x})",
            connection.peer,
            connection.version,
            connection.flags
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let codec = DistCodec::new(config.max_frame_len);
        tokio::spawn(write_loop(
            connection.clone(),
            FramedWrite::new(write_half, codec.clone()),
            queue,
            config.tick_interval,
        ));
        tokio::spawn(read_loop(
            connection.clone(),
            FramedRead::new(read_half, codec),
            cache,
            config.decode_limits,
            sink,
            config.tick_timeout,
        ));
        connection
    }

    pub fn peer(&self) -> &Arc<NodeDescriptor> {
        &self.peer
    }

    /// Flags both sides advertised.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn creation(&self) -> u32 {
        self.creation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encodes `message` and queues it behind everything sent before.
    pub fn send(&self, message: &DistMessage) -> Result<(), NodeError> {
        if self.is_closed() {
            return Err(NodeError::ConnectionClosed(self.peer.full_name().to_owned()));
        }
        let data = message.encode(self.compression.as_ref())?;
        log::trace!("-> {} {}", self.peer, message.control.name());
        self.outbound
            .send(Outgoing::Message(Bytes::from(data)))
            .map_err(|_| NodeError::ConnectionClosed(self.peer.full_name().to_owned()))
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("closing connection to {}", self.peer);
            let _ = self.outbound.send(Outgoing::Close);
            self.shutdown.notify_one();
        }
    }
}

/// Decides whether an empty reply may be written.
#[derive(Debug, Default)]
struct EmptyFrames {
    last: Option<Instant>,
}

impl EmptyFrames {
    fn written(&mut self, now: Instant) {
        self.last = Some(now);
    }

    fn may_answer(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= TOCK_SUPPRESSION,
            None => true,
        }
    }
}

async fn write_loop<W>(
    connection: Arc<Connection>,
    mut frames: FramedWrite<W, DistCodec>,
    mut queue: UnboundedReceiver<Outgoing>,
    tick_interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut empty = EmptyFrames::default();
    loop {
        let frame = match tokio::time::timeout(tick_interval, queue.recv()).await {
            Err(_) => Frame::Tick,
            Ok(None) | Ok(Some(Outgoing::Close)) => break,
            Ok(Some(Outgoing::Message(data))) => Frame::Message(data),
            Ok(Some(Outgoing::Tock)) => {
                if !empty.may_answer(Instant::now()) {
                    continue;
                }
                Frame::Tick
            }
        };
        if frame == Frame::Tick {
            empty.written(Instant::now());
        }
        if let Err(err) = frames.send(frame).await {
            log::warn!("write to {} failed: {}", connection.peer, err);
            break;
        }
    }
    let _ = frames.get_mut().shutdown().await;
    connection.close();
}

async fn read_loop<R>(
    connection: Arc<Connection>,
    mut frames: FramedRead<R, DistCodec>,
    cache: Arc<AtomCache>,
    limits: DecodeLimits,
    sink: Weak<dyn InboundSink>,
    tick_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = connection.shutdown.notified() => break,
            next = tokio::time::timeout(tick_timeout, frames.next()) => next,
        };
        match next {
            Err(_) => {
                log::warn!("{} silent for {:?}, closing", connection.peer, tick_timeout);
                break;
            }
            Ok(None) => {
                log::debug!("{} closed the connection", connection.peer);
                break;
            }
            Ok(Some(Err(err))) => {
                log::warn!("read from {} failed: {}", connection.peer, err);
                break;
            }
            Ok(Some(Ok(Frame::Tick))) => {
                log::trace!("tick from {}", connection.peer);
                let _ = connection.outbound.send(Outgoing::Tock);
            }
            Ok(Some(Ok(Frame::Message(data)))) => {
                let message = match DistMessage::decode(&data, &*cache, &limits) {
                    Ok(message) => message,
                    Err(err) => {
                        log::error!("undecodable message from {}: {}", connection.peer, err);
                        break;
                    }
                };
                log::trace!("<- {} {}", connection.peer, message.control.name());
                match sink.upgrade() {
                    Some(sink) => sink.deliver(&connection, message),
                    None => break,
                }
            }
        }
    }
    connection.close();
    if let Some(sink) = sink.upgrade() {
        sink.connection_lost(&connection);
    }
}
