//! The node: listener, connection table, process tables and routing.
//!
//! Everything a connection reads ends up in [`NodeInner::route`]. Local
//! sends never touch a socket; remote sends go through the connection to
//! the pid's node, which is dialed on first use. Concurrent dials to one
//! peer share a single handshake.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::NodeConfig;
use crate::connection::{Connection, DistMessage, InboundSink};
use crate::control::{ControlMessage, Destination};
use crate::descriptor::{DescriptorCache, NodeDescriptor};
use crate::epmd::{LocalNode, PeerLookup};
use crate::error::{HandshakeError, NodeError, ReceiveError};
use crate::etf::consts::dist_flags::DFLAG_UNLINK_ID;
use crate::etf::{Atom, AtomCache, Pid, Reference, Term};
use crate::handshake::{self, Established, LocalIdentity};
use crate::mailbox::{Delivery, MailboxBuilder, MailboxHandle, MessageHandler, Process};

type PendingConnect = Shared<BoxFuture<'static, Result<Arc<Connection>, NodeError>>>;

fn atom(name: &str) -> Term {
    Term::atom(name)
}

/// A running node. Clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    me: Weak<NodeInner>,
    config: NodeConfig,
    descriptor: Arc<NodeDescriptor>,
    atom: Atom,
    creation: u32,
    port: u16,
    lookup: Arc<dyn PeerLookup>,
    descriptors: DescriptorCache,
    atoms: Arc<AtomCache>,
    processes: DashMap<Pid, Arc<Process>>,
    names: DashMap<Atom, Arc<Process>>,
    connections: DashMap<String, Arc<Connection>>,
    pending: DashMap<String, PendingConnect>,
    next_pid: AtomicU64,
    next_ref: AtomicU64,
    next_unlink: AtomicU64,
    closed: AtomicBool,
    stop_accepting: Arc<Notify>,
}

impl Node {
    /// Binds the listener, registers with `lookup` and starts accepting.
    pub async fn start(config: NodeConfig, lookup: Arc<dyn PeerLookup>) -> Result<Node, NodeError> {
        config.validate()?;
        let descriptors = DescriptorCache::new();
        let descriptor = descriptors.get_or_parse(&config.name)?;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port)).await?;
        let port = listener.local_addr()?.port();
        let registration = lookup
            .register(&LocalNode {
                descriptor: descriptor.clone(),
                port,
                node_type: config.node_type,
                protocol: config.protocol,
                versions: config.versions,
            })
            .await?;
        log::info!(
            "node {} listening on port {} (creation {})",
            descriptor,
            port,
            registration.creation
        );

        let stop_accepting = Arc::new(Notify::new());
        let inner = Arc::new_cyclic(|me| NodeInner {
            me: me.clone(),
            atom: descriptor.atom(),
            descriptor,
            creation: registration.creation,
            port,
            lookup,
            descriptors,
            atoms: Arc::new(AtomCache::new()),
            processes: DashMap::new(),
            names: DashMap::new(),
            connections: DashMap::new(),
            pending: DashMap::new(),
            next_pid: AtomicU64::new(1),
            next_ref: AtomicU64::new(1),
            next_unlink: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            stop_accepting: stop_accepting.clone(),
            config,
        });
        tokio::spawn(accept_loop(listener, Arc::downgrade(&inner), stop_accepting));

        let node = Node { inner };
        node.mailbox().name("net_kernel").spawn(NetKernel)?;
        Ok(node)
    }

    /// Full node name, `name@host`.
    pub fn name(&self) -> &str {
        self.inner.descriptor.full_name()
    }

    pub fn descriptor(&self) -> &Arc<NodeDescriptor> {
        &self.inner.descriptor
    }

    pub fn creation(&self) -> u32 {
        self.inner.creation
    }

    /// Port the distribution listener is bound to.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn atom_cache(&self) -> &AtomCache {
        &self.inner.atoms
    }

    pub fn descriptor_cache(&self) -> &DescriptorCache {
        &self.inner.descriptors
    }

    pub fn mailbox(&self) -> MailboxBuilder<'_> {
        MailboxBuilder::new(&self.inner)
    }

    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.inner
            .names
            .get(&Atom::new(name))
            .map(|process| process.pid().clone())
    }

    /// A reference unique to this node incarnation.
    pub fn make_ref(&self) -> Reference {
        self.inner.make_ref()
    }

    /// Sends without a sender, to a local or remote pid.
    pub async fn send(&self, to: &Pid, message: Term) -> Result<(), NodeError> {
        self.inner.ensure_open()?;
        self.inner.send(to, message).await
    }

    pub fn send_named(&self, name: &str, message: Term) -> Result<(), NodeError> {
        self.inner.ensure_open()?;
        self.inner.send_named(name, message)
    }

    /// Opens a connection to `node` unless one is already up.
    pub async fn connect(&self, node: &str) -> Result<(), NodeError> {
        let descriptor = self.inner.descriptors.get_or_parse(node)?;
        if descriptor.full_name() == self.name() {
            return Ok(());
        }
        self.inner.connect(descriptor).await.map(|_| ())
    }

    pub fn is_connected(&self, node: &str) -> bool {
        self.inner.open_connection(node).is_some()
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.inner
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drops the connection to `node`, like `erlang:disconnect_node/1`.
    /// Links and monitors across it fire with `noconnection` on both ends.
    pub fn disconnect(&self, node: &str) -> bool {
        match self.inner.open_connection(node) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Asks `net_kernel` on `node` whether we are allowed in, like
    /// `net_adm:ping/1`. Unreachable nodes answer `false`.
    pub async fn ping(&self, node: &str) -> bool {
        match self.try_ping(node).await {
            Ok(pong) => pong,
            Err(err) => {
                log::debug!("ping {} failed: {}", node, err);
                false
            }
        }
    }

    async fn try_ping(&self, node: &str) -> Result<bool, NodeError> {
        let mailbox = self.mailbox().build()?;
        let reference = Term::Reference(self.make_ref());
        let request = Term::tuple(vec![
            atom("$gen_call"),
            Term::tuple(vec![Term::Pid(mailbox.pid().clone()), reference.clone()]),
            Term::tuple(vec![atom("is_auth"), Term::Atom(self.inner.atom.clone())]),
        ]);
        mailbox.send_remote(node, "net_kernel", request).await?;

        let deadline = Instant::now() + self.inner.config.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match mailbox.receive_timeout(remaining).await {
                Ok(Some(reply)) if reply.element(0) == Some(&reference) => {
                    return Ok(reply.element(1) == Some(&atom("yes")));
                }
                Ok(Some(_)) | Err(ReceiveError::Exit { .. }) | Err(ReceiveError::Down { .. }) => continue,
                Ok(None) | Err(ReceiveError::Closed) => return Ok(false),
            }
        }
    }

    /// Exits every mailbox, closes every connection, stops the listener and
    /// unregisters from the name service.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.stop_accepting.notify_one();

        let processes: Vec<Arc<Process>> = inner.processes.iter().map(|entry| entry.value().clone()).collect();
        for process in processes {
            inner.exit_process(&process, atom("normal"));
        }

        let connections: Vec<Arc<Connection>> = inner.connections.iter().map(|entry| entry.value().clone()).collect();
        inner.connections.clear();
        for connection in connections {
            connection.close();
        }

        if let Err(err) = inner.lookup.unregister(&inner.descriptor).await {
            log::warn!("could not unregister {}: {}", inner.descriptor, err);
        }
        log::info!("node {} closed", inner.descriptor);
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.stop_accepting.notify_one();
    }
}

async fn accept_loop(listener: TcpListener, node: Weak<NodeInner>, stop: Arc<Notify>) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            },
        };
        let node = match node.upgrade() {
            Some(node) => node,
            None => break,
        };
        log::debug!("inbound connection from {}", addr);
        tokio::spawn(async move {
            if let Err(err) = node.accept_connection(stream, addr).await {
                log::warn!("inbound connection from {} failed: {}", addr, err);
            }
        });
    }
    log::debug!("accept loop stopped");
}

/// Answers `net_adm:ping/1`.
struct NetKernel;

#[async_trait]
impl MessageHandler for NetKernel {
    async fn handle(&self, mailbox: &MailboxHandle, message: Term) {
        let is_call = message.element(0).and_then(Term::as_str) == Some("$gen_call");
        let is_auth = message
            .element(2)
            .and_then(|request| request.element(0))
            .and_then(Term::as_str)
            == Some("is_auth");
        let from = message.element(1);
        match (is_call && is_auth, from.and_then(|f| f.element(0)).and_then(Term::as_pid), from.and_then(|f| f.element(1))) {
            (true, Some(pid), Some(tag)) => {
                let reply = Term::tuple(vec![tag.clone(), atom("yes")]);
                if let Err(err) = mailbox.send(pid, reply).await {
                    log::debug!("could not answer is_auth from {}: {}", pid, err);
                }
            }
            _ => log::debug!("net_kernel ignoring {}", message),
        }
    }
}

/// Origin reported in a down notification for `target`.
fn origin_term(target: &Destination, node: &Atom) -> Term {
    match target {
        Destination::Pid(pid) => Term::Pid(pid.clone()),
        Destination::Name(name) => Term::tuple(vec![Term::Atom(name.clone()), Term::Atom(node.clone())]),
    }
}

impl NodeInner {
    fn ensure_open(&self) -> Result<(), NodeError> {
        if self.closed.load(Ordering::Acquire) {
            Err(NodeError::NodeClosed)
        } else {
            Ok(())
        }
    }

    /// Next free pid. Ids wrap after 2^28 allocations; ids still held by a
    /// live mailbox are skipped.
    fn make_pid(&self) -> Pid {
        loop {
            let n = self.next_pid.fetch_add(1, Ordering::Relaxed);
            let pid = Pid::new(
                self.atom.clone(),
                (n & 0x7fff) as u32,
                ((n >> 15) & 0x1fff) as u32,
                self.creation,
            );
            if !self.processes.contains_key(&pid) {
                return pid;
            }
        }
    }

    fn make_ref(&self) -> Reference {
        let n = self.next_ref.fetch_add(1, Ordering::Relaxed);
        Reference {
            node: self.atom.clone(),
            creation: self.creation,
            ids: vec![(n & 0x3ffff) as u32, (n >> 18) as u32, (n >> 50) as u32],
        }
    }

    fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            descriptor: self.descriptor.clone(),
            flags: self.config.flags,
            creation: self.creation,
            versions: self.config.versions,
            protocol: self.config.protocol,
            cookie: self.config.cookie.clone(),
            timeout: self.config.handshake_timeout,
        }
    }

    pub(crate) fn create_process(
        &self,
        name: Option<&str>,
    ) -> Result<(Arc<Process>, UnboundedReceiver<Delivery>), NodeError> {
        self.ensure_open()?;
        let pid = self.make_pid();
        let name = name.map(Atom::new);
        let (process, inbox) = Process::new(pid.clone(), name.clone());
        if let Some(name) = name {
            match self.names.entry(name) {
                Entry::Occupied(entry) => return Err(NodeError::NameTaken(entry.key().as_str().to_owned())),
                Entry::Vacant(entry) => {
                    entry.insert(process.clone());
                }
            }
        }
        self.processes.insert(pid, process.clone());
        log::trace!("created mailbox {}", process.pid());
        Ok((process, inbox))
    }

    fn is_local(&self, pid: &Pid) -> bool {
        pid.node == self.atom
    }

    /// Live local process behind `pid`; pids of an earlier incarnation
    /// resolve to nothing.
    fn local_process(&self, pid: &Pid) -> Option<Arc<Process>> {
        if !self.is_local(pid) || pid.creation != self.creation {
            return None;
        }
        self.processes
            .get(pid)
            .map(|entry| entry.value().clone())
            .filter(|process| !process.is_closed())
    }

    fn resolve_local(&self, target: &Destination) -> Option<Arc<Process>> {
        match target {
            Destination::Pid(pid) => self.local_process(pid),
            Destination::Name(name) => self
                .names
                .get(name)
                .map(|entry| entry.value().clone())
                .filter(|process| !process.is_closed()),
        }
    }

    fn deliver_local(&self, target: &Destination, delivery: Delivery) -> bool {
        match self.resolve_local(target) {
            Some(process) => process.deliver(delivery),
            None => {
                log::debug!("no mailbox for {:?}, dropping {:?}", target, delivery);
                false
            }
        }
    }

    fn open_connection(&self, node: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(node)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_closed())
    }

    async fn connection_to(&self, node: &Atom) -> Result<Arc<Connection>, NodeError> {
        if let Some(connection) = self.open_connection(node.as_str()) {
            return Ok(connection);
        }
        let descriptor = self.descriptors.get_or_parse(node.as_str())?;
        self.connect(descriptor).await
    }

    pub(crate) async fn send(&self, to: &Pid, message: Term) -> Result<(), NodeError> {
        if self.is_local(to) {
            self.deliver_local(&Destination::Pid(to.clone()), Delivery::Message(message));
            return Ok(());
        }
        let connection = self.connection_to(&to.node).await?;
        connection.send(&DistMessage::with_body(
            ControlMessage::Send {
                to: Destination::Pid(to.clone()),
            },
            message,
        ))
    }

    pub(crate) fn send_named(&self, name: &str, message: Term) -> Result<(), NodeError> {
        let process = self
            .resolve_local(&Destination::Name(Atom::new(name)))
            .ok_or_else(|| NodeError::NoSuchName(name.to_owned()))?;
        process.deliver(Delivery::Message(message));
        Ok(())
    }

    pub(crate) async fn send_remote(&self, from: &Pid, node: &str, name: &str, message: Term) -> Result<(), NodeError> {
        let descriptor = self.descriptors.get_or_parse(node)?;
        if descriptor.full_name() == self.descriptor.full_name() {
            return self.send_named(name, message);
        }
        let connection = self.connect(descriptor).await?;
        connection.send(&DistMessage::with_body(
            ControlMessage::RegSend {
                from: from.clone(),
                to: Atom::new(name),
            },
            message,
        ))
    }

    pub(crate) async fn link(&self, process: &Arc<Process>, to: &Pid) -> Result<(), NodeError> {
        if to == process.pid() || !process.add_link(to) {
            return Ok(());
        }
        if self.is_local(to) {
            match self.local_process(to) {
                Some(target) => {
                    target.add_link(process.pid());
                    if target.is_closed() {
                        target.remove_link(process.pid());
                        self.broken_link(process, to, "noproc");
                    }
                }
                None => self.broken_link(process, to, "noproc"),
            }
            return Ok(());
        }
        match self.connection_to(&to.node).await {
            Ok(connection) => connection.send(&DistMessage::control(ControlMessage::Link {
                from: process.pid().clone(),
                to: to.clone(),
            })),
            Err(err) => {
                log::debug!("link to {} failed: {}", to, err);
                self.broken_link(process, to, "noconnection");
                Ok(())
            }
        }
    }

    fn broken_link(&self, process: &Process, to: &Pid, reason: &str) {
        process.remove_link(to);
        process.deliver(Delivery::Exit {
            from: to.clone(),
            reason: atom(reason),
        });
    }

    pub(crate) async fn unlink(&self, process: &Arc<Process>, to: &Pid) -> Result<(), NodeError> {
        if self.is_local(to) {
            process.remove_link(to);
            if let Some(target) = self.local_process(to) {
                target.remove_link(process.pid());
            }
            return Ok(());
        }
        let connection = match self.open_connection(to.node.as_str()) {
            Some(connection) => connection,
            None => {
                process.remove_link(to);
                return Ok(());
            }
        };
        if connection.has_flag(DFLAG_UNLINK_ID) {
            let id = self.next_unlink.fetch_add(1, Ordering::Relaxed);
            if process.disable_link(to, id) {
                connection.send(&DistMessage::control(ControlMessage::UnlinkId {
                    id,
                    from: process.pid().clone(),
                    to: to.clone(),
                }))?;
            }
        } else if process.remove_link(to) {
            connection.send(&DistMessage::control(ControlMessage::Unlink {
                from: process.pid().clone(),
                to: to.clone(),
            }))?;
        }
        Ok(())
    }

    pub(crate) async fn send_exit(&self, from: &Pid, to: &Pid, reason: Term) -> Result<(), NodeError> {
        if self.is_local(to) {
            self.deliver_local(
                &Destination::Pid(to.clone()),
                Delivery::Exit {
                    from: from.clone(),
                    reason,
                },
            );
            return Ok(());
        }
        let connection = self.connection_to(&to.node).await?;
        connection.send(&DistMessage::control(ControlMessage::Exit2 {
            from: from.clone(),
            to: to.clone(),
            reason,
        }))
    }

    pub(crate) async fn monitor(&self, process: &Arc<Process>, target: Destination) -> Result<Reference, NodeError> {
        let reference = self.make_ref();
        let remote = match &target {
            Destination::Pid(pid) if !self.is_local(pid) => Some(pid.clone()),
            _ => None,
        };

        if let Some(pid) = remote {
            process.state().monitors.insert(reference.clone(), target.clone());
            let sent = match self.connection_to(&pid.node).await {
                Ok(connection) => connection.send(&DistMessage::control(ControlMessage::MonitorP {
                    from: process.pid().clone(),
                    to: target.clone(),
                    reference: reference.clone(),
                })),
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                log::debug!("monitor of {} failed: {}", pid, err);
                process.state().monitors.remove(&reference);
                process.deliver(Delivery::Down {
                    reference: reference.clone(),
                    from: Term::Pid(pid),
                    reason: atom("noconnection"),
                });
            }
            return Ok(reference);
        }

        match self.resolve_local(&target) {
            Some(watched) if !Arc::ptr_eq(&watched, process) => {
                process.state().monitors.insert(reference.clone(), target.clone());
                watched
                    .state()
                    .watchers
                    .insert(reference.clone(), (process.pid().clone(), target.clone()));
                if watched.is_closed() {
                    watched.state().watchers.remove(&reference);
                    process.state().monitors.remove(&reference);
                    self.fire_noproc(process, &reference, &target);
                }
            }
            Some(_) => {}
            None => self.fire_noproc(process, &reference, &target),
        }
        Ok(reference)
    }

    fn fire_noproc(&self, process: &Process, reference: &Reference, target: &Destination) {
        process.deliver(Delivery::Down {
            reference: reference.clone(),
            from: origin_term(target, &self.atom),
            reason: atom("noproc"),
        });
    }

    pub(crate) fn demonitor(&self, process: &Process, reference: &Reference) {
        let target = process.state().monitors.remove(reference);
        if let Some(target) = target {
            self.release_monitor(process.pid(), reference, &target);
        }
    }

    /// Removes the far end of a monitor `from` held on `target`.
    fn release_monitor(&self, from: &Pid, reference: &Reference, target: &Destination) {
        match target {
            Destination::Pid(pid) if !self.is_local(pid) => {
                if let Some(connection) = self.open_connection(pid.node.as_str()) {
                    let _ = connection.send(&DistMessage::control(ControlMessage::DemonitorP {
                        from: from.clone(),
                        to: target.clone(),
                        reference: reference.clone(),
                    }));
                }
            }
            _ => {
                if let Some(watched) = self.resolve_local(target) {
                    watched.state().watchers.remove(reference);
                }
            }
        }
    }

    /// Tears `process` down and notifies its links and watchers.
    pub(crate) fn exit_process(&self, process: &Arc<Process>, reason: Term) {
        let state = match process.close() {
            Some(state) => state,
            None => return,
        };
        let pid = process.pid();
        self.processes.remove_if(pid, |_, p| Arc::ptr_eq(p, process));
        if let Some(name) = process.name() {
            self.names.remove_if(name, |_, p| Arc::ptr_eq(p, process));
        }
        log::debug!("{} exited: {}", pid, reason);

        for (linked, link) in state.links {
            if !link.is_enabled() {
                continue;
            }
            if self.is_local(&linked) {
                if let Some(target) = self.local_process(&linked) {
                    if target.remove_link(pid) {
                        target.deliver(Delivery::Exit {
                            from: pid.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
            } else if let Some(connection) = self.open_connection(linked.node.as_str()) {
                let _ = connection.send(&DistMessage::control(ControlMessage::Exit {
                    from: pid.clone(),
                    to: linked,
                    reason: reason.clone(),
                }));
            }
        }

        for (reference, (watcher, named)) in state.watchers {
            if self.is_local(&watcher) {
                if let Some(target) = self.local_process(&watcher) {
                    if target.state().monitors.remove(&reference).is_some() {
                        target.deliver(Delivery::Down {
                            reference,
                            from: origin_term(&named, &self.atom),
                            reason: reason.clone(),
                        });
                    }
                }
            } else if let Some(connection) = self.open_connection(watcher.node.as_str()) {
                let _ = connection.send(&DistMessage::control(ControlMessage::MonitorPExit {
                    from: named,
                    to: watcher,
                    reference,
                    reason: reason.clone(),
                }));
            }
        }

        for (reference, target) in state.monitors {
            self.release_monitor(pid, &reference, &target);
        }
    }

    pub(crate) async fn connect(&self, descriptor: Arc<NodeDescriptor>) -> Result<Arc<Connection>, NodeError> {
        self.ensure_open()?;
        if let Some(connection) = self.open_connection(descriptor.full_name()) {
            return Ok(connection);
        }
        let pending = match self.pending.entry(descriptor.full_name().to_owned()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let node = self.me.upgrade().ok_or(NodeError::NodeClosed)?;
                let target = descriptor.clone();
                let task = tokio::spawn(async move {
                    let result = node.dial(&target).await;
                    node.pending.remove(target.full_name());
                    result
                });
                let name = descriptor.full_name().to_owned();
                let shared = async move {
                    task.await.unwrap_or_else(|err| {
                        log::error!("dial task for {} failed: {}", name, err);
                        Err(NodeError::ConnectionClosed(name))
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };
        pending.await
    }

    async fn dial(&self, descriptor: &Arc<NodeDescriptor>) -> Result<Arc<Connection>, NodeError> {
        let remote = self
            .lookup
            .lookup(descriptor)
            .await?
            .ok_or_else(|| NodeError::NodeNotFound(descriptor.full_name().to_owned()))?;
        let failed = |reason: HandshakeError| NodeError::Connect {
            node: descriptor.full_name().to_owned(),
            reason: Arc::new(reason),
        };

        log::debug!("dialing {} at {}", descriptor, remote.socket_addr());
        let connecting = TcpStream::connect(remote.socket_addr());
        let mut stream = match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Ok(stream) => stream.map_err(|err| failed(HandshakeError::Io(err)))?,
            Err(_) => return Err(failed(HandshakeError::Timeout("Connect"))),
        };
        stream.set_nodelay(true)?;
        let established = handshake::initiate(&mut stream, &self.identity(), &remote)
            .await
            .map_err(failed)?;
        self.install(stream, established)
    }

    async fn accept_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), NodeError> {
        stream.set_nodelay(true)?;
        let established = handshake::accept(&mut stream, &self.identity(), &self.descriptors, &*self.lookup)
            .await
            .map_err(|reason| NodeError::Connect {
                node: addr.to_string(),
                reason: Arc::new(reason),
            })?;
        self.install(stream, established).map(|_| ())
    }

    /// Starts the connection tasks and publishes the connection. An open
    /// connection to the same peer wins over the new one.
    fn install(&self, stream: TcpStream, established: Established) -> Result<Arc<Connection>, NodeError> {
        let sink: Weak<dyn InboundSink> = self.me.clone();
        let peer = established.peer.full_name().to_owned();
        let connection = Connection::spawn(stream, established, &self.config, self.atoms.clone(), sink);
        if self.ensure_open().is_err() {
            connection.close();
            return Err(NodeError::NodeClosed);
        }
        let installed = match self.connections.entry(peer) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                log::warn!("already connected to {}, dropping the new connection", entry.key());
                connection.close();
                entry.get().clone()
            }
            Entry::Occupied(mut entry) => {
                entry.insert(connection.clone());
                connection
            }
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                connection
            }
        };
        Ok(installed)
    }

    fn route(&self, connection: &Arc<Connection>, message: DistMessage) {
        let DistMessage { control, body } = message;
        match control {
            ControlMessage::Send { to } | ControlMessage::SendTT { to, .. } => self.deliver_body(&to, body),
            ControlMessage::RegSend { to, .. } | ControlMessage::RegSendTT { to, .. } => {
                self.deliver_body(&Destination::Name(to), body)
            }
            ControlMessage::Link { from, to } => match self.local_process(&to) {
                Some(process) => {
                    process.add_link(&from);
                }
                None => {
                    let _ = connection.send(&DistMessage::control(ControlMessage::Exit {
                        from: to,
                        to: from,
                        reason: atom("noproc"),
                    }));
                }
            },
            ControlMessage::Unlink { from, to } => {
                if let Some(process) = self.local_process(&to) {
                    process.remove_link(&from);
                }
            }
            ControlMessage::UnlinkId { id, from, to } => {
                if let Some(process) = self.local_process(&to) {
                    process.remove_enabled_link(&from);
                }
                let _ = connection.send(&DistMessage::control(ControlMessage::UnlinkIdAck {
                    id,
                    from: to,
                    to: from,
                }));
            }
            ControlMessage::UnlinkIdAck { id, from, to } => {
                if let Some(process) = self.local_process(&to) {
                    process.ack_unlink(&from, id);
                }
            }
            ControlMessage::Exit { from, to, reason } | ControlMessage::ExitTT { from, to, reason, .. } => {
                if let Some(process) = self.local_process(&to) {
                    if process.remove_enabled_link(&from) {
                        process.deliver(Delivery::Exit { from, reason });
                    }
                }
            }
            ControlMessage::Exit2 { from, to, reason } | ControlMessage::Exit2TT { from, to, reason, .. } => {
                self.deliver_local(&Destination::Pid(to), Delivery::Exit { from, reason });
            }
            ControlMessage::MonitorP { from, to, reference } => match self.resolve_local(&to) {
                Some(process) => {
                    process.state().watchers.insert(reference, (from, to));
                }
                None => {
                    let _ = connection.send(&DistMessage::control(ControlMessage::MonitorPExit {
                        from: to,
                        to: from,
                        reference,
                        reason: atom("noproc"),
                    }));
                }
            },
            ControlMessage::DemonitorP { to, reference, .. } => {
                if let Some(process) = self.resolve_local(&to) {
                    process.state().watchers.remove(&reference);
                }
            }
            ControlMessage::MonitorPExit {
                from,
                to,
                reference,
                reason,
            } => {
                if let Some(process) = self.local_process(&to) {
                    let held = process.state().monitors.remove(&reference).is_some();
                    if held {
                        process.deliver(Delivery::Down {
                            reference,
                            from: origin_term(&from, &connection.peer().atom()),
                            reason,
                        });
                    }
                }
            }
            other @ (ControlMessage::NodeLink | ControlMessage::GroupLeader { .. }) => {
                log::debug!("ignoring {} from {}", other.name(), connection.peer());
            }
        }
    }

    fn deliver_body(&self, to: &Destination, body: Option<Term>) {
        if let Some(body) = body {
            self.deliver_local(to, Delivery::Message(body));
        }
    }

    /// Links and monitors across a lost connection fire with `noconnection`.
    fn lost(&self, connection: &Arc<Connection>) {
        let removed = self
            .connections
            .remove_if(connection.peer().full_name(), |_, c| Arc::ptr_eq(c, connection));
        if removed.is_none() {
            return;
        }
        log::info!("connection to {} lost", connection.peer());

        let peer = connection.peer().atom();
        let processes: Vec<Arc<Process>> = self.processes.iter().map(|entry| entry.value().clone()).collect();
        for process in processes {
            let (exits, downs) = {
                let mut state = process.state();
                let linked: Vec<Pid> = state.links.keys().filter(|pid| pid.node == peer).cloned().collect();
                let exits: Vec<Pid> = linked
                    .into_iter()
                    .filter(|pid| state.links.remove(pid).map_or(false, |link| link.is_enabled()))
                    .collect();
                let monitored: Vec<Reference> = state
                    .monitors
                    .iter()
                    .filter(|(_, target)| matches!(target, Destination::Pid(pid) if pid.node == peer))
                    .map(|(reference, _)| reference.clone())
                    .collect();
                let downs: Vec<(Reference, Destination)> = monitored
                    .into_iter()
                    .filter_map(|reference| state.monitors.remove(&reference).map(|target| (reference, target)))
                    .collect();
                state.watchers.retain(|_, (watcher, _)| watcher.node != peer);
                (exits, downs)
            };
            for from in exits {
                process.deliver(Delivery::Exit {
                    from,
                    reason: atom("noconnection"),
                });
            }
            for (reference, target) in downs {
                process.deliver(Delivery::Down {
                    reference,
                    from: origin_term(&target, &peer),
                    reason: atom("noconnection"),
                });
            }
        }
    }
}

impl InboundSink for NodeInner {
    fn deliver(&self, connection: &Arc<Connection>, message: DistMessage) {
        self.route(connection, message);
    }

    fn connection_lost(&self, connection: &Arc<Connection>) {
        self.lost(connection);
    }
}
