//! Mailboxes: the addressable processes hosted by a [`crate::Node`].
//!
//! Every mailbox owns one unbounded delivery queue. A [`Mailbox`] reads that
//! queue through `receive`; a mailbox started with
//! [`MailboxBuilder::spawn`] has a task that drains it into a
//! [`MessageHandler`] instead.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::control::Destination;
use crate::error::{NodeError, ReceiveError};
use crate::etf::{Atom, Pid, Reference, Term};
use crate::node::NodeInner;

/// One item of a mailbox queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Term),
    /// A linked process exited, or someone called `exit/2` on this mailbox.
    Exit { from: Pid, reason: Term },
    /// A monitored process went down.
    Down {
        reference: Reference,
        from: Term,
        reason: Term,
    },
}

impl Delivery {
    fn into_result(self) -> Result<Term, ReceiveError> {
        match self {
            Delivery::Message(term) => Ok(term),
            Delivery::Exit { from, reason } => Err(ReceiveError::Exit { from, reason }),
            Delivery::Down {
                reference,
                from,
                reason,
            } => Err(ReceiveError::Down {
                reference,
                from,
                reason,
            }),
        }
    }
}

/// Callbacks of a mailbox started with [`MailboxBuilder::spawn`]. Calls are
/// made one at a time, in delivery order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, mailbox: &MailboxHandle, message: Term);

    /// A linked process exited. Anything but `normal` takes this mailbox
    /// down with the same reason unless overridden.
    async fn handle_exit(&self, mailbox: &MailboxHandle, from: Pid, reason: Term) {
        if reason != Term::atom("normal") {
            log::debug!("{} exits because linked {} exited with {}", mailbox.pid(), from, reason);
            mailbox.exit(reason);
        }
    }

    async fn handle_down(&self, _mailbox: &MailboxHandle, _reference: Reference, _from: Term, _reason: Term) {}
}

/// A link is disabled while an unlink id waits for its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkState {
    unlink: Option<u64>,
}

impl LinkState {
    fn enabled() -> Self {
        LinkState { unlink: None }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.unlink.is_none()
    }
}

/// Link and monitor tables of one process.
#[derive(Debug, Default)]
pub(crate) struct ProcessState {
    pub(crate) links: HashMap<Pid, LinkState>,
    /// Monitors this process holds, by reference.
    pub(crate) monitors: HashMap<Reference, Destination>,
    /// Monitors held on this process: watcher and the target as the
    /// watcher named it.
    pub(crate) watchers: HashMap<Reference, (Pid, Destination)>,
}

pub(crate) struct Process {
    pid: Pid,
    name: Option<Atom>,
    closed: AtomicBool,
    sender: Mutex<Option<UnboundedSender<Delivery>>>,
    state: Mutex<ProcessState>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Process {
    pub(crate) fn new(pid: Pid, name: Option<Atom>) -> (Arc<Process>, UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let process = Arc::new(Process {
            pid,
            name,
            closed: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            state: Mutex::new(ProcessState::default()),
        });
        (process, receiver)
    }

    pub(crate) fn pid(&self) -> &Pid {
        &self.pid
    }

    pub(crate) fn name(&self) -> Option<&Atom> {
        self.name.as_ref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `delivery`; `false` once the process has exited.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Marks the process dead and hands back its tables, once.
    pub(crate) fn close(&self) -> Option<ProcessState> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Some(std::mem::take(&mut *self.state()))
    }

    /// Returns `true` if the link is new.
    pub(crate) fn add_link(&self, pid: &Pid) -> bool {
        let mut state = self.state();
        match state.links.get_mut(pid) {
            Some(link) if link.is_enabled() => false,
            Some(link) => {
                *link = LinkState::enabled();
                true
            }
            None => {
                state.links.insert(pid.clone(), LinkState::enabled());
                true
            }
        }
    }

    pub(crate) fn remove_link(&self, pid: &Pid) -> bool {
        self.state().links.remove(pid).is_some()
    }

    /// Removes the link to `pid` only if it is not waiting on an unlink.
    pub(crate) fn remove_enabled_link(&self, pid: &Pid) -> bool {
        let mut state = self.state();
        if state.links.get(pid).map_or(false, LinkState::is_enabled) {
            state.links.remove(pid);
            true
        } else {
            false
        }
    }

    /// Disables an enabled link until `id` is acknowledged.
    pub(crate) fn disable_link(&self, pid: &Pid, id: u64) -> bool {
        match self.state().links.get_mut(pid) {
            Some(link) if link.is_enabled() => {
                link.unlink = Some(id);
                true
            }
            _ => false,
        }
    }

    /// Drops a link disabled by `id`. Links re-enabled meanwhile stay.
    pub(crate) fn ack_unlink(&self, pid: &Pid, id: u64) -> bool {
        let mut state = self.state();
        if state.links.get(pid).map_or(false, |link| link.unlink == Some(id)) {
            state.links.remove(pid);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_linked(&self, pid: &Pid) -> bool {
        self.state().links.get(pid).map_or(false, LinkState::is_enabled)
    }
}

/// Cloneable handle to a mailbox. Dropping a handle does nothing; the
/// mailbox lives until it exits or the node closes.
#[derive(Clone)]
pub struct MailboxHandle {
    process: Arc<Process>,
    node: Weak<NodeInner>,
}

impl fmt::Debug for MailboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MailboxHandle").field(&self.process.pid).finish()
    }
}

impl MailboxHandle {
    pub(crate) fn new(process: Arc<Process>, node: Weak<NodeInner>) -> Self {
        MailboxHandle { process, node }
    }

    pub fn pid(&self) -> &Pid {
        self.process.pid()
    }

    pub fn name(&self) -> Option<&str> {
        self.process.name().map(Atom::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.process.is_closed()
    }

    /// Whether this mailbox currently has an active link to `pid`.
    pub fn is_linked(&self, pid: &Pid) -> bool {
        self.process.is_linked(pid)
    }

    fn open(&self) -> Result<Arc<NodeInner>, NodeError> {
        if self.process.is_closed() {
            return Err(NodeError::MailboxClosed(self.process.pid().clone()));
        }
        self.node.upgrade().ok_or(NodeError::NodeClosed)
    }

    /// Sends `message` to `to`, dialing its node when needed.
    pub async fn send(&self, to: &Pid, message: Term) -> Result<(), NodeError> {
        self.open()?.send(to, message).await
    }

    /// Sends to a process registered on this node.
    pub fn send_named(&self, name: &str, message: Term) -> Result<(), NodeError> {
        self.open()?.send_named(name, message)
    }

    /// Sends to a process registered as `name` on `node`.
    pub async fn send_remote(&self, node: &str, name: &str, message: Term) -> Result<(), NodeError> {
        self.open()?
            .send_remote(self.process.pid(), node, name, message)
            .await
    }

    pub async fn link(&self, to: &Pid) -> Result<(), NodeError> {
        self.open()?.link(&self.process, to).await
    }

    pub async fn unlink(&self, to: &Pid) -> Result<(), NodeError> {
        self.open()?.unlink(&self.process, to).await
    }

    /// Sends an exit signal to `to` without a link, like `exit/2`.
    pub async fn send_exit(&self, to: &Pid, reason: Term) -> Result<(), NodeError> {
        self.open()?.send_exit(self.process.pid(), to, reason).await
    }

    /// Monitors a pid or a name registered on this node.
    pub async fn monitor(&self, target: impl Into<Destination>) -> Result<Reference, NodeError> {
        self.open()?.monitor(&self.process, target.into()).await
    }

    pub fn demonitor(&self, reference: &Reference) -> Result<(), NodeError> {
        self.open()?.demonitor(&self.process, reference);
        Ok(())
    }

    /// Exits with `reason`: links get an exit signal, monitors fire and the
    /// name is released. Idempotent: exiting a closed mailbox sends
    /// nothing and returns without error.
    pub fn exit(&self, reason: Term) {
        match self.node.upgrade() {
            Some(node) => node.exit_process(&self.process, reason),
            None => {
                self.process.close();
            }
        }
    }
}

/// A mailbox read with `receive`. Dropping an open mailbox exits it with
/// reason `normal`.
pub struct Mailbox {
    handle: MailboxHandle,
    inbox: tokio::sync::Mutex<UnboundedReceiver<Delivery>>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mailbox").field(self.handle.pid()).finish()
    }
}

impl Deref for Mailbox {
    type Target = MailboxHandle;

    fn deref(&self) -> &MailboxHandle {
        &self.handle
    }
}

impl Mailbox {
    pub fn handle(&self) -> MailboxHandle {
        self.handle.clone()
    }

    /// Waits for the next delivery. Exit signals and monitor notifications
    /// come back as errors.
    pub async fn receive(&self) -> Result<Term, ReceiveError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(delivery) => delivery.into_result(),
            None => Err(ReceiveError::Closed),
        }
    }

    /// `Ok(None)` when nothing arrived within `timeout`; nothing is consumed
    /// in that case.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Term>, ReceiveError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Thread-blocking `receive` for code outside the runtime. Panics when
    /// called from an async context.
    pub fn receive_blocking(&self) -> Result<Term, ReceiveError> {
        let mut inbox = self.inbox.blocking_lock();
        match inbox.blocking_recv() {
            Some(delivery) => delivery.into_result(),
            None => Err(ReceiveError::Closed),
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if !self.handle.is_closed() {
            self.handle.exit(Term::atom("normal"));
        }
    }
}

/// Returned by [`crate::Node::mailbox`].
pub struct MailboxBuilder<'a> {
    node: &'a Arc<NodeInner>,
    name: Option<String>,
}

impl<'a> MailboxBuilder<'a> {
    pub(crate) fn new(node: &'a Arc<NodeInner>) -> Self {
        MailboxBuilder { node, name: None }
    }

    /// Registers the mailbox under `name` on this node.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Mailbox, NodeError> {
        let (process, inbox) = self.node.create_process(self.name.as_deref())?;
        Ok(Mailbox {
            handle: MailboxHandle::new(process, Arc::downgrade(self.node)),
            inbox: tokio::sync::Mutex::new(inbox),
        })
    }

    /// Starts a task feeding every delivery to `handler`.
    pub fn spawn(self, handler: impl MessageHandler) -> Result<MailboxHandle, NodeError> {
        let (process, mut inbox) = self.node.create_process(self.name.as_deref())?;
        let handle = MailboxHandle::new(process, Arc::downgrade(self.node));
        let task_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                match delivery {
                    Delivery::Message(message) => handler.handle(&task_handle, message).await,
                    Delivery::Exit { from, reason } => handler.handle_exit(&task_handle, from, reason).await,
                    Delivery::Down {
                        reference,
                        from,
                        reason,
                    } => {
                        handler
                            .handle_down(&task_handle, reference, from, reason)
                            .await
                    }
                }
            }
            log::debug!("handler of {} stopped", task_handle.pid());
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> Pid {
        Pid::new(Atom::new("a@localhost"), id, 0, 1)
    }

    #[test]
    fn test_link_table() {
        let (process, _inbox) = Process::new(pid(1), None);
        assert!(process.add_link(&pid(2)));
        assert!(!process.add_link(&pid(2)));
        assert!(process.is_linked(&pid(2)));

        assert!(process.disable_link(&pid(2), 7));
        assert!(!process.is_linked(&pid(2)));
        assert!(!process.disable_link(&pid(2), 8));
        assert!(!process.ack_unlink(&pid(2), 8));
        assert!(process.ack_unlink(&pid(2), 7));
        assert!(process.state().links.is_empty());
    }

    #[test]
    fn test_relink_survives_stale_ack() {
        let (process, _inbox) = Process::new(pid(1), None);
        process.add_link(&pid(2));
        process.disable_link(&pid(2), 1);
        assert!(process.add_link(&pid(2)));
        assert!(!process.ack_unlink(&pid(2), 1));
        assert!(process.is_linked(&pid(2)));
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let (process, mut inbox) = Process::new(pid(1), None);
        process.add_link(&pid(2));
        assert!(process.deliver(Delivery::Message(Term::from(1))));

        let state = process.close().unwrap();
        assert!(state.links.contains_key(&pid(2)));
        assert!(process.close().is_none());
        assert!(!process.deliver(Delivery::Message(Term::from(2))));

        assert_eq!(inbox.recv().await, Some(Delivery::Message(Term::from(1))));
        assert_eq!(inbox.recv().await, None);
    }

    #[test]
    fn test_delivery_results() {
        assert_eq!(Delivery::Message(Term::Nil).into_result(), Ok(Term::Nil));
        assert_eq!(
            Delivery::Exit {
                from: pid(3),
                reason: Term::atom("boom")
            }
            .into_result(),
            Err(ReceiveError::Exit {
                from: pid(3),
                reason: Term::atom("boom")
            })
        );
    }
}
