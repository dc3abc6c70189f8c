//! Connection setup: name exchange, version negotiation and the cookie
//! challenge, in both roles.
//!
//! Both drivers borrow the socket; when they return an error the caller
//! drops the socket, which is how a failed attempt gets closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub use digest::{challenge_digest, generate_digest, nonce_text};
pub use messages::{read_framed, write_framed, Challenge, ChallengeAck, ChallengeReply, Form, Name};

use crate::descriptor::{DescriptorCache, NodeDescriptor, Protocol, RemoteNode, VersionRange};
use crate::epmd::PeerLookup;
use crate::error::HandshakeError;
use crate::etf::consts::dist_flags::{DFLAG_HANDSHAKE_23, DFLAG_NAME_ME};
use deku::DekuContainerWrite as _;

mod digest;
mod messages;

/// Where a handshake is. Errors name the state they happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    NameSent,
    NameReceived,
    StatusSent,
    StatusReceived,
    ChallengeSent,
    ChallengeReceived,
    ReplySent,
    ReplyReceived,
    AckSent,
    AckReceived,
    Established,
    Failed,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Init => "Init",
            HandshakeState::NameSent => "NameSent",
            HandshakeState::NameReceived => "NameReceived",
            HandshakeState::StatusSent => "StatusSent",
            HandshakeState::StatusReceived => "StatusReceived",
            HandshakeState::ChallengeSent => "ChallengeSent",
            HandshakeState::ChallengeReceived => "ChallengeReceived",
            HandshakeState::ReplySent => "ReplySent",
            HandshakeState::ReplyReceived => "ReplyReceived",
            HandshakeState::AckSent => "AckSent",
            HandshakeState::AckReceived => "AckReceived",
            HandshakeState::Established => "Established",
            HandshakeState::Failed => "Failed",
        }
    }
}

/// What the local node brings to a handshake.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub descriptor: Arc<NodeDescriptor>,
    pub flags: u64,
    pub creation: u32,
    pub versions: VersionRange,
    pub protocol: Protocol,
    pub cookie: String,
    /// Deadline for each read.
    pub timeout: Duration,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    pub peer: Arc<NodeDescriptor>,
    /// Flags both sides advertised.
    pub flags: u64,
    pub version: u16,
    /// Peer creation, zero when the peer used the v5 form.
    pub creation: u32,
}

struct Driver<'a, S> {
    socket: &'a mut S,
    local: &'a LocalIdentity,
    state: HandshakeState,
}

impl<'a, S> Driver<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(socket: &'a mut S, local: &'a LocalIdentity) -> Self {
        Driver {
            socket,
            local,
            state: HandshakeState::Init,
        }
    }

    async fn read(&mut self) -> Result<Vec<u8>, HandshakeError> {
        match tokio::time::timeout(self.local.timeout, read_framed(&mut *self.socket)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HandshakeError::Timeout(self.state.name())),
        }
    }

    async fn write(&mut self, data: &[u8], next: HandshakeState) -> Result<(), HandshakeError> {
        write_framed(&mut *self.socket, data).await?;
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        log::debug!("handshake failed in state {}: {}", self.state.name(), err);
        self.state = HandshakeState::Failed;
        err
    }
}

/// Dials side. Rejects incompatible peers before touching the socket.
pub async fn initiate<S>(socket: &mut S, local: &LocalIdentity, remote: &RemoteNode) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = negotiate(local, remote)?;
    let mut driver = Driver::new(socket, local);
    match run_initiator(&mut driver, remote, version).await {
        Ok(established) => Ok(established),
        Err(err) => Err(driver.fail(err)),
    }
}

fn negotiate(local: &LocalIdentity, remote: &RemoteNode) -> Result<u16, HandshakeError> {
    if local.protocol != remote.protocol {
        return Err(HandshakeError::ProtocolMismatch {
            local: local.protocol.code(),
            peer: remote.protocol.code(),
        });
    }
    local
        .versions
        .negotiate(&remote.versions)
        .ok_or(HandshakeError::VersionMismatch {
            local_low: local.versions.low,
            local_high: local.versions.high,
            peer_low: remote.versions.low,
            peer_high: remote.versions.high,
        })
}

fn form_for(version: u16) -> Form {
    if version >= 6 {
        Form::V6
    } else {
        Form::V5
    }
}

fn advertised_flags(local: &LocalIdentity, form: Form) -> u64 {
    match form {
        // A v5 name must not invite a v6 challenge we would have to complement.
        Form::V5 => local.flags & !DFLAG_HANDSHAKE_23 & u32::MAX as u64,
        Form::V6 => local.flags,
    }
}

async fn run_initiator<S>(
    d: &mut Driver<'_, S>,
    remote: &RemoteNode,
    version: u16,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let local = d.local;
    let form = form_for(version);
    let name = Name {
        form,
        flags: advertised_flags(local, form),
        creation: local.creation,
        name: local.descriptor.full_name().to_owned(),
    };
    log::debug!("-> name {} to {} ({:?})", name.name, remote.descriptor, form);
    d.write(&name.encode()?, HandshakeState::NameSent).await?;

    let status = messages::decode_status(&d.read().await?)?;
    d.state = HandshakeState::StatusReceived;
    log::debug!("<- status {}", status);
    if status != "ok" {
        return Err(HandshakeError::Status(status));
    }

    let challenge = Challenge::decode(&d.read().await?)?;
    d.state = HandshakeState::ChallengeReceived;
    log::debug!(
        "<- challenge from {} flags {:#x} creation {}",
        challenge.name,
        challenge.flags,
        challenge.creation
    );
    if challenge.name != remote.descriptor.full_name() {
        log::warn!(
            "dialed {} but the peer calls itself {}",
            remote.descriptor,
            challenge.name
        );
    }

    let own_challenge: u32 = rand::random();
    let reply = ChallengeReply {
        challenge: own_challenge,
        digest: challenge_digest(challenge.challenge, &local.cookie),
    };
    d.write(&reply.to_bytes()?, HandshakeState::ReplySent).await?;

    let ack = messages::decode_ack(&d.read().await?)?;
    d.state = HandshakeState::AckReceived;
    if ack.digest != challenge_digest(own_challenge, &local.cookie) {
        return Err(HandshakeError::DigestMismatch);
    }

    d.state = HandshakeState::Established;
    log::info!("connected to {} (version {})", remote.descriptor, version);
    Ok(Established {
        peer: remote.descriptor.clone(),
        flags: name.flags & challenge.flags,
        version,
        creation: challenge.creation,
    })
}

/// Listening side. The peer must be known to `lookup`.
pub async fn accept<S>(
    socket: &mut S,
    local: &LocalIdentity,
    descriptors: &DescriptorCache,
    lookup: &dyn PeerLookup,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut driver = Driver::new(socket, local);
    match run_acceptor(&mut driver, descriptors, lookup).await {
        Ok(established) => Ok(established),
        Err(err) => Err(driver.fail(err)),
    }
}

async fn refuse<S>(d: &mut Driver<'_, S>, err: HandshakeError) -> HandshakeError
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(io) = write_framed(&mut *d.socket, &messages::encode_status("not_allowed")).await {
        log::debug!("could not send refusal: {}", io);
    }
    err
}

async fn run_acceptor<S>(
    d: &mut Driver<'_, S>,
    descriptors: &DescriptorCache,
    lookup: &dyn PeerLookup,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let local = d.local;
    let name = Name::decode(&d.read().await?)?;
    d.state = HandshakeState::NameReceived;
    log::debug!("<- name {} flags {:#x} ({:?})", name.name, name.flags, name.form);

    if name.flags & DFLAG_NAME_ME != 0 {
        return Err(refuse(d, HandshakeError::Malformed("dynamic node names are not supported".into())).await);
    }
    let descriptor = descriptors.get_or_parse(&name.name)?;
    let remote = match lookup.lookup(&descriptor).await {
        Ok(Some(remote)) => remote,
        Ok(None) => return Err(refuse(d, HandshakeError::UnknownPeer(name.name)).await),
        Err(err) => {
            log::warn!("lookup of {} failed: {}", descriptor, err);
            return Err(refuse(d, HandshakeError::UnknownPeer(name.name)).await);
        }
    };
    if let Err(err) = negotiate(local, &remote) {
        return Err(refuse(d, err).await);
    }
    let form = match name.form {
        Form::V6 if local.versions.contains(6) => Form::V6,
        Form::V5 if local.versions.contains(5) => Form::V5,
        _ => {
            let err = HandshakeError::VersionMismatch {
                local_low: local.versions.low,
                local_high: local.versions.high,
                peer_low: remote.versions.low,
                peer_high: remote.versions.high,
            };
            return Err(refuse(d, err).await);
        }
    };

    d.write(&messages::encode_status("ok"), HandshakeState::StatusSent).await?;

    let own_challenge: u32 = rand::random();
    let challenge = Challenge {
        form,
        flags: advertised_flags(local, form),
        challenge: own_challenge,
        creation: local.creation,
        name: local.descriptor.full_name().to_owned(),
    };
    d.write(&challenge.encode()?, HandshakeState::ChallengeSent).await?;

    let reply = messages::decode_reply(&d.read().await?)?;
    d.state = HandshakeState::ReplyReceived;
    if reply.digest != challenge_digest(own_challenge, &local.cookie) {
        return Err(HandshakeError::DigestMismatch);
    }

    let ack = ChallengeAck {
        digest: challenge_digest(reply.challenge, &local.cookie),
    };
    d.write(&ack.to_bytes()?, HandshakeState::AckSent).await?;

    let version = match form {
        Form::V5 => 5,
        Form::V6 => 6,
    };
    d.state = HandshakeState::Established;
    log::info!("accepted connection from {} (version {})", descriptor, version);
    Ok(Established {
        peer: descriptor,
        flags: name.flags & challenge.flags,
        version,
        creation: name.creation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::NodeType;
    use crate::epmd::{LocalNode, StaticLookup};
    use crate::etf::consts::dist_flags::default_flags;
    use deku::DekuContainerWrite as _;
    use tokio::io::{duplex, AsyncReadExt};

    fn identity(name: &str, cookie: &str, versions: VersionRange) -> LocalIdentity {
        LocalIdentity {
            descriptor: Arc::new(NodeDescriptor::parse(name).unwrap()),
            flags: default_flags(),
            creation: 11,
            versions,
            protocol: Protocol::TcpIpV4,
            cookie: cookie.into(),
            timeout: Duration::from_millis(500),
        }
    }

    fn remote_of(id: &LocalIdentity) -> RemoteNode {
        RemoteNode {
            descriptor: id.descriptor.clone(),
            protocol: id.protocol,
            node_type: NodeType::Hidden,
            versions: id.versions,
            port: 1,
        }
    }

    async fn lookup_knowing(id: &LocalIdentity) -> StaticLookup {
        let lookup = StaticLookup::new();
        lookup
            .register(&LocalNode {
                descriptor: id.descriptor.clone(),
                port: 1,
                node_type: NodeType::Hidden,
                protocol: id.protocol,
                versions: id.versions,
            })
            .await
            .unwrap();
        lookup
    }

    async fn run_pair(
        client: LocalIdentity,
        server: LocalIdentity,
    ) -> (
        Result<Established, HandshakeError>,
        Result<Established, HandshakeError>,
    ) {
        let (mut a, mut b) = duplex(1024);
        let lookup = lookup_knowing(&client).await;
        let target = remote_of(&server);
        let server_task = tokio::spawn(async move {
            let cache = DescriptorCache::new();
            let result = accept(&mut b, &server, &cache, &lookup).await;
            drop(b);
            result
        });
        let client_result = initiate(&mut a, &client, &target).await;
        drop(a);
        (client_result, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_v6_handshake_succeeds() {
        let client = identity("client@host", "monster", VersionRange::new(5, 6));
        let server = identity("server@host", "monster", VersionRange::new(5, 6));
        let (c, s) = run_pair(client, server).await;
        let c = c.unwrap();
        let s = s.unwrap();
        assert_eq!(c.peer.full_name(), "server@host");
        assert_eq!(s.peer.full_name(), "client@host");
        assert_eq!(c.version, 6);
        assert_eq!(s.version, 6);
        assert_eq!(c.creation, 11);
        assert_eq!(c.flags, default_flags());
    }

    #[tokio::test]
    async fn test_v5_handshake_succeeds() {
        let client = identity("client@host", "monster", VersionRange::new(5, 6));
        let server = identity("server@host", "monster", VersionRange::new(5, 5));
        let (c, s) = run_pair(client, server).await;
        let c = c.unwrap();
        assert_eq!(c.version, 5);
        assert_eq!(c.creation, 0);
        assert_eq!(c.flags & DFLAG_HANDSHAKE_23, 0);
        assert_eq!(s.unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_cookie_mismatch_is_fatal() {
        let client = identity("client@host", "one", VersionRange::new(5, 6));
        let server = identity("server@host", "two", VersionRange::new(5, 6));
        let (c, s) = run_pair(client, server).await;
        assert!(matches!(s, Err(HandshakeError::DigestMismatch)));
        // The acceptor hangs up, so the initiator never sees an ack.
        assert!(matches!(c, Err(HandshakeError::Io(_))));
    }

    #[tokio::test]
    async fn test_non_ok_status_is_fatal() {
        let client = identity("client@host", "c", VersionRange::new(5, 6));
        let target = remote_of(&identity("server@host", "c", VersionRange::new(5, 6)));
        let (mut a, mut b) = duplex(1024);
        let peer = tokio::spawn(async move {
            read_framed(&mut b).await.unwrap();
            write_framed(&mut b, b"snot_allowed").await.unwrap();
            let mut rest = Vec::new();
            b.read_to_end(&mut rest).await.unwrap();
            rest
        });
        let result = initiate(&mut a, &client, &target).await;
        assert!(matches!(result, Err(HandshakeError::Status(ref s)) if s == "not_allowed"));
        drop(a);
        assert!(peer.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forged_ack_is_rejected() {
        let client = identity("client@host", "c", VersionRange::new(6, 6));
        let target = remote_of(&identity("server@host", "c", VersionRange::new(6, 6)));
        let (mut a, mut b) = duplex(1024);
        let peer = tokio::spawn(async move {
            let name = Name::decode(&read_framed(&mut b).await.unwrap()).unwrap();
            assert_eq!(name.name, "client@host");
            write_framed(&mut b, &messages::encode_status("ok")).await.unwrap();
            let challenge = Challenge {
                form: Form::V6,
                flags: default_flags(),
                challenge: 7,
                creation: 3,
                name: "server@host".into(),
            };
            write_framed(&mut b, &challenge.encode().unwrap()).await.unwrap();
            let reply = messages::decode_reply(&read_framed(&mut b).await.unwrap()).unwrap();
            // Right challenge, wrong cookie.
            let ack = ChallengeAck {
                digest: challenge_digest(reply.challenge, "guess"),
            };
            write_framed(&mut b, &ack.to_bytes().unwrap()).await.unwrap();
            let mut rest = Vec::new();
            b.read_to_end(&mut rest).await.unwrap();
            rest
        });
        let result = initiate(&mut a, &client, &target).await;
        assert!(matches!(result, Err(HandshakeError::DigestMismatch)));
        drop(a);
        assert!(peer.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disjoint_versions_rejected_before_io() {
        let client = identity("client@host", "c", VersionRange::new(5, 5));
        let target = remote_of(&identity("server@host", "c", VersionRange::new(6, 6)));
        let (mut a, mut b) = duplex(1024);
        let result = initiate(&mut a, &client, &target).await;
        assert!(matches!(
            result,
            Err(HandshakeError::VersionMismatch {
                local_low: 5,
                local_high: 5,
                peer_low: 6,
                peer_high: 6
            })
        ));
        drop(a);
        let mut seen = Vec::new();
        b.read_to_end(&mut seen).await.unwrap();
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_mismatch_rejected() {
        let client = identity("client@host", "c", VersionRange::new(5, 6));
        let mut target = remote_of(&identity("server@host", "c", VersionRange::new(5, 6)));
        target.protocol = Protocol::Other(3);
        let (mut a, _b) = duplex(64);
        assert!(matches!(
            initiate(&mut a, &client, &target).await,
            Err(HandshakeError::ProtocolMismatch { local: 0, peer: 3 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_refused() {
        let client = identity("client@host", "c", VersionRange::new(5, 6));
        let server = identity("server@host", "c", VersionRange::new(5, 6));
        let target = remote_of(&server);
        let (mut a, mut b) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let cache = DescriptorCache::new();
            let lookup = StaticLookup::new();
            accept(&mut b, &server, &cache, &lookup).await
        });
        let c = initiate(&mut a, &client, &target).await;
        assert!(matches!(c, Err(HandshakeError::Status(ref s)) if s == "not_allowed"));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(HandshakeError::UnknownPeer(ref n)) if n == "client@host"
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let client = identity("client@host", "c", VersionRange::new(5, 6));
        let target = remote_of(&identity("server@host", "c", VersionRange::new(5, 6)));
        let (mut a, _b) = duplex(1024);
        assert!(matches!(
            initiate(&mut a, &client, &target).await,
            Err(HandshakeError::Timeout("NameSent"))
        ));
    }

    #[tokio::test]
    async fn test_unexpected_message_rejected() {
        let server = identity("server@host", "c", VersionRange::new(5, 6));
        let (mut a, mut b) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let cache = DescriptorCache::new();
            let lookup = StaticLookup::new();
            accept(&mut b, &server, &cache, &lookup).await
        });
        write_framed(&mut a, b"a0123456789abcdef").await.unwrap();
        assert!(matches!(
            server_task.await.unwrap(),
            Err(HandshakeError::UnexpectedMessage { tag: Some(b'a'), .. })
        ));
    }
}
