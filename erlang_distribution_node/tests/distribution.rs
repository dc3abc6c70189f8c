use std::sync::Arc;
use std::time::Duration;

use erlang_distribution_node::{Mailbox, Node, NodeConfig, NodeError, ReceiveError, StaticLookup, Term};

async fn start(name: &str, cookie: &str, lookup: &Arc<StaticLookup>) -> Node {
    Node::start(NodeConfig::new(name, cookie), lookup.clone())
        .await
        .unwrap()
}

async fn pair() -> (Node, Node) {
    let lookup = Arc::new(StaticLookup::new());
    let a = start("a@localhost", "cookie", &lookup).await;
    let b = start("b@localhost", "cookie", &lookup).await;
    (a, b)
}

/// Round trip through `to` so everything sent from `from` before is known
/// to have arrived.
async fn sync(from: &Mailbox, to: &Mailbox) {
    from.send(to.pid(), Term::atom("sync")).await.unwrap();
    assert_eq!(to.receive().await.unwrap(), Term::atom("sync"));
}

fn payload() -> Term {
    Term::tuple(vec![
        Term::binary(vec![56, 16, 78]),
        Term::from(42),
        Term::string("Hello world"),
        Term::list(vec![Term::from(1), Term::from(2), Term::from(3)]),
    ])
}

#[tokio::test]
async fn test_local_echo() {
    let lookup = Arc::new(StaticLookup::new());
    let node = start("echo@localhost", "cookie", &lookup).await;
    let first = node.mailbox().build().unwrap();
    let second = node.mailbox().build().unwrap();

    let message = Term::tuple(vec![Term::atom("ok"), payload()]);
    first.send(second.pid(), message).await.unwrap();

    let received = second.receive().await.unwrap();
    let inner = received.element(1).unwrap().clone();
    second.send(first.pid(), inner).await.unwrap();

    assert_eq!(first.receive().await.unwrap(), payload());
    node.close().await;
}

#[tokio::test]
async fn test_local_ordering() {
    let lookup = Arc::new(StaticLookup::new());
    let node = start("order@localhost", "cookie", &lookup).await;
    let sender = node.mailbox().build().unwrap();
    let receiver = node.mailbox().build().unwrap();
    for n in 1..=3 {
        sender.send(receiver.pid(), Term::from(n)).await.unwrap();
    }
    for n in 1..=3 {
        assert_eq!(receiver.receive().await.unwrap(), Term::from(n));
    }
    node.close().await;
}

#[tokio::test]
async fn test_receive_timeout() {
    let lookup = Arc::new(StaticLookup::new());
    let node = start("quiet@localhost", "cookie", &lookup).await;
    let mailbox = node.mailbox().build().unwrap();
    assert_eq!(mailbox.receive_timeout(Duration::from_millis(50)).await, Ok(None));

    mailbox.send(mailbox.pid(), Term::atom("late")).await.unwrap();
    assert_eq!(
        mailbox.receive_timeout(Duration::from_millis(50)).await,
        Ok(Some(Term::atom("late")))
    );
    node.close().await;
}

#[tokio::test]
async fn test_local_link_exit() {
    let lookup = Arc::new(StaticLookup::new());
    let node = start("links@localhost", "cookie", &lookup).await;
    let a = node.mailbox().build().unwrap();
    let b = node.mailbox().build().unwrap();
    a.link(b.pid()).await.unwrap();
    assert!(b.is_linked(a.pid()));

    b.exit(Term::atom("boom"));
    assert_eq!(
        a.receive().await,
        Err(ReceiveError::Exit {
            from: b.pid().clone(),
            reason: Term::atom("boom"),
        })
    );
    assert!(!a.is_linked(b.pid()));
    node.close().await;
}

#[tokio::test]
async fn test_remote_ordering() {
    let (a, b) = pair().await;
    let sender = a.mailbox().build().unwrap();
    let receiver = b.mailbox().build().unwrap();
    for n in 1..=3 {
        sender.send(receiver.pid(), Term::from(n)).await.unwrap();
    }
    for n in 1..=3 {
        assert_eq!(receiver.receive().await.unwrap(), Term::from(n));
    }
    assert!(a.is_connected("b@localhost"));
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_remote_named_echo() {
    let (a, b) = pair().await;
    let client = a.mailbox().build().unwrap();
    let server = b.mailbox().name("echo").build().unwrap();

    let request = Term::tuple(vec![Term::Pid(client.pid().clone()), payload()]);
    client.send_remote("b@localhost", "echo", request).await.unwrap();

    let received = server.receive().await.unwrap();
    let reply_to = received.element(0).and_then(Term::as_pid).unwrap().clone();
    assert_eq!(reply_to.node.as_str(), "a@localhost");
    server
        .send(&reply_to, received.element(1).unwrap().clone())
        .await
        .unwrap();

    assert_eq!(client.receive().await.unwrap(), payload());
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_concurrent_connects_share_one_connection() {
    let (a, b) = pair().await;
    let (first, second) = tokio::join!(a.connect("b@localhost"), a.connect("b@localhost"));
    first.unwrap();
    second.unwrap();
    assert_eq!(a.connected_nodes(), vec!["b@localhost".to_owned()]);
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_cookie_mismatch_fails_to_connect() {
    let lookup = Arc::new(StaticLookup::new());
    let a = start("a@localhost", "one", &lookup).await;
    let b = start("b@localhost", "two", &lookup).await;
    assert!(matches!(
        a.connect("b@localhost").await,
        Err(NodeError::Connect { .. })
    ));
    assert!(!a.is_connected("b@localhost"));
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_unknown_node() {
    let (a, b) = pair().await;
    assert!(matches!(
        a.connect("ghost@localhost").await,
        Err(NodeError::NodeNotFound(name)) if name == "ghost@localhost"
    ));
    assert!(!a.ping("ghost@localhost").await);
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_ping() {
    let (a, b) = pair().await;
    assert!(a.ping("b@localhost").await);
    assert!(b.ping("a@localhost").await);
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_remote_link_exit() {
    let (a, b) = pair().await;
    let local = a.mailbox().build().unwrap();
    let remote = b.mailbox().build().unwrap();
    local.link(remote.pid()).await.unwrap();
    sync(&local, &remote).await;
    assert!(remote.is_linked(local.pid()));

    remote.exit(Term::atom("boom"));
    assert_eq!(
        local.receive().await,
        Err(ReceiveError::Exit {
            from: remote.pid().clone(),
            reason: Term::atom("boom"),
        })
    );
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_remote_unlink() {
    let (a, b) = pair().await;
    let local = a.mailbox().build().unwrap();
    let remote = b.mailbox().build().unwrap();
    local.link(remote.pid()).await.unwrap();
    sync(&local, &remote).await;

    local.unlink(remote.pid()).await.unwrap();
    assert!(!local.is_linked(remote.pid()));
    sync(&local, &remote).await;
    assert!(!remote.is_linked(local.pid()));

    remote.exit(Term::atom("boom"));
    assert_eq!(local.receive_timeout(Duration::from_millis(100)).await, Ok(None));
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_link_to_unreachable_node() {
    let (a, b) = pair().await;
    let local = a.mailbox().build().unwrap();
    let ghost = erlang_distribution_node::Pid::new("ghost@localhost".into(), 1, 0, 1);
    local.link(&ghost).await.unwrap();
    assert_eq!(
        local.receive().await,
        Err(ReceiveError::Exit {
            from: ghost,
            reason: Term::atom("noconnection"),
        })
    );
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_remote_monitor_down() {
    let (a, b) = pair().await;
    let watcher = a.mailbox().build().unwrap();
    let watched = b.mailbox().build().unwrap();
    let reference = watcher.monitor(watched.pid().clone()).await.unwrap();
    sync(&watcher, &watched).await;

    watched.exit(Term::atom("crashed"));
    assert_eq!(
        watcher.receive().await,
        Err(ReceiveError::Down {
            reference,
            from: Term::Pid(watched.pid().clone()),
            reason: Term::atom("crashed"),
        })
    );
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_disconnect_breaks_links() {
    let (a, b) = pair().await;
    let local = a.mailbox().build().unwrap();
    let remote = b.mailbox().build().unwrap();
    local.link(remote.pid()).await.unwrap();
    sync(&local, &remote).await;

    assert!(a.disconnect("b@localhost"));
    assert_eq!(
        local.receive().await,
        Err(ReceiveError::Exit {
            from: remote.pid().clone(),
            reason: Term::atom("noconnection"),
        })
    );
    assert_eq!(
        remote.receive().await,
        Err(ReceiveError::Exit {
            from: local.pid().clone(),
            reason: Term::atom("noconnection"),
        })
    );
    assert!(!a.is_connected("b@localhost"));
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_node_close_exits_remote_links() {
    let (a, b) = pair().await;
    let local = a.mailbox().build().unwrap();
    let remote = b.mailbox().build().unwrap();
    local.link(remote.pid()).await.unwrap();
    sync(&local, &remote).await;

    b.close().await;
    assert_eq!(
        local.receive().await,
        Err(ReceiveError::Exit {
            from: remote.pid().clone(),
            reason: Term::atom("normal"),
        })
    );
    assert!(remote.is_closed());
    a.close().await;
}
