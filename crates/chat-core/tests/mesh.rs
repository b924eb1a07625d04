//! End-to-end tests over loopback: several nodes in one runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chat_core::{event_channel, ChatController, ChatEvent, EventReceiver, NodeConfig, UserCommand};
use tokio::time::{sleep, timeout, Instant};

const PATIENCE: Duration = Duration::from_secs(5);

async fn node(name: &str) -> Result<(Arc<ChatController>, EventReceiver)> {
    let mut config = NodeConfig::new(0, name);
    config.probe_timeout_ms = 500;
    config.gossip_backoff_ms = 300;
    config.idle_probe_interval_secs = None;
    let (tx, rx) = event_channel();
    Ok((ChatController::start(config, tx).await?, rx))
}

fn knows(node: &ChatController, other: &ChatController) -> bool {
    node.peers()
        .iter()
        .any(|peer| peer.peer_id.listen_port == other.listen_port())
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("timed out waiting for {what}"))
}

async fn next_matching(
    events: &mut EventReceiver,
    mut wanted: impl FnMut(&ChatEvent) -> bool,
) -> Result<ChatEvent> {
    timeout(PATIENCE, async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("event channel closed"))
    })
    .await?
}

#[tokio::test]
async fn test_two_nodes_chat() -> Result<()> {
    let (ann, _ann_events) = node("ann").await?;
    let (bob, mut bob_events) = node("bob").await?;

    let info = ann.connect_to_now("127.0.0.1", bob.listen_port(), Some("bob")).await?;
    assert_eq!(info.username.as_deref(), Some("bob"));
    eventually("bob to register ann", || knows(&bob, &ann)).await?;

    let report = ann.broadcast("hello bob").await;
    assert_eq!(report.delivered, 1);
    assert!(report.failed.is_empty());

    match next_matching(&mut bob_events, |e| matches!(e, ChatEvent::ChatMessageArrived { .. })).await? {
        ChatEvent::ChatMessageArrived { peer, text, timestamp } => {
            assert_eq!(peer.username.as_deref(), Some("ann"));
            assert_eq!(text, "hello bob");
            assert!(timestamp > 0);
        }
        other => panic!("unexpected {other:?}"),
    }

    ann.send_private("bob", "just you").await?;
    match next_matching(&mut bob_events, |e| matches!(e, ChatEvent::ChatMessageArrived { .. })).await? {
        ChatEvent::ChatMessageArrived { text, .. } => assert_eq!(text, "just you"),
        other => panic!("unexpected {other:?}"),
    }

    ann.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_gossip_closes_the_triangle() -> Result<()> {
    let (a, _a_events) = node("a").await?;
    let (b, _b_events) = node("b").await?;
    let (c, _c_events) = node("c").await?;

    a.connect_to_now("127.0.0.1", b.listen_port(), None).await?;
    b.connect_to_now("127.0.0.1", c.listen_port(), None).await?;

    eventually("a and c to meet", || knows(&a, &c) && knows(&c, &a)).await?;
    eventually("every node to see two peers", || {
        a.registry().len() == 2 && b.registry().len() == 2 && c.registry().len() == 2
    })
    .await?;

    // let any straggling dial settle, then check nothing was duplicated or dropped
    sleep(Duration::from_millis(800)).await;
    for node in [&a, &b, &c] {
        assert_eq!(node.registry().len(), 2, "{} peers", node.username());
    }

    for node in [a, b, c] {
        node.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_second_connection_to_same_peer_is_collapsed() -> Result<()> {
    let (ann, mut ann_events) = node("ann").await?;
    let (bob, _bob_events) = node("bob").await?;

    let first = ann.connect_to_now("127.0.0.1", bob.listen_port(), None).await?;
    let second = ann.connect_to_now("127.0.0.1", bob.listen_port(), None).await?;
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(ann.registry().len(), 1);

    match next_matching(&mut ann_events, |e| matches!(e, ChatEvent::DuplicateResolved { .. })).await? {
        ChatEvent::DuplicateResolved { kept, dropped } => {
            assert_eq!(kept.session_id, first.session_id);
            assert_ne!(dropped.session_id, first.session_id);
        }
        other => panic!("unexpected {other:?}"),
    }

    eventually("bob to settle on one ann", || bob.registry().len() == 1).await?;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(bob.registry().len(), 1);
    assert_eq!(ann.registry().len(), 1);

    ann.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dialing_each_other_at_once_keeps_one_link() -> Result<()> {
    for round in 0..5 {
        let (ann, _ann_events) = node("ann").await?;
        let (bob, mut bob_events) = node("bob").await?;

        let _ = tokio::join!(
            ann.connect_to_now("127.0.0.1", bob.listen_port(), Some("bob")),
            bob.connect_to_now("127.0.0.1", ann.listen_port(), Some("ann"))
        );

        eventually("both sides to hold a link", || {
            ann.registry().len() == 1 && bob.registry().len() == 1
        })
        .await?;
        // outlast any probe still in flight
        sleep(Duration::from_millis(800)).await;
        assert_eq!(ann.registry().len(), 1, "round {round}");
        assert_eq!(bob.registry().len(), 1, "round {round}");

        let text = format!("round {round}");
        assert_eq!(ann.broadcast(&text).await.delivered, 1);
        match next_matching(&mut bob_events, |e| {
            matches!(e, ChatEvent::ChatMessageArrived { text: t, .. } if *t == text)
        })
        .await?
        {
            ChatEvent::ChatMessageArrived { peer, .. } => {
                assert_eq!(peer.username.as_deref(), Some("ann"))
            }
            other => panic!("unexpected {other:?}"),
        }

        ann.shutdown().await;
        bob.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_oversized_broadcast_keeps_the_link() -> Result<()> {
    let (ann, mut ann_events) = node("ann").await?;
    let (bob, mut bob_events) = node("bob").await?;
    ann.connect_to_now("127.0.0.1", bob.listen_port(), None).await?;
    eventually("bob to register ann", || knows(&bob, &ann)).await?;

    let report = ann.broadcast(&"x".repeat(600_000)).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.failed.len(), 1);
    next_matching(&mut ann_events, |e| matches!(e, ChatEvent::SendFailed { .. })).await?;

    assert_eq!(ann.broadcast("still here").await.delivered, 1);
    match next_matching(&mut bob_events, |e| matches!(e, ChatEvent::ChatMessageArrived { .. })).await? {
        ChatEvent::ChatMessageArrived { text, .. } => assert_eq!(text, "still here"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ann.registry().len(), 1);
    assert_eq!(bob.registry().len(), 1);

    ann.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_disconnects_peers() -> Result<()> {
    let (ann, _ann_events) = node("ann").await?;
    let (bob, mut bob_events) = node("bob").await?;
    ann.connect_to_now("127.0.0.1", bob.listen_port(), None).await?;
    eventually("bob to register ann", || knows(&bob, &ann)).await?;

    ann.handle_command(UserCommand::Shutdown).await?;
    ann.shutdown().await;
    assert!(ann.registry().is_empty());

    match next_matching(&mut bob_events, |e| matches!(e, ChatEvent::ClientDisconnected { .. })).await? {
        ChatEvent::ClientDisconnected { peer, .. } => {
            assert_eq!(peer.username.as_deref(), Some("ann"))
        }
        other => panic!("unexpected {other:?}"),
    }
    eventually("bob to forget ann", || bob.registry().is_empty()).await?;

    // a stopped node no longer accepts connections
    let refused = bob.connect_to_now("127.0.0.1", ann.listen_port(), None).await;
    assert!(refused.is_err());

    bob.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_commands_drive_the_controller() -> Result<()> {
    let (ann, _ann_events) = node("ann").await?;
    let (bob, mut bob_events) = node("bob").await?;
    ann.connect_to_now("127.0.0.1", bob.listen_port(), None).await?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = tokio::spawn(ann.clone().run_commands(rx));
    tx.send(UserCommand::Private {
        username: "bob".into(),
        text: "psst".into(),
    })?;
    tx.send(UserCommand::Private {
        username: "nobody".into(),
        text: "lost".into(),
    })?;
    tx.send(UserCommand::Shutdown)?;
    timeout(PATIENCE, runner).await??;

    match next_matching(&mut bob_events, |e| matches!(e, ChatEvent::ChatMessageArrived { .. })).await? {
        ChatEvent::ChatMessageArrived { text, .. } => assert_eq!(text, "psst"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(ann.is_stopped());

    bob.shutdown().await;
    Ok(())
}
