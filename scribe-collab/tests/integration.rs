//! Integration tests for end-to-end TCP collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use scribe_collab::auth::{decode_id_reply, hash_password, ID_REPLY_LEN};
use scribe_collab::client::{ClientConfig, ClientError, ConnectionState, Evaluation, SyncClient, SyncEvent};
use scribe_collab::frame::{write_message, FrameReader, MAX_FRAME_LEN};
use scribe_collab::ot::Operation;
use scribe_collab::protocol::{ClientId, Message, MessageKind, PeerInfo, Revision};
use scribe_collab::server::{ServerConfig, SyncServer};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout, Duration};

const PASSWORD: &str = "correct horse";
const WAIT: Duration = Duration::from_secs(5);

/// Start a server on a free port, return it with its address.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    start_server_with_peers(10).await
}

async fn start_server_with_peers(max_peers: usize) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = ServerConfig {
        bind_addr: addr.clone(),
        password: PASSWORD.to_string(),
        max_peers,
        outbound_capacity: 64,
        handshake_timeout_secs: 2,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run_with_listener(listener).await.unwrap();
    });
    (server, addr)
}

async fn connect(addr: &str, name: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let config = ClientConfig {
        server_addr: addr.to_string(),
        name: name.to_string(),
        password: PASSWORD.to_string(),
        ..ClientConfig::default()
    };
    let mut client = timeout(WAIT, SyncClient::connect(config))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let events = client.take_event_rx().unwrap();
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event<F>(events: &mut Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until every client has seen `revision` and has nothing in flight.
async fn settle(clients: &[&SyncClient], revision: Revision) {
    timeout(WAIT, async {
        loop {
            let mut done = true;
            for client in clients {
                if client.revision().await != revision || !client.is_synchronized().await {
                    done = false;
                }
            }
            if done {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not settle");
}

/// Password exchange over a raw socket, built from the library's own
/// framing and handshake helpers.
async fn raw_handshake(
    addr: &str,
    password: &str,
) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf, Option<ClientId>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_message(&mut write_half, &Message::password(hash_password(password)))
        .await
        .unwrap();
    let mut reader = FrameReader::new(read_half, MAX_FRAME_LEN);
    let mut reply = [0u8; ID_REPLY_LEN];
    reader.get_mut().read_exact(&mut reply).await.unwrap();
    (reader, write_half, decode_id_reply(&reply).unwrap())
}

async fn next_kind(reader: &mut FrameReader<OwnedReadHalf>) -> MessageKind {
    timeout(WAIT, reader.expect_message())
        .await
        .expect("timed out waiting for frame")
        .unwrap()
        .kind
}

#[tokio::test]
async fn test_client_connects_and_receives_state() {
    let (server, addr) = start_test_server().await;
    let (client, mut events) = connect(&addr, "Alice").await;

    match expect_event(&mut events, |_| true).await {
        SyncEvent::Connected { id, revision } => {
            assert_eq!(id, client.id());
            assert_eq!(revision, 0);
        }
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.document().await, "");
    assert_eq!(server.peers().await.len(), 1);
}

#[tokio::test]
async fn test_first_insert_on_empty_document() {
    let (server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    let (bob, mut bob_events) = connect(&addr, "Bob").await;

    alice.replace(0, 0, "hello").await.unwrap();

    let ack = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    assert_eq!(ack, SyncEvent::Acknowledged { revision: 1 });

    let remote = expect_event(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;
    match remote {
        SyncEvent::RemoteOperation {
            author, revision, ..
        } => {
            assert_eq!(author, alice.id());
            assert_eq!(revision, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    settle(&[&alice, &bob], 1).await;
    assert_eq!(alice.document().await, "hello");
    assert_eq!(bob.document().await, "hello");
    assert_eq!(server.stats().await.revision, 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (_server, addr) = start_test_server().await;
    let (alice, _alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;

    alice.replace(0, 0, "hello").await.unwrap();
    settle(&[&alice, &bob], 1).await;

    // both edit revision 1 without waiting for each other
    let (a, b) = tokio::join!(alice.replace(0, 0, "X"), bob.replace(5, 0, "Y"));
    a.unwrap();
    b.unwrap();

    settle(&[&alice, &bob], 3).await;
    assert_eq!(alice.document().await, "XhelloY");
    assert_eq!(bob.document().await, "XhelloY");
}

#[tokio::test]
async fn test_same_position_inserts_converge() {
    let (_server, addr) = start_test_server().await;
    let (alice, _alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;

    let (a, b) = tokio::join!(alice.replace(0, 0, "a"), bob.replace(0, 0, "b"));
    a.unwrap();
    b.unwrap();

    settle(&[&alice, &bob], 2).await;
    let doc = alice.document().await;
    assert_eq!(doc, bob.document().await);
    assert!(doc == "ab" || doc == "ba", "unexpected document {doc:?}");
}

#[tokio::test]
async fn test_bursts_of_typing_converge() {
    let (server, addr) = start_test_server().await;
    let (alice, _alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;
    let (carol, _carol_events) = connect(&addr, "Carol").await;

    for round in 0..10 {
        let digit = round.to_string();
        let (a, b, c) = tokio::join!(
            alice.replace(0, 0, "a"),
            bob.replace(0, 0, "b"),
            carol.replace(0, 0, &digit),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
    }

    // buffered edits are composed, so the final revision is not fixed;
    // wait for the server to go quiet and everyone to match it
    timeout(WAIT, async {
        loop {
            let revision = server.stats().await.revision;
            let mut done = true;
            for client in [&alice, &bob, &carol] {
                if client.revision().await != revision || !client.is_synchronized().await {
                    done = false;
                }
            }
            if done {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not settle");

    let doc = alice.document().await;
    assert_eq!(doc.chars().count(), 30);
    assert_eq!(doc, bob.document().await);
    assert_eq!(doc, carol.document().await);
}

#[tokio::test]
async fn test_incompatible_operation_kills_session() {
    let (server, addr) = start_test_server().await;
    let (watcher, mut watcher_events) = connect(&addr, "Watcher").await;

    let (mut reader, mut writer, id) = raw_handshake(&addr, PASSWORD).await;
    let id = id.expect("password should be accepted");
    let info = PeerInfo {
        id,
        name: "Mallory".into(),
        host: String::new(),
        port: 0,
    };
    write_message(&mut writer, &Message::connect(&info)).await.unwrap();

    loop {
        if let MessageKind::SetAll { revision, .. } = next_kind(&mut reader).await {
            assert_eq!(revision, 0);
            break;
        }
    }

    // built for a 9-char document, the real one is empty
    let bad = Operation::from_change(9, 0, 0, "x").unwrap();
    write_message(&mut writer, &Message::operation(id, bad, 0)).await.unwrap();

    match next_kind(&mut reader).await {
        MessageKind::Kill { reason } => assert!(reason.contains("incompatible"), "{reason}"),
        other => panic!("expected kill, got {other:?}"),
    }
    let closed = timeout(WAIT, reader.next_message()).await.unwrap().unwrap();
    assert!(closed.is_none());

    let left = expect_event(&mut watcher_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(id));

    let stats = server.stats().await;
    assert_eq!(stats.rejected_operations, 1);
    assert_eq!(stats.revision, 0);
    assert_eq!(watcher.document().await, "");
    assert_eq!(watcher.revision().await, 0);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (server, addr) = start_test_server().await;
    let (watcher, mut watcher_events) = connect(&addr, "Watcher").await;

    let (mut reader, _writer, id) = raw_handshake(&addr, "wrong").await;
    assert_eq!(id, None);
    let closed = timeout(WAIT, reader.next_message()).await.unwrap().unwrap();
    assert!(closed.is_none());

    let config = ClientConfig {
        server_addr: addr.clone(),
        password: "also wrong".into(),
        ..ClientConfig::default()
    };
    assert!(matches!(
        SyncClient::connect(config).await,
        Err(ClientError::Rejected)
    ));

    // flush the watcher's event stream with an edit of its own
    watcher.replace(0, 0, "ok").await.unwrap();
    loop {
        let event = expect_event(&mut watcher_events, |_| true).await;
        assert!(!matches!(event, SyncEvent::PeerJoined(_)), "{event:?}");
        if matches!(event, SyncEvent::Acknowledged { .. }) {
            break;
        }
    }

    assert_eq!(server.peers().await.len(), 1);
    timeout(WAIT, async {
        while server.stats().await.rejected_handshakes < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second rejection not counted");
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot() {
    let (_server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    alice.replace(0, 0, "shared text").await.unwrap();
    settle(&[&alice], 1).await;

    let (carol, mut carol_events) = connect(&addr, "Carol").await;
    assert_eq!(carol.document().await, "shared text");
    assert_eq!(carol.revision().await, 1);

    let joined = expect_event(&mut carol_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    match joined {
        SyncEvent::PeerJoined(info) => assert_eq!(info.name, "Alice"),
        other => panic!("unexpected {other:?}"),
    }
    let joined = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    match joined {
        SyncEvent::PeerJoined(info) => {
            assert_eq!(info.id, carol.id());
            assert_eq!(info.name, "Carol");
        }
        other => panic!("unexpected {other:?}"),
    }

    let names: Vec<String> = carol.peers().await.into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Alice".to_string(), "Carol".to_string()]);
}

#[tokio::test]
async fn test_disconnect_announces_peer_left() {
    let (server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;
    let bob_id = bob.id();

    bob.disconnect().await.unwrap();

    let left = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(bob_id));
    assert_eq!(alice.peer_position(bob_id).await, None);
    assert_eq!(server.peers().await.len(), 1);
}

#[tokio::test]
async fn test_dropped_client_announces_peer_left() {
    let (_server, addr) = start_test_server().await;
    let (_alice, mut alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;
    let bob_id = bob.id();

    drop(bob);

    let left = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(bob_id));
}

#[tokio::test]
async fn test_peer_position_follows_edits() {
    let (_server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    let (bob, _bob_events) = connect(&addr, "Bob").await;

    alice.replace(0, 0, "0123456789").await.unwrap();
    settle(&[&alice, &bob], 1).await;

    bob.set_mark(5).await.unwrap();
    let moved = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::PeerMoved { .. })).await;
    match moved {
        SyncEvent::PeerMoved { id, location } => {
            assert_eq!(id, bob.id());
            assert_eq!(location.cursor, 5);
        }
        other => panic!("unexpected {other:?}"),
    }

    alice.replace(2, 0, "abcd").await.unwrap();
    settle(&[&alice, &bob], 2).await;
    assert_eq!(alice.peer_position(bob.id()).await, Some(9));
    assert_eq!(bob.peer_position(bob.id()).await, Some(9));

    alice.replace(0, 4, "").await.unwrap();
    settle(&[&alice, &bob], 3).await;
    assert_eq!(alice.peer_position(bob.id()).await, Some(5));
}

#[tokio::test]
async fn test_evaluate_and_console_relay() {
    let (_server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    let (bob, mut bob_events) = connect(&addr, "Bob").await;

    alice.replace(0, 0, "play 42").await.unwrap();
    settle(&[&alice, &bob], 1).await;

    alice.evaluate_block(5, 7).await.unwrap();
    let expected = SyncEvent::Evaluate {
        author: alice.id(),
        evaluation: Evaluation::Block {
            start: 5,
            end: 7,
            text: "42".into(),
        },
    };
    for events in [&mut alice_events, &mut bob_events] {
        let event = expect_event(events, |e| matches!(e, SyncEvent::Evaluate { .. })).await;
        assert_eq!(event, expected);
    }

    bob.evaluate_string("1 + 1").await.unwrap();
    let event = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::Evaluate { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Evaluate {
            author: bob.id(),
            evaluation: Evaluation::String {
                code: "1 + 1".into()
            },
        }
    );

    // console output is not echoed to its origin
    bob.console("=> 2").await.unwrap();
    let event = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::Console { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Console {
            author: bob.id(),
            text: "=> 2".into()
        }
    );
    bob.replace(0, 0, "!").await.unwrap();
    loop {
        let event = expect_event(&mut bob_events, |_| true).await;
        assert!(!matches!(event, SyncEvent::Console { .. }), "{event:?}");
        if matches!(event, SyncEvent::Acknowledged { .. }) {
            break;
        }
    }
}

/// Wait until the server keeps exactly `len` operations of history.
async fn expect_history(server: &SyncServer, len: u64) {
    timeout(WAIT, async {
        while server.stats().await.history_len != len {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("history never reached {len} entries"));
}

#[tokio::test]
async fn test_idle_viewer_does_not_pin_history() {
    let (server, addr) = start_test_server().await;
    let (viewer, _viewer_events) = connect(&addr, "Viewer").await;
    let (writer, _writer_events) = connect(&addr, "Writer").await;

    for i in 0..20 {
        writer.replace(i, 0, "x").await.unwrap();
        settle(&[&writer], i as Revision + 1).await;
    }
    // the viewer may still transform against any of them
    expect_history(&server, 20).await;

    // a new peer makes everyone adopt a snapshot at revision 20
    let (late, _late_events) = connect(&addr, "Late").await;
    settle(&[&viewer, &writer, &late], 20).await;
    expect_history(&server, 0).await;

    writer.replace(0, 0, "y").await.unwrap();
    settle(&[&viewer, &writer, &late], 21).await;
    assert_eq!(viewer.document().await, late.document().await);
}

#[tokio::test]
async fn test_pending_handshakes_count_toward_max_peers() {
    let (server, addr) = start_server_with_peers(1).await;

    // authenticated but never sends connect
    let (pending_reader, pending_writer, id) = raw_handshake(&addr, PASSWORD).await;
    assert!(id.is_some());

    let (_reader, _writer, refused) = raw_handshake(&addr, PASSWORD).await;
    assert_eq!(refused, None);

    drop(pending_writer);
    drop(pending_reader);
    timeout(WAIT, async {
        loop {
            let (_reader, _writer, id) = raw_handshake(&addr, PASSWORD).await;
            if id.is_some() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot was never released");
    assert!(server.stats().await.rejected_handshakes >= 1);
}

#[tokio::test]
async fn test_request_resync() {
    let (_server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;
    alice.replace(0, 0, "abc").await.unwrap();
    settle(&[&alice], 1).await;

    alice.request_resync().await.unwrap();
    let reset = expect_event(&mut alice_events, |e| {
        matches!(e, SyncEvent::DocumentReset { revision: 1 })
    })
    .await;
    assert_eq!(reset, SyncEvent::DocumentReset { revision: 1 });
    assert_eq!(alice.document().await, "abc");
}

#[tokio::test]
async fn test_shutdown_kills_clients() {
    let (server, addr) = start_test_server().await;
    let (alice, mut alice_events) = connect(&addr, "Alice").await;

    server.shutdown("server shutting down").await;

    let killed = expect_event(&mut alice_events, |e| matches!(e, SyncEvent::Killed(_))).await;
    assert_eq!(killed, SyncEvent::Killed("server shutting down".into()));
    expect_event(&mut alice_events, |e| matches!(e, SyncEvent::Disconnected)).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Disconnected);
    assert!(matches!(
        alice.replace(0, 0, "late").await,
        Err(ClientError::NotConnected)
    ));
}
