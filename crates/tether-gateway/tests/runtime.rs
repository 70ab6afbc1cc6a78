//! End-to-end session runtime scenarios over the mock transport.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use tether_core::protocol::{
    AckPayload, Body, Message, PingPayload, ReconnectPayload, TerminalCreatePayload,
    TerminalInputPayload,
};
use tether_core::queue::{MessageQueue, QueueConfig};
use tether_gateway::chat::ChatHandler;
use tether_gateway::connection::{RuntimeConfig, SessionDeps, SessionRuntime};
use tether_gateway::terminal::{ManagerConfig, TerminalManager};
use tether_test_utils::{mock_transport, MockClient, StubAssistant};

const WAIT: Duration = Duration::from_secs(5);

fn quiet_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        read_timeout: Duration::from_secs(30),
        write_timeout: Duration::from_secs(2),
        // Far enough out that tests never see keepalive traffic.
        ping_interval: Duration::from_secs(300),
        retry_scan_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

fn start_session(
    queue: Arc<MessageQueue>,
    chat: Arc<dyn ChatHandler>,
    config: RuntimeConfig,
) -> (MockClient, tokio::task::JoinHandle<()>) {
    let terminals = Arc::new(TerminalManager::new(ManagerConfig {
        shell: "/bin/sh".into(),
        ..Default::default()
    }));

    let runtime = SessionRuntime::new(
        config,
        SessionDeps {
            queue,
            terminals,
            chat,
        },
    );

    let (reader, writer, client) = mock_transport();
    let task = tokio::spawn(runtime.run(reader, writer));
    (client, task)
}

async fn expect_session_start(client: &mut MockClient) -> (String, Message) {
    let msg = client.recv(WAIT).await.expect("session_start");
    match &msg.body {
        Body::SessionStart(start) => (start.session_id.clone(), msg.clone()),
        other => panic!("expected session_start first, got {:?}", other),
    }
}

fn ping(id: &str) -> Message {
    let mut msg = Message::new(Body::Ping(PingPayload::default()));
    msg.id = id.to_string();
    msg
}

fn ack(message_id: &str) -> Message {
    Message::new(Body::Ack(AckPayload {
        message_id: message_id.to_string(),
        seq_num: None,
        success: true,
    }))
}

// S1: ping in, pong out.
#[tokio::test]
async fn ping_yields_pong() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub.clone(), quiet_runtime_config());

    let (_, start) = expect_session_start(&mut client).await;
    assert_eq!(start.seq, 1);

    client.send(ping("m1")).await;

    let pong = client.recv(WAIT).await.expect("pong");
    match &pong.body {
        Body::Pong(payload) => assert!(payload.timestamp_ms.is_some()),
        other => panic!("expected pong, got {:?}", other),
    }
    assert_eq!(pong.correlation_id.as_deref(), Some("m1"));
    assert_eq!(pong.seq, 2);

    client.hang_up();
    task.await.unwrap();
    assert!(stub.is_closed());
}

// Sequence numbers on the wire are strictly increasing and gap-free.
#[tokio::test]
async fn outbound_sequences_are_gap_free() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    expect_session_start(&mut client).await;

    for i in 0..5 {
        client.send(ping(&format!("p{}", i))).await;
    }

    let mut last_seq = 1; // session_start took seq 1
    for _ in 0..5 {
        let msg = client.recv(WAIT).await.expect("pong");
        assert_eq!(msg.seq, last_seq + 1);
        last_seq = msg.seq;
    }

    client.hang_up();
    task.await.unwrap();
}

// S3: chat streams scripted tokens in order, then a final empty chunk, and
// the original message is acked on the wire.
#[tokio::test]
async fn chat_streams_tokens_then_acks() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&["Hello", " world", "."]));
    let (mut client, task) = start_session(queue, stub.clone(), quiet_runtime_config());

    expect_session_start(&mut client).await;

    let mut chat = Message::new(Body::Chat(tether_core::protocol::ChatPayload {
        role: "user".into(),
        content: "greet".into(),
        files: None,
        metadata: None,
    }));
    chat.id = "m-chat".into();
    client.send(chat).await;

    for expected in ["Hello", " world", "."] {
        let msg = client.recv(WAIT).await.expect("stream chunk");
        match &msg.body {
            Body::ChatStream(chunk) => {
                assert_eq!(chunk.content, expected);
                assert!(!chunk.finished);
            }
            other => panic!("expected chat_stream, got {:?}", other),
        }
        assert_eq!(msg.correlation_id.as_deref(), Some("m-chat"));
    }

    let fin = client.recv(WAIT).await.expect("final chunk");
    match &fin.body {
        Body::ChatStream(chunk) => {
            assert!(chunk.finished);
            assert!(chunk.content.is_empty());
        }
        other => panic!("expected final chat_stream, got {:?}", other),
    }

    let ack = client.recv(WAIT).await.expect("ack");
    match &ack.body {
        Body::Ack(payload) => {
            assert_eq!(payload.message_id, "m-chat");
            assert!(payload.success);
        }
        other => panic!("expected ack, got {:?}", other),
    }

    assert_eq!(stub.received(), vec![("user".to_string(), "greet".to_string())]);

    client.hang_up();
    task.await.unwrap();
}

// A failing chat handler produces a classified chat_error, not a teardown.
#[tokio::test]
async fn chat_failure_yields_chat_error_frame() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::failing("exec blew up"));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    expect_session_start(&mut client).await;

    let mut chat = Message::new(Body::Chat(tether_core::protocol::ChatPayload {
        role: "user".into(),
        content: "hi".into(),
        files: None,
        metadata: None,
    }));
    chat.id = "m-fail".into();
    client.send(chat).await;

    let err = client.recv(WAIT).await.expect("chat_error");
    match &err.body {
        Body::ChatError(payload) => {
            assert_eq!(payload.code, "PROCESS");
            assert!(payload.retryable);
        }
        other => panic!("expected chat_error, got {:?}", other),
    }

    let ack = client.recv(WAIT).await.expect("ack");
    match &ack.body {
        Body::Ack(payload) => {
            assert_eq!(payload.message_id, "m-fail");
            assert!(!payload.success);
        }
        other => panic!("expected ack, got {:?}", other),
    }

    // The session is still alive.
    client.send(ping("m-after")).await;
    assert!(matches!(
        client.recv(WAIT).await.expect("pong").body,
        Body::Pong(_)
    ));

    client.hang_up();
    task.await.unwrap();
}

// S4: reconnect with last-seen seq replays everything newer, in order.
#[tokio::test]
async fn reconnect_replays_messages_after_last_seq() {
    let queue = Arc::new(MessageQueue::default());

    // Five messages were produced earlier in the session: seq 1 and 2 were
    // delivered and acked, seq 3..5 are still queued.
    for i in 0..5 {
        let mut msg = Message::new(Body::Pong(PingPayload::default()));
        msg.id = format!("seed-{}", i);
        queue.enqueue(msg);
    }
    for _ in 0..2 {
        let sent = queue.dequeue().unwrap();
        queue.ack(&sent.id);
    }

    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    // The backlog (seq 3..5) flushes alongside session_start (seq 6).
    let mut session_id = String::new();
    let mut delivered = Vec::new();
    for _ in 0..4 {
        let msg = client.recv(WAIT).await.expect("backlog");
        if let Body::SessionStart(start) = &msg.body {
            session_id = start.session_id.clone();
        }
        delivered.push(msg);
    }
    assert!(!session_id.is_empty());

    // Ack only session_start; seq 3..5 stay unacked in flight.
    let start_id = delivered
        .iter()
        .find(|m| matches!(m.body, Body::SessionStart(_)))
        .unwrap()
        .id
        .clone();
    client.send(ack(&start_id)).await;

    // Reconnect claiming we saw up to seq 2.
    client
        .send(Message::new(Body::Reconnect(ReconnectPayload {
            session_id,
            last_seq_num: 2,
        })))
        .await;

    let replayed: Vec<u64> = [
        client.recv(WAIT).await.expect("replay 3"),
        client.recv(WAIT).await.expect("replay 4"),
        client.recv(WAIT).await.expect("replay 5"),
    ]
    .iter()
    .map(|m| m.seq)
    .collect();
    assert_eq!(replayed, vec![3, 4, 5]);

    client.hang_up();
    task.await.unwrap();
}

// A reconnect for some other session is silently ignored.
#[tokio::test]
async fn reconnect_for_unknown_session_is_ignored() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    expect_session_start(&mut client).await;

    client
        .send(Message::new(Body::Reconnect(ReconnectPayload {
            session_id: "someone-else".into(),
            last_seq_num: 0,
        })))
        .await;

    assert!(client.drain_for(Duration::from_millis(300)).await.is_empty());

    client.hang_up();
    task.await.unwrap();
}

// S5: an unacked message is retried with its original sequence number, at
// most three times, then dropped.
#[tokio::test]
async fn unacked_messages_retry_then_drop() {
    let queue = Arc::new(MessageQueue::new(QueueConfig {
        capacity: 100,
        max_retries: 3,
        retry_timeout: Duration::from_millis(100),
    }));

    let config = RuntimeConfig {
        retry_scan_interval: Duration::from_millis(25),
        ..quiet_runtime_config()
    };
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, config);

    let (_, start) = expect_session_start(&mut client).await;
    let start_id = start.id.clone();
    client.send(ack(&start_id)).await;

    client.send(ping("m-retry")).await;
    let pong = client.recv(WAIT).await.expect("pong");
    let pong_seq = pong.seq;

    // Never ack: collect everything the retry pump resends.
    let resends: Vec<Message> = client
        .drain_for(Duration::from_millis(1500))
        .await
        .into_iter()
        .filter(|m| matches!(m.body, Body::Pong(_)))
        .collect();

    assert!(
        (1..=3).contains(&resends.len()),
        "expected 1..=3 resends, got {}",
        resends.len()
    );
    for resend in &resends {
        assert_eq!(resend.seq, pong_seq, "retries keep their sequence number");
    }

    // The retry cap has dropped it: a later window stays silent.
    let more = client.drain_for(Duration::from_millis(500)).await;
    assert!(
        more.iter().all(|m| !matches!(m.body, Body::Pong(_))),
        "message must vanish after the retry cap"
    );

    client.hang_up();
    task.await.unwrap();
}

// Acking twice (and acking garbage) is harmless.
#[tokio::test]
async fn duplicate_and_unknown_acks_are_noops() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue.clone(), stub, quiet_runtime_config());

    let (_, start) = expect_session_start(&mut client).await;

    client.send(ack(&start.id)).await;
    client.send(ack(&start.id)).await;
    client.send(ack("never-existed")).await;

    // Still responsive.
    client.send(ping("m-ok")).await;
    let pong = client.recv(WAIT).await.expect("pong");
    assert!(matches!(pong.body, Body::Pong(_)));

    // Acking the pong empties in-flight; repeating it changes nothing.
    client.send(ack(&pong.id)).await;
    client.send(ack(&pong.id)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.in_flight_len(), 0);

    client.hang_up();
    task.await.unwrap();
}

// Reserved kinds are logged and dropped without breaking the session.
#[tokio::test]
async fn reserved_kinds_are_ignored() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    expect_session_start(&mut client).await;

    client
        .send(Message::new(Body::GitStatus(
            tether_core::protocol::GitQueryPayload::default(),
        )))
        .await;
    assert!(client.drain_for(Duration::from_millis(200)).await.is_empty());

    client.send(ping("m-still-here")).await;
    assert!(matches!(
        client.recv(WAIT).await.expect("pong").body,
        Body::Pong(_)
    ));

    client.hang_up();
    task.await.unwrap();
}

// S2: terminal create / input / output, with output tagged by terminal id.
#[tokio::test]
async fn terminal_echo_roundtrip() {
    let queue = Arc::new(MessageQueue::default());
    let stub = Arc::new(StubAssistant::scripted(&[]));
    let (mut client, task) = start_session(queue, stub, quiet_runtime_config());

    expect_session_start(&mut client).await;

    let mut create = Message::new(Body::TerminalCreate(TerminalCreatePayload {
        rows: Some(24),
        cols: Some(80),
        ..Default::default()
    }));
    create.id = "m-create".into();
    client.send(create).await;

    let created = client.recv(WAIT).await.expect("terminal_created");
    let terminal_id = match &created.body {
        Body::TerminalCreated(payload) => payload.terminal_id.clone(),
        Body::TerminalError(_) => {
            eprintln!("skipping: no pty available");
            client.hang_up();
            task.await.unwrap();
            return;
        }
        other => panic!("expected terminal_created, got {:?}", other),
    };
    assert_eq!(created.correlation_id.as_deref(), Some("m-create"));

    let mut input = Message::new(Body::TerminalInput(TerminalInputPayload {
        terminal_id: terminal_id.clone(),
        data: BASE64.encode(b"echo hi\n"),
    }));
    input.id = "m-input".into();
    client.send(input).await;

    // Collect output until the echo shows up; every frame is tagged with
    // this terminal's id.
    let mut collected = String::new();
    let mut acked = false;
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline && !(collected.contains("hi") && acked) {
        let Some(msg) = client.recv(Duration::from_millis(500)).await else {
            continue;
        };
        match &msg.body {
            Body::TerminalOutput(out) => {
                assert_eq!(out.terminal_id, terminal_id);
                let bytes = BASE64.decode(out.data.as_bytes()).unwrap();
                collected.push_str(&String::from_utf8_lossy(&bytes));
            }
            Body::Ack(payload) if payload.message_id == "m-input" => acked = true,
            other => panic!("unexpected frame during echo: {:?}", other),
        }
    }

    assert!(collected.contains("hi"), "terminal output: {:?}", collected);
    assert!(acked, "terminal_input must be acked");

    client.hang_up();
    task.await.unwrap();
}
