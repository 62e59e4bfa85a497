use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use argon2::Params;
use chat_server::{
    codec::ClientCodec,
    config::SessionLimits,
    message::{ClientFrame, SERVER_NAME, ServerFrame},
    operator::{Operator, OperatorCommand},
    registry::Registry,
    server::Server,
    store::{CredentialStore, JsonAccountStore, SharedStore},
};
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(150);

struct Harness {
    addr: SocketAddr,
    registry: Arc<Registry>,
    operator: Operator,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start(accounts: &[(&str, &str)]) -> Result<Self> {
        Self::start_with(accounts, SessionLimits::default()).await
    }

    async fn start_with(accounts: &[(&str, &str)], limits: SessionLimits) -> Result<Self> {
        let params = Params::new(Params::MIN_M_COST, Params::MIN_T_COST, Params::MIN_P_COST, None)
            .expect("minimum argon2 params are valid");
        let store = JsonAccountStore::in_memory().with_params(params);
        for (name, password) in accounts {
            store.register(name, password)?;
        }
        let store: SharedStore = Arc::new(store);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, store, limits);
        let addr = server.local_addr()?;
        let registry = server.registry();
        let operator = server.operator();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.run_until(std::future::pending::<()>()));

        Ok(Self {
            addr,
            registry,
            operator,
            shutdown,
            task,
        })
    }

    async fn login(&self, username: &str, password: &str) -> Result<TestClient> {
        let mut client = TestClient::connect(self.addr).await?;
        client.send(&ClientFrame::login(username, password)).await?;
        assert_eq!(
            client.expect().await?,
            ServerFrame::server(format!("Login successful. Welcome back, {username}!"))
        );
        Ok(client)
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

struct TestClient {
    frames: FramedRead<OwnedReadHalf, ClientCodec>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            frames: FramedRead::new(reader, ClientCodec::new()),
            writer,
        })
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.send_raw(&line).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<()> {
        self.send(&ClientFrame::from_input(line)).await
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>> {
        match timeout(WAIT, self.frames.next()).await? {
            Some(frame) => Ok(Some(frame??)),
            None => Ok(None),
        }
    }

    async fn expect(&mut self) -> Result<ServerFrame> {
        match self.recv().await? {
            Some(frame) => Ok(frame),
            None => bail!("connection closed while a frame was expected"),
        }
    }

    /// EOF or a reset both count: a server closing with unread input resets.
    async fn expect_closed(&mut self) -> Result<()> {
        match timeout(WAIT, self.frames.next()).await? {
            None | Some(Err(_)) => Ok(()),
            Some(Ok(frame)) => bail!("expected the server to close, got {frame:?}"),
        }
    }

    async fn expect_quiet(&mut self) {
        assert!(
            timeout(QUIET, self.frames.next()).await.is_err(),
            "expected no pending frames"
        );
    }
}

fn joined(username: &str) -> ServerFrame {
    ServerFrame::server(format!("{username} has joined the chat."))
}

fn left(username: &str) -> ServerFrame {
    ServerFrame::server(format!("{username} has left the chat."))
}

#[tokio::test]
async fn say_reaches_everyone_but_the_sender() -> Result<()> {
    let harness = Harness::start(&[("alice", "pw-a"), ("bob", "pw-b")]).await?;
    let mut alice = harness.login("alice", "pw-a").await?;
    let mut bob = harness.login("bob", "pw-b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    alice.command("hello bob").await?;
    assert_eq!(bob.expect().await?, ServerFrame::message("alice", "hello bob"));

    alice.command("/ping").await?;
    assert_eq!(alice.expect().await?, ServerFrame::command("pong"));
    bob.expect_quiet().await;

    harness.stop().await
}

#[tokio::test]
async fn wrong_password_is_rejected_and_closed() -> Result<()> {
    let harness = Harness::start(&[("carol", "right")]).await?;

    let mut carol = TestClient::connect(harness.addr).await?;
    carol.send(&ClientFrame::login("carol", "wrong")).await?;
    assert_eq!(
        carol.expect().await?,
        ServerFrame::server("Incorrect password. Connection rejected.")
    );
    carol.expect_closed().await?;
    assert!(!harness.registry.contains("carol").await);

    let mut ghost = TestClient::connect(harness.addr).await?;
    ghost.send(&ClientFrame::login("ghost", "pw")).await?;
    assert_eq!(
        ghost.expect().await?,
        ServerFrame::server("Username not found. Connection rejected.")
    );
    ghost.expect_closed().await?;

    harness.stop().await
}

#[tokio::test]
async fn chat_before_login_is_rejected() -> Result<()> {
    let harness = Harness::start(&[]).await?;

    let mut client = TestClient::connect(harness.addr).await?;
    client.command("hello?").await?;
    assert_eq!(
        client.expect().await?,
        ServerFrame::server(
            "First message must be a login or register request. Connection rejected."
        )
    );
    client.expect_closed().await?;
    assert!(harness.registry.is_empty().await);

    harness.stop().await
}

#[tokio::test]
async fn duplicate_registration_is_rejected() -> Result<()> {
    let harness = Harness::start(&[]).await?;

    let mut first = TestClient::connect(harness.addr).await?;
    first.send(&ClientFrame::register("dave", "pw")).await?;
    assert_eq!(
        first.expect().await?,
        ServerFrame::server("Registration successful. Welcome to the chat, dave!")
    );

    let mut second = TestClient::connect(harness.addr).await?;
    second.send(&ClientFrame::register("dave", "other")).await?;
    assert_eq!(
        second.expect().await?,
        ServerFrame::server("Username already exists. Connection rejected.")
    );
    second.expect_closed().await?;
    first.expect_quiet().await;

    harness.stop().await
}

#[tokio::test]
async fn concurrent_logins_admit_one_session() -> Result<()> {
    let harness = Harness::start(&[("erin", "pw")]).await?;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TestClient::connect(harness.addr).await?);
    }
    for client in &mut clients {
        client.send(&ClientFrame::login("erin", "pw")).await?;
    }

    let welcome = ServerFrame::server("Login successful. Welcome back, erin!");
    let rejected = ServerFrame::server("User is already logged in. Connection rejected.");
    let mut admitted = 0;
    for client in &mut clients {
        let reply = client.expect().await?;
        if reply == welcome {
            admitted += 1;
        } else {
            assert_eq!(reply, rejected);
            client.expect_closed().await?;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(harness.registry.snapshot().await, vec!["erin".to_string()]);

    harness.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_create_one_account() -> Result<()> {
    let harness = Harness::start(&[]).await?;

    let mut clients = Vec::new();
    for _ in 0..6 {
        clients.push(TestClient::connect(harness.addr).await?);
    }
    for client in &mut clients {
        client.send(&ClientFrame::register("xena", "pw")).await?;
    }

    let welcome = ServerFrame::server("Registration successful. Welcome to the chat, xena!");
    let taken = ServerFrame::server("Username already exists. Connection rejected.");
    let mut admitted = 0;
    for client in &mut clients {
        let reply = client.expect().await?;
        if reply == welcome {
            admitted += 1;
        } else {
            assert_eq!(reply, taken);
            client.expect_closed().await?;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(harness.registry.snapshot().await, vec!["xena".to_string()]);

    harness.stop().await
}

#[tokio::test]
async fn private_messages_reach_only_the_target() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b"), ("carol", "c")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));
    let mut carol = harness.login("carol", "c").await?;
    assert_eq!(alice.expect().await?, joined("carol"));
    assert_eq!(bob.expect().await?, joined("carol"));

    alice.command("/msg bob meet at noon").await?;
    assert_eq!(bob.expect().await?, ServerFrame::private("alice", "meet at noon"));
    assert_eq!(
        alice.expect().await?,
        ServerFrame::private_sent("bob", "meet at noon")
    );

    alice.command("/msg zed hi").await?;
    assert_eq!(
        alice.expect().await?,
        ServerFrame::command("User zed is not online.")
    );

    alice.command("/msg bob").await?;
    assert_eq!(
        alice.expect().await?,
        ServerFrame::command("Usage: /msg <user> <message>")
    );
    carol.expect_quiet().await;

    harness.stop().await
}

#[tokio::test]
async fn actions_are_echoed_to_the_sender() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    alice.command("/me waves").await?;
    assert_eq!(alice.expect().await?, ServerFrame::action("* alice waves"));
    assert_eq!(bob.expect().await?, ServerFrame::action("* alice waves"));

    bob.command("/list").await?;
    assert_eq!(
        bob.expect().await?,
        ServerFrame::command("Online users (2): alice, bob")
    );

    harness.stop().await
}

#[tokio::test]
async fn frames_coalesced_into_one_write_are_all_handled() -> Result<()> {
    let harness = Harness::start(&[("alice", "a")]).await?;

    let mut alice = TestClient::connect(harness.addr).await?;
    let mut batch = serde_json::to_vec(&ClientFrame::login("alice", "a"))?;
    batch.push(b'\n');
    batch.extend_from_slice(br#"{"command":"/ping","body":""}"#);
    batch.push(b'\n');
    alice.send_raw(&batch).await?;

    assert_eq!(
        alice.expect().await?,
        ServerFrame::server("Login successful. Welcome back, alice!")
    );
    assert_eq!(alice.expect().await?, ServerFrame::command("pong"));

    harness.stop().await
}

#[tokio::test]
async fn frames_split_across_writes_are_reassembled() -> Result<()> {
    let harness = Harness::start(&[("alice", "a")]).await?;

    let mut alice = TestClient::connect(harness.addr).await?;
    let mut line = serde_json::to_vec(&ClientFrame::login("alice", "a"))?;
    line.push(b'\n');
    let (head, tail) = line.split_at(line.len() / 2);
    alice.send_raw(head).await?;
    sleep(Duration::from_millis(50)).await;
    alice.send_raw(tail).await?;

    assert_eq!(
        alice.expect().await?,
        ServerFrame::server("Login successful. Welcome back, alice!")
    );

    harness.stop().await
}

#[tokio::test]
async fn malformed_frame_mid_session_is_skipped() -> Result<()> {
    let harness = Harness::start(&[("alice", "a")]).await?;
    let mut alice = harness.login("alice", "a").await?;

    alice.send_raw(b"this is not json\n").await?;
    alice.command("/ping").await?;
    assert_eq!(alice.expect().await?, ServerFrame::command("pong"));
    assert!(harness.registry.contains("alice").await);

    harness.stop().await
}

#[tokio::test]
async fn oversized_frame_disconnects_the_sender() -> Result<()> {
    let limits = SessionLimits {
        max_frame_length: 1024,
        ..SessionLimits::default()
    };
    let harness = Harness::start_with(&[("alice", "a"), ("bob", "b")], limits).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    bob.send_raw(&vec![b'x'; 4096]).await?;
    bob.expect_closed().await?;
    assert_eq!(alice.expect().await?, left("bob"));
    assert!(!harness.registry.contains("bob").await);

    harness.stop().await
}

#[tokio::test]
async fn exit_announces_departure() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    bob.command("/exit").await?;
    bob.expect_closed().await?;
    assert_eq!(alice.expect().await?, left("bob"));

    // The name is free again.
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));
    bob.expect_quiet().await;

    harness.stop().await
}

#[tokio::test]
async fn operator_kick_disconnects_the_user() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    let output = harness
        .operator
        .execute(OperatorCommand::parse("kick bob")?)
        .await?;
    assert_eq!(output, "Kicked bob.");

    assert_eq!(
        bob.expect().await?,
        ServerFrame::server("You have been kicked from the server.")
    );
    bob.expect_closed().await?;
    assert_eq!(alice.expect().await?, left("bob"));
    assert_eq!(harness.registry.snapshot().await, vec!["alice".to_string()]);

    harness.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kick_notice_is_the_last_frame_under_load() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let kicked = ServerFrame::server("You have been kicked from the server.");

    let mut burst = Vec::new();
    for i in 0..200 {
        burst.extend(serde_json::to_vec(&ClientFrame::from_input(&format!("chatter {i}")))?);
        burst.push(b'\n');
    }

    for round in 0..10 {
        let mut bob = harness.login("bob", "b").await?;
        assert_eq!(alice.expect().await?, joined("bob"));

        alice.send_raw(&burst).await?;
        harness
            .operator
            .execute(OperatorCommand::parse("kick bob")?)
            .await?;

        let mut last = None;
        while let Some(frame) = bob.recv().await? {
            last = Some(frame);
        }
        assert_eq!(last.as_ref(), Some(&kicked), "round {round}");
        assert_eq!(alice.expect().await?, left("bob"));
    }

    harness.stop().await
}

#[tokio::test]
async fn operator_messages_come_from_the_server() -> Result<()> {
    let harness = Harness::start(&[("alice", "a")]).await?;
    let mut alice = harness.login("alice", "a").await?;

    harness
        .operator
        .execute(OperatorCommand::parse("msg alice hello from ops")?)
        .await?;
    assert_eq!(
        alice.expect().await?,
        ServerFrame::private(SERVER_NAME, "hello from ops")
    );

    harness.stop().await
}

#[tokio::test]
async fn operator_stop_closes_every_session() -> Result<()> {
    let harness = Harness::start(&[("alice", "a"), ("bob", "b")]).await?;
    let mut alice = harness.login("alice", "a").await?;
    let mut bob = harness.login("bob", "b").await?;
    assert_eq!(alice.expect().await?, joined("bob"));

    harness
        .operator
        .execute(OperatorCommand::Stop)
        .await?;

    for client in [&mut alice, &mut bob] {
        let mut frames = Vec::new();
        while let Some(frame) = client.recv().await? {
            frames.push(frame);
        }
        assert!(frames.contains(&ServerFrame::server("Server is shutting down.")));
    }

    timeout(WAIT, harness.task).await???;
    assert!(harness.registry.is_empty().await);
    Ok(())
}
