//! End-to-end tests over real TCP connections.

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use matrix_chat_transport::{ChatServer, ServerConfig, ServerError};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_test::{assert_err, assert_ok};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start() -> Self {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = assert_ok!(ChatServer::bind(config).await);
        let addr = assert_ok!(server.local_addr());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert_ok!(result);
    }
}

struct Client {
    name: String,
    lines: Framed<TcpStream, LinesCodec>,
}

impl Client {
    /// Connect and wait for our own join notice, so later broadcasts include us.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut lines = Framed::new(stream, LinesCodec::new());
        let welcome = next_line(&mut lines).await.expect("welcome");
        let name = welcome
            .strip_prefix("welcome, ")
            .expect("welcome line")
            .to_string();
        let mut client = Self { name, lines };
        let joined = format!("{} joined", client.name);
        client.expect(&joined).await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.lines.send(line).await.expect("send");
    }

    async fn recv(&mut self) -> Option<String> {
        next_line(&mut self.lines).await
    }

    /// Skip lines until `expected` arrives.
    async fn expect(&mut self, expected: &str) {
        loop {
            match self.recv().await {
                Some(line) if line == expected => return,
                Some(_) => {}
                None => panic!("connection closed while waiting for {expected:?}"),
            }
        }
    }

    /// Drain whatever was already queued, then require end of stream.
    async fn expect_closed(&mut self) {
        while let Some(line) = self.recv().await {
            assert!(line.ends_with(" joined"), "unexpected line {line:?}");
        }
    }

    /// Next line that is not a join notice.
    async fn recv_message(&mut self) -> String {
        loop {
            let line = self.recv().await.expect("connection closed");
            if !line.ends_with(" joined") {
                return line;
            }
        }
    }
}

async fn next_line(lines: &mut Framed<TcpStream, LinesCodec>) -> Option<String> {
    timeout(WAIT, lines.next())
        .await
        .expect("timed out waiting for line")
        .map(|line| line.expect("read line"))
}

#[tokio::test]
async fn test_command_result_reaches_every_client() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;

    alice.send("ADD 1 2;3 4 | 1 1;1 1").await;
    let expected = format!("{} computed ADD: 2 3;4 5", alice.name);
    assert_eq!(alice.recv_message().await, expected);
    assert_eq!(bob.recv_message().await, expected);

    // Without '|' the middle row holds both operands' boundary rows.
    bob.send("SUB 5 5;5 5 1 2;3 4").await;
    let expected = format!("{} computed SUB: 4 3;2 1", bob.name);
    assert_eq!(alice.recv_message().await, expected);
    assert_eq!(bob.recv_message().await, expected);

    server.stop().await;
}

#[tokio::test]
async fn test_failure_is_broadcast() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;

    alice.send("DET 1 2;2 4").await;
    let expected = format!("{}'s DET failed: matrix is singular", alice.name);
    assert_eq!(alice.recv_message().await, expected);
    assert_eq!(bob.recv_message().await, expected);

    bob.send("INVERSE 1 2 3;4 5 6").await;
    let expected = format!("{}'s INVERSE failed: matrix is not square (2x3)", bob.name);
    assert_eq!(alice.recv_message().await, expected);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_command_falls_back_to_chat() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;

    alice.send("ADD 1 2;3").await;
    alice.send("TRANSPOSE 1 2;3 4").await;
    assert_eq!(bob.recv_message().await, format!("{}: ADD 1 2;3", alice.name));
    assert_eq!(
        bob.recv_message().await,
        format!("{} computed TRANSPOSE: 1 3;2 4", alice.name)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_departed_client_is_announced_and_skipped() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;
    let carol = Client::connect(server.addr).await;

    bob.send("QUIT").await;
    alice.expect(&format!("{} left", bob.name)).await;
    bob.expect_closed().await;

    let carol_name = carol.name.clone();
    drop(carol);
    alice.expect(&format!("{carol_name} left")).await;

    alice.send("anyone?").await;
    assert_eq!(alice.recv_message().await, format!("{}: anyone?", alice.name));

    alice.send("WHO").await;
    assert_eq!(alice.recv_message().await, format!("online: {}", alice.name));

    server.stop().await;
}

#[tokio::test]
async fn test_all_clients_see_one_order() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;
    let mut carol = Client::connect(server.addr).await;

    for i in 0..20 {
        alice.send(&format!("a{i}")).await;
        bob.send(&format!("b{i}")).await;
    }

    let mut transcripts = Vec::new();
    for client in [&mut alice, &mut bob, &mut carol] {
        let mut lines = Vec::new();
        while lines.len() < 40 {
            lines.push(client.recv_message().await);
        }
        transcripts.push(lines);
    }
    assert_eq!(transcripts[0], transcripts[1]);
    assert_eq!(transcripts[1], transcripts[2]);

    let from_alice: Vec<_> = transcripts[0]
        .iter()
        .filter(|line| line.starts_with(&format!("{}: ", alice.name)))
        .cloned()
        .collect();
    let expected: Vec<_> = (0..20).map(|i| format!("{}: a{i}", alice.name)).collect();
    assert_eq!(from_alice, expected);

    server.stop().await;
}

#[tokio::test]
async fn test_name_change_and_private_replies() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;
    let mut bob = Client::connect(server.addr).await;

    let old = alice.name.clone();
    alice.send("NAME alice").await;
    let expected = format!("{old} is now known as alice");
    assert_eq!(alice.recv_message().await, expected);
    assert_eq!(bob.recv_message().await, expected);

    alice.send("HELP").await;
    assert!(alice.recv_message().await.starts_with("commands:"));

    bob.send("WHO").await;
    bob.send("done").await;
    assert_eq!(
        bob.recv_message().await,
        format!("online: alice, {}", bob.name)
    );
    assert_eq!(bob.recv_message().await, format!("{}: done", bob.name));
    // WHO went to bob only.
    assert_eq!(alice.recv_message().await, format!("{}: done", bob.name));

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start().await;
    let mut alice = Client::connect(server.addr).await;

    server.stop().await;
    alice.expect_closed().await;
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let server = TestServer::start().await;
    let config = ServerConfig {
        port: server.addr.port(),
        ..ServerConfig::default()
    };

    let err = assert_err!(ChatServer::bind(config).await);
    assert!(matches!(err, ServerError::Bind { .. }));

    server.stop().await;
}
