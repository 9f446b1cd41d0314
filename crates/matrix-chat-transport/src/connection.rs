//! Per-connection receive loop and send task.

use std::{net::SocketAddr, sync::Arc};

use futures::{Sink, SinkExt, Stream, StreamExt};
use matrix_chat_core::{Control, Parsed, evaluate, parse_line};
use matrix_chat_session::{Hub, Outbound, Session};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};

use crate::protocol::ServerMessage;

/// Session-local failure. Ends that session only.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection lost: {0}")]
    ConnectionLost(#[from] std::io::Error),
    #[error("Line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

impl SessionError {
    fn from_codec(err: LinesCodecError, max: usize) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong { max },
            LinesCodecError::Io(e) => Self::ConnectionLost(e),
        }
    }
}

/// Per-session limits taken from `ServerConfig`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) queue_capacity: usize,
    pub(crate) max_line_length: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drive one connection from accept to close.
///
/// The session is registered before the first read and removed before
/// this returns, whatever ended it.
pub(crate) async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    limits: Limits,
    shutdown: &CancellationToken,
) -> Result<(), SessionError> {
    let framed = Framed::new(
        stream,
        LinesCodec::new_with_max_length(limits.max_line_length),
    );
    let (sink, mut lines) = framed.split::<Outbound>();
    let (tx, rx) = mpsc::channel(limits.queue_capacity);
    let close = shutdown.child_token();
    let writer = tokio::spawn(write_loop(sink, rx, close.clone(), peer));

    let mut session = hub.join_greeted(tx, close.clone(), |name| {
        let welcome = ServerMessage::Welcome {
            name: name.to_owned(),
        };
        Some(welcome.to_string().into())
    });
    let session_id = session.id();
    tracing::info!(session_id, %peer, "client connected");
    announce(
        &hub,
        &ServerMessage::Joined {
            name: session.name().to_owned(),
        },
    )
    .await;

    let result = receive_loop(
        &hub,
        &mut session,
        &mut lines,
        &close,
        limits.max_line_length,
    )
    .await;

    hub.leave(&mut session);
    if let Err(e) = writer.await {
        tracing::error!(session_id, %peer, "send task failed: {e}");
    }
    drop(lines);
    session.mark_closed();
    announce(
        &hub,
        &ServerMessage::Left {
            name: session.name().to_owned(),
        },
    )
    .await;
    tracing::info!(session_id, %peer, "client disconnected");
    result
}

/// Read lines until end of stream, `QUIT`, a read error or `close` fires.
async fn receive_loop<S>(
    hub: &Hub,
    session: &mut Session,
    lines: &mut S,
    close: &CancellationToken,
    max_line_length: usize,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = close.cancelled() => {
                tracing::debug!(session_id = session.id(), "session force-closed");
                return Ok(());
            }
            next = lines.next() => next,
        };
        let line = match next {
            None => return Ok(()),
            Some(Ok(line)) => line,
            Some(Err(err)) => return Err(SessionError::from_codec(err, max_line_length)),
        };
        if dispatch(hub, session, &line).await == Flow::Stop {
            return Ok(());
        }
    }
}

/// Drain the outbound queue into the socket until `close` fires.
///
/// Lines still queued when the session closes are dropped.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    close: CancellationToken,
    peer: SocketAddr,
) where
    S: Sink<Outbound, Error = LinesCodecError> + Unpin,
{
    loop {
        let line = tokio::select! {
            biased;
            () = close.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            () = close.cancelled() => break,
            sent = sink.send(line) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(%peer, "write failed: {e}");
            close.cancel();
            break;
        }
    }
}

async fn dispatch(hub: &Hub, session: &mut Session, line: &str) -> Flow {
    if line.trim().is_empty() {
        return Flow::Continue;
    }

    let message = match parse_line(line, session.id()) {
        Parsed::Chat(text) => ServerMessage::Chat {
            sender: session.name().to_owned(),
            text,
        },
        Parsed::Command(command) => {
            let op = command.op();
            let result = evaluate(&command);
            tracing::debug!(session_id = session.id(), %op, ok = result.is_ok(), "command evaluated");
            ServerMessage::from_result(session.name(), op, result)
        }
        Parsed::Control(Control::Name(name)) => {
            let old = hub.rename(session, &name);
            ServerMessage::Renamed { old, new: name }
        }
        Parsed::Control(Control::Who) => {
            let names = hub.registry().names();
            hub.send_to(session.id(), ServerMessage::Who { names }.to_string());
            return Flow::Continue;
        }
        Parsed::Control(Control::Help) => {
            hub.send_to(session.id(), ServerMessage::Help.to_string());
            return Flow::Continue;
        }
        Parsed::Control(Control::Quit) => return Flow::Stop,
    };

    match hub.submit(message.to_string()).await {
        Ok(_) => Flow::Continue,
        Err(err) => {
            tracing::warn!(session_id = session.id(), %err, "dropping message");
            Flow::Stop
        }
    }
}

async fn announce(hub: &Hub, message: &ServerMessage) {
    if let Err(err) = hub.submit(message.to_string()).await {
        tracing::debug!(%err, %message, "presence notice not sent");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn recv(rx: &mut mpsc::Receiver<Outbound>) -> String {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("queue closed")
            .to_string()
    }

    fn join(hub: &Hub) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (hub.join(tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn test_chat_is_attributed() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx) = join(&hub);

        assert_eq!(dispatch(&hub, &mut alice, "hello there").await, Flow::Continue);
        assert_eq!(recv(&mut rx).await, "user-1: hello there");
    }

    #[tokio::test]
    async fn test_command_result_is_broadcast() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx_a) = join(&hub);
        let (_bob, mut rx_b) = join(&hub);

        dispatch(&hub, &mut alice, "ADD 1 2;3 4 | 1 1;1 1").await;
        assert_eq!(recv(&mut rx_a).await, "user-1 computed ADD: 2 3;4 5");
        assert_eq!(recv(&mut rx_b).await, "user-1 computed ADD: 2 3;4 5");
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, _rx_a) = join(&hub);
        let (_bob, mut rx_b) = join(&hub);

        dispatch(&hub, &mut alice, "INVERSE 1 2;2 4").await;
        assert_eq!(
            recv(&mut rx_b).await,
            "user-1's INVERSE failed: matrix is singular"
        );
    }

    #[tokio::test]
    async fn test_malformed_command_is_chat() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx) = join(&hub);

        dispatch(&hub, &mut alice, "ADD 1 2;3").await;
        assert_eq!(recv(&mut rx).await, "user-1: ADD 1 2;3");
    }

    #[tokio::test]
    async fn test_name_change_is_broadcast() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx) = join(&hub);

        dispatch(&hub, &mut alice, "NAME alice").await;
        dispatch(&hub, &mut alice, "hi").await;
        assert_eq!(recv(&mut rx).await, "user-1 is now known as alice");
        assert_eq!(recv(&mut rx).await, "alice: hi");
    }

    #[tokio::test]
    async fn test_who_and_help_are_private() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx_a) = join(&hub);
        let (_bob, mut rx_b) = join(&hub);

        dispatch(&hub, &mut alice, "WHO").await;
        dispatch(&hub, &mut alice, "HELP").await;
        dispatch(&hub, &mut alice, "done").await;

        assert_eq!(recv(&mut rx_a).await, "online: user-1, user-2");
        assert!(recv(&mut rx_a).await.starts_with("commands:"));
        assert_eq!(recv(&mut rx_a).await, "user-1: done");
        assert_eq!(recv(&mut rx_b).await, "user-1: done");
    }

    #[tokio::test]
    async fn test_blank_lines_are_ignored() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx) = join(&hub);

        assert_eq!(dispatch(&hub, &mut alice, "   ").await, Flow::Continue);
        dispatch(&hub, &mut alice, "next").await;
        assert_eq!(recv(&mut rx).await, "user-1: next");
    }

    #[tokio::test]
    async fn test_receive_loop_stops_on_quit() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, mut rx) = join(&hub);
        let mut lines = stream::iter(vec![
            Ok("first".to_string()),
            Ok("QUIT".to_string()),
            Ok("never sent".to_string()),
        ]);

        let result =
            receive_loop(&hub, &mut alice, &mut lines, &CancellationToken::new(), 64).await;
        assert_ok!(result);
        assert_eq!(recv(&mut rx).await, "user-1: first");
        assert!(matches!(lines.next().await, Some(Ok(ref line)) if line == "never sent"));
    }

    #[tokio::test]
    async fn test_receive_loop_reports_long_line() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, _rx) = join(&hub);
        let mut lines = stream::iter(vec![Err(LinesCodecError::MaxLineLengthExceeded)]);

        let result =
            receive_loop(&hub, &mut alice, &mut lines, &CancellationToken::new(), 64).await;
        assert!(matches!(result, Err(SessionError::LineTooLong { max: 64 })));
    }

    #[tokio::test]
    async fn test_receive_loop_honours_force_close() {
        let (hub, _task) = Hub::start(WAIT, 64);
        let (mut alice, _rx) = join(&hub);
        let close = CancellationToken::new();
        close.cancel();
        let mut lines = stream::pending::<Result<String, LinesCodecError>>();

        let result = receive_loop(&hub, &mut alice, &mut lines, &close, 64).await;
        assert_ok!(result);
    }
}
