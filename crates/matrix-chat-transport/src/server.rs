//! TCP listener and accept loop.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use matrix_chat_session::Hub;
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ServerConfig},
    connection::{Limits, run_session},
};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive non-transient accept failures tolerated before giving up.
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 16;

/// Server error. Only these end the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Listener failed: {0}")]
    ListenerFailure(#[source] io::Error),
}

/// A bound chat server, ready to accept connections.
#[derive(Debug)]
pub struct ChatServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl ChatServer {
    /// Validate the configuration and bind the listening socket.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or binding fails.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr(),
                source,
            })?;
        Ok(Self { listener, config })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    /// Returns error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::ListenerFailure)
    }

    /// Accept connections until `shutdown` is cancelled or the listener fails.
    ///
    /// On return the listener is closed and every session has been
    /// force-closed and torn down.
    ///
    /// # Errors
    /// Returns `ListenerFailure` when accepting keeps failing.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Self { listener, config } = self;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "chat server listening");
        }

        let (hub, hub_task) =
            Hub::start(config.delivery_timeout, config.broadcast_queue_capacity);
        let limits = Limits {
            queue_capacity: config.outbound_queue_capacity,
            max_line_length: config.max_line_length,
        };
        // Parent of every session token; cancelled however the loop ends.
        let sessions_token = shutdown.child_token();
        let mut sessions = JoinSet::new();
        let mut consecutive_errors = 0;

        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("chat server shutting down");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        consecutive_errors = 0;
                        tracing::debug!(%peer, "accepted connection");
                        let hub = Arc::clone(&hub);
                        let token = sessions_token.clone();
                        sessions.spawn(async move {
                            if let Err(err) = run_session(stream, peer, hub, limits, &token).await {
                                tracing::debug!(%peer, %err, "session ended with error");
                            }
                        });
                    }
                    Err(err) if is_transient(&err) => {
                        tracing::warn!(%err, "transient accept failure, retrying");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                            tracing::error!(%err, consecutive_errors, "listener failed");
                            break Err(ServerError::ListenerFailure(err));
                        }
                        tracing::warn!(%err, consecutive_errors, "accept failed, retrying");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(%err, "session task failed");
                    }
                }
            }
        };

        drop(listener);
        sessions_token.cancel();
        tracing::info!(active = sessions.len(), "draining sessions");
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                tracing::error!(%err, "session task failed");
            }
        }
        drop(hub);
        if let Err(err) = hub_task.await {
            tracing::error!(%err, "broadcast hub task failed");
        }
        tracing::info!("chat server stopped");
        result
    }
}

/// Accept errors that say nothing about the listener itself.
fn is_transient(err: &io::Error) -> bool {
    // EMFILE / ENFILE: out of file descriptors, same value on Linux and BSDs.
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;

    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || (cfg!(unix) && matches!(err.raw_os_error(), Some(ENFILE | EMFILE)))
}
