//! Ordered broadcast to every active session.
//!
//! `submit` stamps a sequence number, snapshots the registry and enqueues
//! the message while holding the publisher lock, then a single delivery
//! task fans envelopes out in sequence order. Every recipient therefore
//! sees messages in submission order, and a session that joins after a
//! submission is not in that message's snapshot.
//!
//! The envelope queue is bounded. When delivery falls behind, `submit`
//! waits for room, which in turn stops the submitting connection from
//! reading more input.

use std::{sync::Arc, time::Duration};

use matrix_chat_core::SessionId;
use thiserror::Error;
use tokio::{
    sync::{
        Mutex,
        mpsc::{self, error::SendTimeoutError, error::TrySendError},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::{Recipient, Registry},
    session::{Session, SessionState},
};

/// One outbound line, shared by every recipient.
pub type Outbound = Arc<str>;

/// Hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Broadcast hub has stopped")]
    Stopped,
}

struct Envelope {
    seq: u64,
    text: Outbound,
    recipients: Vec<Recipient>,
}

/// Sequence counter and queue, locked together so stamping and enqueueing
/// happen in one order.
struct Publisher {
    queue: mpsc::Sender<Envelope>,
    next_seq: u64,
}

/// Broadcast hub shared by every connection task.
pub struct Hub {
    registry: Arc<Registry>,
    publisher: Mutex<Publisher>,
}

impl Hub {
    /// Create a hub and spawn its delivery task.
    ///
    /// At most `queue_capacity` envelopes wait for delivery. A recipient
    /// whose queue stays full for `delivery_timeout` is force-closed. The
    /// task ends once the hub is dropped.
    ///
    /// # Panics
    /// Panics if `queue_capacity` is zero.
    #[must_use]
    pub fn start(delivery_timeout: Duration, queue_capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let registry = Arc::new(Registry::new());
        let (queue, rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(deliver(Arc::clone(&registry), rx, delivery_timeout));
        let hub = Arc::new(Self {
            registry,
            publisher: Mutex::new(Publisher { queue, next_seq: 1 }),
        });
        (hub, handle)
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a new session; it receives every message submitted from now on.
    pub fn join(&self, outbound: mpsc::Sender<Outbound>, close: CancellationToken) -> Session {
        self.join_greeted(outbound, close, |_| None)
    }

    /// Register a new session and queue `greet(name)` as its first line.
    ///
    /// The greeting is queued inside the registration step, so no
    /// broadcast can reach the session ahead of it.
    pub fn join_greeted(
        &self,
        outbound: mpsc::Sender<Outbound>,
        close: CancellationToken,
        greet: impl FnOnce(&str) -> Option<Outbound>,
    ) -> Session {
        let session = self.registry.register(outbound, close, greet);
        tracing::info!(session_id = session.id(), "session joined");
        session
    }

    /// Take a session out of the registry and cancel its token.
    ///
    /// The session is left `Closing`; the connection marks it closed once
    /// its socket is released. Returns `false` if the session had already
    /// been removed, for example by a force-close.
    pub fn leave(&self, session: &mut Session) -> bool {
        session.advance(SessionState::Closing);
        let removed = self.registry.remove(session.id());
        session.close_token().cancel();
        tracing::info!(session_id = session.id(), removed, "session left");
        removed
    }

    /// Change a session's display name. Returns the previous name.
    pub fn rename(&self, session: &mut Session, name: &str) -> String {
        self.registry.rename(session.id(), name);
        session.set_name(name.to_owned())
    }

    /// Broadcast `text` to every active session. Returns its sequence number.
    ///
    /// Waits while the envelope queue is full.
    ///
    /// # Errors
    /// Returns `Stopped` if the delivery task is gone.
    pub async fn submit(&self, text: impl Into<Outbound>) -> Result<u64, HubError> {
        let text = text.into();
        let mut publisher = self.publisher.lock().await;
        let seq = publisher.next_seq;
        let recipients = self.registry.lock().recipients();
        tracing::debug!(seq, recipients = recipients.len(), "broadcast submitted");
        publisher
            .queue
            .send(Envelope {
                seq,
                text,
                recipients,
            })
            .await
            .map_err(|_| HubError::Stopped)?;
        publisher.next_seq += 1;
        Ok(seq)
    }

    /// Queue a private line for one session, outside the broadcast order.
    ///
    /// Dropped when the session is gone or its queue is full.
    pub fn send_to(&self, id: SessionId, text: impl Into<Outbound>) -> bool {
        let inner = self.registry.lock();
        let Some(outbound) = inner.outbound(id) else {
            return false;
        };
        match outbound.try_send(text.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(session_id = id, "outbound queue full, dropping private reply");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

async fn deliver(
    registry: Arc<Registry>,
    mut rx: mpsc::Receiver<Envelope>,
    delivery_timeout: Duration,
) {
    while let Some(Envelope {
        seq,
        text,
        recipients,
    }) = rx.recv().await
    {
        for recipient in recipients {
            if recipient.close.is_cancelled() {
                continue;
            }
            match recipient
                .outbound
                .send_timeout(Arc::clone(&text), delivery_timeout)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::trace!(seq, session_id = recipient.id, "recipient already closed");
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        seq,
                        session_id = recipient.id,
                        timeout_ms = delivery_timeout.as_millis(),
                        "outbound queue stalled, force-closing session"
                    );
                    registry.remove(recipient.id);
                    recipient.close.cancel();
                }
            }
        }
        tracing::trace!(seq, "broadcast delivered");
    }
    tracing::debug!("broadcast hub stopped");
}
