//! Shared registry of active sessions.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use matrix_chat_core::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    hub::Outbound,
    session::{Session, SessionState},
};

/// Delivery handle for one registered session.
#[derive(Debug, Clone)]
pub(crate) struct Recipient {
    pub(crate) id: SessionId,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    pub(crate) close: CancellationToken,
}

#[derive(Debug)]
struct Entry {
    name: String,
    outbound: mpsc::Sender<Outbound>,
    close: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct Inner {
    next_id: SessionId,
    sessions: BTreeMap<SessionId, Entry>,
}

impl Inner {
    /// Recipients in insertion order.
    pub(crate) fn recipients(&self) -> Vec<Recipient> {
        self.sessions
            .iter()
            .map(|(&id, entry)| Recipient {
                id,
                outbound: entry.outbound.clone(),
                close: entry.close.clone(),
            })
            .collect()
    }

    pub(crate) fn outbound(&self, id: SessionId) -> Option<&mpsc::Sender<Outbound>> {
        self.sessions.get(&id).map(|entry| &entry.outbound)
    }
}

/// Set of active sessions behind a single lock.
///
/// Ids are allocated inside the lock at insertion time, so id order is
/// insertion order and the map iterates in join order.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                sessions: BTreeMap::new(),
            }),
        }
    }

    /// Every critical section is a single map operation, so a poisoned
    /// lock still guards a consistent map.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id, build the session and make it active in one step.
    ///
    /// The session starts with the default name `user-<id>`. A greeting
    /// returned by `greet` is queued before the session becomes visible
    /// to broadcasts.
    pub fn register(
        &self,
        outbound: mpsc::Sender<Outbound>,
        close: CancellationToken,
        greet: impl FnOnce(&str) -> Option<Outbound>,
    ) -> Session {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let name = format!("user-{id}");
        if let Some(greeting) = greet(&name) {
            if let Err(err) = outbound.try_send(greeting) {
                tracing::debug!(session_id = id, %err, "greeting not queued");
            }
        }
        let mut session = Session::connecting(id, name.clone(), close.clone());
        inner.sessions.insert(
            id,
            Entry {
                name,
                outbound,
                close,
            },
        );
        session.advance(SessionState::Active);
        session
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn remove(&self, id: SessionId) -> bool {
        self.lock().sessions.remove(&id).is_some()
    }

    /// Update the display name of a registered session.
    pub fn rename(&self, id: SessionId, name: &str) -> bool {
        self.lock().sessions.get_mut(&id).is_some_and(|entry| {
            name.clone_into(&mut entry.name);
            true
        })
    }

    /// Display names in join order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock()
            .sessions
            .values()
            .map(|entry| entry.name.clone())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
