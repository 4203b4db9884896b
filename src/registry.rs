//! Connection Registry
//!
//! The one piece of shared mutable state in the relay: an arena of
//! [`Connection`] records keyed by a generated [`ConnectionId`].
//!
//! All access goes through a `parking_lot::RwLock`. The lock is synchronous,
//! so it can never be held across an `.await`; store and bot calls happen
//! outside of it.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::Principal;
use crate::protocol::{ConversationId, OutboundFrame};

/// Sender half of a connection's outbound queue
pub type FrameSender = mpsc::UnboundedSender<OutboundFrame>;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection {0} is already authenticated")]
    AlreadyAuthenticated(ConnectionId),

    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of one live connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    principal: Option<Principal>,
    subscriptions: HashSet<ConversationId>,
    sender: FrameSender,
}

impl Connection {
    /// New unauthenticated connection with no subscriptions
    pub fn new(sender: FrameSender) -> Self {
        Self {
            id: ConnectionId::next(),
            principal: None,
            subscriptions: HashSet::new(),
            sender,
        }
    }

    pub fn is_subscribed(&self, conversation_id: ConversationId) -> bool {
        self.subscriptions.contains(&conversation_id)
    }
}

/// Delivery handle for a subscribed connection
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: ConnectionId,
    sender: FrameSender,
}

impl Subscriber {
    /// Queue a frame; false if the connection is already gone
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Concurrency-safe map of live connections
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly opened connection
    pub fn register(&self, connection: Connection) -> ConnectionId {
        let id = connection.id;
        let mut connections = self.connections.write();
        connections.insert(id, connection);

        debug!(connection_id = %id, connections = connections.len(), "Connection registered");
        id
    }

    /// Bind a principal to a connection, exactly once
    pub fn authenticate(&self, id: ConnectionId, principal: Principal) -> Result<(), RegistryError> {
        let mut connections = self.connections.write();
        let connection = connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if connection.principal.is_some() {
            return Err(RegistryError::AlreadyAuthenticated(id));
        }

        connection.principal = Some(principal);
        Ok(())
    }

    /// Add a conversation to the subscription set.
    ///
    /// Returns `true` if it was not already present.
    pub fn subscribe(&self, id: ConnectionId, conversation_id: ConversationId) -> Result<bool, RegistryError> {
        let mut connections = self.connections.write();
        let connection = connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        Ok(connection.subscriptions.insert(conversation_id))
    }

    /// Remove a connection and all its state; no-op if absent
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        let removed = connections.remove(&id).is_some();

        if removed {
            debug!(connection_id = %id, connections = connections.len(), "Connection unregistered");
        }
        removed
    }

    /// Connections currently subscribed to `conversation_id`.
    ///
    /// Handles are collected under the read lock and iterated after it is
    /// released, so delivery never blocks registry writers.
    pub fn subscribers_of(&self, conversation_id: ConversationId) -> impl Iterator<Item = Subscriber> {
        let subscribers: Vec<Subscriber> = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_subscribed(conversation_id))
            .map(|c| Subscriber {
                id: c.id,
                sender: c.sender.clone(),
            })
            .collect();

        subscribers.into_iter()
    }

    /// Queue a frame for one connection; false if it is not registered
    pub fn send_to(&self, id: ConnectionId, frame: OutboundFrame) -> bool {
        let sender = self.connections.read().get(&id).map(|c| c.sender.clone());
        match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn principal_of(&self, id: ConnectionId) -> Option<Principal> {
        self.connections.read().get(&id).and_then(|c| c.principal.clone())
    }

    /// Sorted subscription set of a connection
    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<Vec<ConversationId>> {
        self.connections.read().get(&id).map(|c| {
            let mut subscriptions: Vec<_> = c.subscriptions.iter().copied().collect();
            subscriptions.sort_unstable();
            subscriptions
        })
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
