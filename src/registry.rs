// src/registry.rs

//! Registry of live WebSocket connections, keyed by user id.
//!
//! Each user has at most one registered connection. Delivery never writes to a
//! socket directly: frames are queued on the connection's bounded outbound
//! channel and its writer task drains them, so a slow peer only ever loses its
//! own frames.

use crate::models::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies one physical socket, independent of which user it joined as.
pub type ConnectionId = Uuid;

/// A serialized frame shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Backlogged,

    #[error("connection is closed")]
    Closed,
}

/// The sending side of one connection, as seen by everyone except its own worker.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<Frame>, shutdown: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Asks the connection's worker to close the socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Queues a frame without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Registered,
    /// The same connection joined again; nothing changed.
    AlreadyRegistered,
    /// A different connection was registered for the user and has been closed.
    Replaced(ConnectionId),
    /// The joining connection is already shutting down; the registry was left untouched.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Offline,
}

#[derive(Default)]
pub struct Registry {
    connections: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `user_id`, closing any other connection held for that user.
    /// A handle that is already closed never displaces a live one.
    pub async fn join(&self, user_id: UserId, handle: ConnectionHandle) -> JoinOutcome {
        let mut connections = self.connections.lock().await;
        if handle.is_closed() {
            return JoinOutcome::Rejected;
        }
        match connections.insert(user_id, handle.clone()) {
            None => JoinOutcome::Registered,
            Some(previous) if previous.id == handle.id => JoinOutcome::AlreadyRegistered,
            Some(previous) => {
                previous.close();
                JoinOutcome::Replaced(previous.id)
            }
        }
    }

    /// Drops the registration for `user_id` if it still belongs to `connection_id`.
    pub async fn leave(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.get(&user_id) {
            Some(current) if current.id == connection_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Queues `frame` for the user's connection. An offline user is not an error.
    pub async fn send_to(
        &self,
        user_id: UserId,
        frame: &Frame,
    ) -> Result<Delivery, DeliveryError> {
        let mut connections = self.connections.lock().await;
        let Some(handle) = connections.get(&user_id) else {
            return Ok(Delivery::Offline);
        };

        match handle.try_send(Arc::clone(frame)) {
            Ok(()) => Ok(Delivery::Sent),
            Err(DeliveryError::Closed) => {
                connections.remove(&user_id);
                Err(DeliveryError::Closed)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn connection_for(&self, user_id: UserId) -> Option<ConnectionId> {
        self.connections.lock().await.get(&user_id).map(ConnectionHandle::id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
