//! Connection manager.
//!
//! Keeps one request queue per live connection, keyed by client id, plus a
//! queue of connections waiting to be accepted. Transport handlers feed it
//! from any thread; the acceptor and server connections drain it.
//!
//! Disconnect removes the connection and closes its queue: requests already
//! queued still drain, after which pops fail.

use crate::error::ServerError;
use crate::queue::{ItemQueue, PopSlot, QueueClosed};
use crate::request::Request;
use fabricrpc_transport::{ClientId, Event};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A connection waiting to be accepted.
pub struct ConnectionEntry {
    pub client_id: ClientId,
    pub remote_address: String,
    pub queue: Arc<ItemQueue<Request>>,
}

/// Table of live connections.
pub struct ConnectionManager {
    connections: Mutex<HashMap<ClientId, Arc<ItemQueue<Request>>>>,
    new_connections: ItemQueue<ConnectionEntry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            new_connections: ItemQueue::new(),
        }
    }

    /// Registers a connection and offers it to the acceptor.
    pub fn add_conn(&self, client_id: ClientId, remote_address: String) -> Result<(), ServerError> {
        self.add_conn_bounded(client_id, remote_address, usize::MAX)
    }

    /// Like [`add_conn`](Self::add_conn), refusing the connection if
    /// `max_connections` are already registered. The check and the insert
    /// happen under one lock.
    pub fn add_conn_bounded(
        &self,
        client_id: ClientId,
        remote_address: String,
        max_connections: usize,
    ) -> Result<(), ServerError> {
        let queue = Arc::new(ItemQueue::new());
        {
            let mut connections = self.connections.lock();
            if connections.contains_key(&client_id) {
                return Err(ServerError::DuplicateConnection(client_id));
            }
            if connections.len() >= max_connections {
                return Err(ServerError::ConnectionLimit(max_connections));
            }
            connections.insert(client_id, queue.clone());
        }

        let entry = ConnectionEntry {
            client_id,
            remote_address,
            queue,
        };
        if self.new_connections.push(entry).is_err() {
            self.connections.lock().remove(&client_id);
            return Err(ServerError::ShuttingDown);
        }
        tracing::debug!("[{}] Connection added", client_id);
        Ok(())
    }

    /// Queues `request` on its connection. Hands the request back if the
    /// connection is gone.
    pub fn post_request(&self, request: Request) -> Result<(), Request> {
        let client_id = request.client_id();
        let queue = self.connections.lock().get(&client_id).cloned();
        match queue {
            Some(queue) => queue.push(request),
            None => {
                tracing::debug!("[{}] Request for unknown connection", client_id);
                Err(request)
            }
        }
    }

    /// Removes a connection. Returns `false` if it was not registered.
    pub fn disconnect(&self, client_id: ClientId) -> bool {
        let removed = self.connections.lock().remove(&client_id);
        match removed {
            Some(queue) => {
                queue.close();
                tracing::debug!(
                    "[{}] Connection removed, {} request(s) left to drain",
                    client_id,
                    queue.len()
                );
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.connections.lock().contains_key(&client_id)
    }

    /// Starts a pop on the new-connection queue.
    pub fn async_pop(&self, event: &Arc<Event>, slot: &Arc<PopSlot<ConnectionEntry>>) {
        self.new_connections.async_pop(event, slot);
    }

    /// Withdraws a pending pop on the new-connection queue.
    pub fn cancel(&self, event: &Arc<Event>) -> bool {
        self.new_connections.cancel(event)
    }

    /// Waits for the next connection to accept.
    pub async fn next_connection(&self) -> Result<ConnectionEntry, QueueClosed> {
        self.new_connections.pop().await
    }

    /// Stops accepting and closes every connection queue.
    pub fn close(&self) {
        self.new_connections.close();
        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (_, queue) in connections {
            queue.close();
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
