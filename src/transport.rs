use crate::error::{Result, SyncError};
use ahash::AHashMap;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Transport-level connection handle, distinct from the protocol-assigned
/// client id.
pub type ConnectionId = u64;

/// Delivery mode requested per message; honoring it is the transport's
/// concern. Spawns, despawns, hierarchy and ownership changes go out
/// ReliableOrdered, frequent deltas use the unreliable modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Unreliable,
    UnreliableSequenced,
    ReliableOrdered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum ServerTransportEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Data(ConnectionId, Bytes),
}

#[derive(Debug, Clone)]
pub enum ClientTransportEvent {
    Connected,
    Disconnected,
    Data(Bytes),
}

/// Server-side transport seam. Implementations buffer I/O internally and
/// surface it only from `poll`, called from the simulation thread, so all
/// protocol state mutation stays synchronous with the caller.
pub trait ServerTransport {
    fn send(&mut self, connection: ConnectionId, payload: Bytes, mode: DeliveryMode)
        -> Result<()>;
    fn poll(&mut self) -> Vec<ServerTransportEvent>;
    fn connections(&self) -> Vec<ConnectionId>;
    fn disconnect(&mut self, connection: ConnectionId);
    fn state(&self) -> TransportState;

    fn send_to_all(&mut self, payload: Bytes, mode: DeliveryMode) -> Result<()> {
        for connection in self.connections() {
            self.send(connection, payload.clone(), mode)?;
        }
        Ok(())
    }

    fn send_to_all_except(
        &mut self,
        except: ConnectionId,
        payload: Bytes,
        mode: DeliveryMode,
    ) -> Result<()> {
        for connection in self.connections() {
            if connection != except {
                self.send(connection, payload.clone(), mode)?;
            }
        }
        Ok(())
    }
}

pub trait ClientTransport {
    fn send(&mut self, payload: Bytes, mode: DeliveryMode) -> Result<()>;
    fn poll(&mut self) -> Vec<ClientTransportEvent>;
    fn disconnect(&mut self);
    fn state(&self) -> TransportState;
}

struct LinkShared {
    to_client: RefCell<VecDeque<Bytes>>,
    to_server: RefCell<VecDeque<Bytes>>,
    client_open: Cell<bool>,
    server_open: Cell<bool>,
}

impl LinkShared {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            to_client: RefCell::new(VecDeque::new()),
            to_server: RefCell::new(VecDeque::new()),
            client_open: Cell::new(true),
            server_open: Cell::new(true),
        })
    }
}

/// Lossless, ordered in-process loopback for tests and demos: every client
/// side comes from [`MemoryServerTransport::accept`]. Delivery modes are
/// accepted but indistinguishable here. `set_drop_outgoing` simulates packet
/// loss by discarding server sends.
pub struct MemoryServerTransport {
    links: AHashMap<ConnectionId, Rc<LinkShared>>,
    pending_connects: Vec<ConnectionId>,
    next_connection: ConnectionId,
    drop_outgoing: bool,
}

impl MemoryServerTransport {
    pub fn new() -> Self {
        Self {
            links: AHashMap::new(),
            pending_connects: Vec::new(),
            next_connection: 0,
            drop_outgoing: false,
        }
    }

    /// Creates a connected client endpoint; the server sees a `Connected`
    /// event on its next poll.
    pub fn accept(&mut self) -> MemoryClientTransport {
        self.next_connection += 1;
        let connection = self.next_connection;
        let shared = LinkShared::new();
        self.links.insert(connection, Rc::clone(&shared));
        self.pending_connects.push(connection);
        MemoryClientTransport {
            shared,
            announced: false,
            closed_seen: false,
        }
    }

    pub fn set_drop_outgoing(&mut self, drop: bool) {
        self.drop_outgoing = drop;
    }
}

impl Default for MemoryServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTransport for MemoryServerTransport {
    fn send(
        &mut self,
        connection: ConnectionId,
        payload: Bytes,
        _mode: DeliveryMode,
    ) -> Result<()> {
        let link = self
            .links
            .get(&connection)
            .ok_or(SyncError::ConnectionClosed)?;
        if !link.client_open.get() {
            return Err(SyncError::ConnectionClosed);
        }
        if !self.drop_outgoing {
            link.to_client.borrow_mut().push_back(payload);
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<ServerTransportEvent> {
        let mut events = Vec::new();
        for connection in self.pending_connects.drain(..) {
            events.push(ServerTransportEvent::Connected(connection));
        }

        let mut closed = Vec::new();
        for (connection, link) in &self.links {
            while let Some(payload) = link.to_server.borrow_mut().pop_front() {
                events.push(ServerTransportEvent::Data(*connection, payload));
            }
            if !link.client_open.get() {
                closed.push(*connection);
            }
        }
        for connection in closed {
            if let Some(link) = self.links.remove(&connection) {
                link.server_open.set(false);
            }
            events.push(ServerTransportEvent::Disconnected(connection));
        }
        events
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.links.keys().copied().collect()
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        if let Some(link) = self.links.remove(&connection) {
            link.server_open.set(false);
        }
    }

    fn state(&self) -> TransportState {
        TransportState::Listening
    }
}

pub struct MemoryClientTransport {
    shared: Rc<LinkShared>,
    announced: bool,
    closed_seen: bool,
}

impl ClientTransport for MemoryClientTransport {
    fn send(&mut self, payload: Bytes, _mode: DeliveryMode) -> Result<()> {
        if !self.shared.server_open.get() || !self.shared.client_open.get() {
            return Err(SyncError::ConnectionClosed);
        }
        self.shared.to_server.borrow_mut().push_back(payload);
        Ok(())
    }

    fn poll(&mut self) -> Vec<ClientTransportEvent> {
        let mut events = Vec::new();
        if !self.announced {
            self.announced = true;
            events.push(ClientTransportEvent::Connected);
        }
        while let Some(payload) = self.shared.to_client.borrow_mut().pop_front() {
            events.push(ClientTransportEvent::Data(payload));
        }
        if !self.shared.server_open.get() && !self.closed_seen {
            self.closed_seen = true;
            events.push(ClientTransportEvent::Disconnected);
        }
        events
    }

    fn disconnect(&mut self) {
        self.shared.client_open.set(false);
    }

    fn state(&self) -> TransportState {
        if self.shared.server_open.get() && self.shared.client_open.get() {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}
