use crate::bits::{BitReader, BitWriter};
use crate::debug;
use crate::error::{Result, SyncError};
use crate::identity::NetworkIdMap;
use crate::protocol::{
    ClientId, ComponentHead, ConnectionAccepted, ConnectionRejected, EntityDespawn, EntitySpawn,
    HierarchyChange, MessageHeader, MessageKind, NetworkId, OwnershipRequest, OwnershipTransfer,
    RejectReason, NO_NETWORK_ID, SERVER_OWNER,
};
use crate::registry::{ComponentTypeId, SchemaRegistry, SyncStrategy};
use crate::transport::{ClientTransport, ClientTransportEvent, DeliveryMode};
use crate::world::{EntityId, EntityTag, EntityWorld};
use ahash::AHashMap;
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// What happened during an [`update`](ReplicationClient::update), in arrival
/// order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { client_id: ClientId },
    Rejected { reason: RejectReason },
    Disconnected,
    EntitySpawned { entity: EntityId, network_id: NetworkId, owner: ClientId },
    EntityDespawned { entity: EntityId, network_id: NetworkId },
    ComponentAdded { entity: EntityId, type_id: ComponentTypeId },
    ComponentUpdated { entity: EntityId, type_id: ComponentTypeId, mask: u32 },
    ComponentRemoved { entity: EntityId, type_id: ComponentTypeId },
    ParentChanged { entity: EntityId, parent: Option<EntityId> },
    OwnershipChanged { entity: EntityId, new_owner: ClientId },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub spawns_applied: u64,
    pub deltas_applied: u64,
    pub discarded: u64,
}

/// Replica-side state machine: `Disconnected` until the transport comes up,
/// `Connecting` once the connection request is out, `Connected` after the
/// server's accept. Incoming state messages are applied to the host's world;
/// the host reads the returned [`ClientEvent`]s to react.
pub struct ReplicationClient<T: ClientTransport> {
    transport: T,
    registry: SchemaRegistry,
    config: ClientConfig,
    identity: NetworkIdMap,
    owners: AHashMap<NetworkId, ClientId>,
    local_client_id: Option<ClientId>,
    last_server_tick: u32,
    pending_ping: Option<(u32, Instant)>,
    last_ping: Option<Instant>,
    rtt: Option<Duration>,
    stats: ClientStats,
}

impl<T: ClientTransport> ReplicationClient<T> {
    pub fn new(transport: T, registry: SchemaRegistry, config: ClientConfig) -> Self {
        Self {
            transport,
            registry,
            config,
            identity: NetworkIdMap::new_remote(),
            owners: AHashMap::new(),
            local_client_id: None,
            last_server_tick: 0,
            pending_ping: None,
            last_ping: None,
            rtt: None,
            stats: ClientStats::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.local_client_id.is_some()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.local_client_id
    }

    pub fn last_server_tick(&self) -> u32 {
        self.last_server_tick
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn entity(&self, network_id: NetworkId) -> Option<EntityId> {
        self.identity.entity(network_id)
    }

    pub fn network_id(&self, entity: EntityId) -> Option<NetworkId> {
        self.identity.network_id(entity)
    }

    pub fn owner(&self, network_id: NetworkId) -> Option<ClientId> {
        self.owners.get(&network_id).copied()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Asks the server for ownership of a replicated entity. Granted only
    /// while the server itself still owns it; the answer, if any, arrives as
    /// an [`ClientEvent::OwnershipChanged`].
    pub fn request_ownership(&mut self, network_id: NetworkId) -> Result<()> {
        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::OwnershipRequest, self.last_server_tick)
            .write(&mut writer)?;
        OwnershipRequest { network_id }.write(&mut writer)?;
        self.transport
            .send(writer.finish(), DeliveryMode::ReliableOrdered)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if self.local_client_id.is_some() {
            let mut writer = BitWriter::new();
            MessageHeader::new(MessageKind::Disconnect, self.last_server_tick)
                .write(&mut writer)?;
            let _ = self
                .transport
                .send(writer.finish(), DeliveryMode::ReliableOrdered);
        }
        self.transport.disconnect();
        self.local_client_id = None;
        Ok(())
    }

    /// Drains the transport, applies incoming state to `world`, acknowledges
    /// the newest replication tick, and keeps the ping cadence going.
    pub fn update<W: EntityWorld>(&mut self, world: &mut W) -> Result<Vec<ClientEvent>> {
        let mut events = Vec::new();
        let mut saw_state = false;

        for event in self.transport.poll() {
            match event {
                ClientTransportEvent::Connected => {
                    let mut writer = BitWriter::new();
                    MessageHeader::new(MessageKind::ConnectionRequest, 0).write(&mut writer)?;
                    self.transport
                        .send(writer.finish(), DeliveryMode::ReliableOrdered)?;
                }
                ClientTransportEvent::Disconnected => {
                    self.local_client_id = None;
                    events.push(ClientEvent::Disconnected);
                }
                ClientTransportEvent::Data(payload) => {
                    self.stats.messages_received += 1;
                    self.stats.bytes_received += payload.len() as u64;
                    match self.process_datagram(world, &payload, &mut events, &mut saw_state) {
                        Ok(()) => {}
                        Err(SyncError::TruncatedMessage) | Err(SyncError::InvalidMessage(_)) => {
                            // one malformed datagram is dropped, the stream
                            // continues
                            self.stats.discarded += 1;
                            debug::trace_receive(MessageKind::None, payload.len(), "discarded");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if saw_state && self.local_client_id.is_some() {
            let mut writer = BitWriter::new();
            MessageHeader::new(MessageKind::ClientAck, self.last_server_tick).write(&mut writer)?;
            self.transport
                .send(writer.finish(), DeliveryMode::Unreliable)?;
        }

        if self.local_client_id.is_some() {
            self.maybe_ping()?;
        }
        Ok(events)
    }

    fn maybe_ping(&mut self) -> Result<()> {
        let now = Instant::now();
        let due = match self.last_ping {
            None => true,
            Some(at) => now.duration_since(at) >= self.config.ping_interval,
        };
        if !due {
            return Ok(());
        }

        // the echo token travels in the tick slot and comes back verbatim
        let echo = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0);
        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::Ping, echo).write(&mut writer)?;
        self.transport
            .send(writer.finish(), DeliveryMode::Unreliable)?;
        self.pending_ping = Some((echo, now));
        self.last_ping = Some(now);
        Ok(())
    }

    fn process_datagram<W: EntityWorld>(
        &mut self,
        world: &mut W,
        payload: &[u8],
        events: &mut Vec<ClientEvent>,
        saw_state: &mut bool,
    ) -> Result<()> {
        let mut reader = BitReader::new(payload);
        let header = MessageHeader::read(&mut reader)?;
        debug::trace_receive(header.kind, payload.len(), "server");

        if is_state_kind(header.kind) {
            if header.tick > self.last_server_tick {
                self.last_server_tick = header.tick;
            }
            *saw_state = true;
        }

        match header.kind {
            MessageKind::ConnectionAccepted => {
                let accepted = ConnectionAccepted::read(&mut reader)?;
                self.local_client_id = Some(accepted.client_id);
                events.push(ClientEvent::Connected {
                    client_id: accepted.client_id,
                });
            }
            MessageKind::ConnectionRejected => {
                let rejected = ConnectionRejected::read(&mut reader)?;
                events.push(ClientEvent::Rejected {
                    reason: rejected.reason,
                });
                self.transport.disconnect();
            }
            MessageKind::EntitySpawn => {
                let spawn = EntitySpawn::read(&self.registry, &mut reader)?;
                // a resync snapshot reuses the entity we already have
                let entity = match self.identity.entity(spawn.network_id) {
                    Some(entity) => entity,
                    None => {
                        let entity = world.spawn();
                        self.identity.register(spawn.network_id, entity)?;
                        entity
                    }
                };
                self.owners.insert(spawn.network_id, spawn.owner);
                for (type_id, value) in spawn.components {
                    world.set_component(entity, type_id, value);
                }
                self.apply_tag(world, entity, spawn.network_id);
                self.stats.spawns_applied += 1;
                events.push(ClientEvent::EntitySpawned {
                    entity,
                    network_id: spawn.network_id,
                    owner: spawn.owner,
                });
            }
            MessageKind::EntityDespawn => {
                let despawn = EntityDespawn::read(&mut reader)?;
                // despawn of an id we never saw is a no-op
                if let Some(entity) = self.identity.unregister_id(despawn.network_id) {
                    world.despawn(entity);
                    self.owners.remove(&despawn.network_id);
                    events.push(ClientEvent::EntityDespawned {
                        entity,
                        network_id: despawn.network_id,
                    });
                }
            }
            MessageKind::HierarchyChange => {
                let change = HierarchyChange::read(&mut reader)?;
                let Some(entity) = self.identity.entity(change.child) else {
                    return Ok(());
                };
                let parent = if change.parent == NO_NETWORK_ID {
                    None
                } else {
                    // an unknown parent drops the edge rather than the message
                    match self.identity.entity(change.parent) {
                        Some(p) => Some(p),
                        None => return Ok(()),
                    }
                };
                world.set_parent(entity, parent);
                events.push(ClientEvent::ParentChanged { entity, parent });
            }
            MessageKind::ComponentAdd => {
                let head = ComponentHead::read(&mut reader)?;
                let Some(entity) = self.identity.entity(head.network_id) else {
                    return Ok(());
                };
                if let Some(value) = self.registry.deserialize_full(head.component, &mut reader)? {
                    world.set_component(entity, head.component, value);
                    events.push(ClientEvent::ComponentAdded {
                        entity,
                        type_id: head.component,
                    });
                }
            }
            MessageKind::ComponentUpdate => {
                let head = ComponentHead::read(&mut reader)?;
                let Some(entity) = self.identity.entity(head.network_id) else {
                    return Ok(());
                };
                if self.is_locally_predicted(head.network_id, head.component) {
                    // the owner's prediction wins over the server echo
                    return Ok(());
                }
                let mut baseline = match world.get_component(entity, head.component) {
                    Some(value) => value,
                    None => match self.registry.schema(head.component) {
                        Some(schema) => schema.default_value(),
                        None => return Ok(()),
                    },
                };
                if let Some(mask) =
                    self.registry
                        .deserialize_delta(head.component, &mut reader, &mut baseline)?
                {
                    debug::trace_delta(head.network_id, head.component, mask);
                    world.set_component(entity, head.component, baseline);
                    self.stats.deltas_applied += 1;
                    events.push(ClientEvent::ComponentUpdated {
                        entity,
                        type_id: head.component,
                        mask,
                    });
                }
            }
            MessageKind::ComponentRemove => {
                let head = ComponentHead::read(&mut reader)?;
                let Some(entity) = self.identity.entity(head.network_id) else {
                    return Ok(());
                };
                if world.remove_component(entity, head.component) {
                    events.push(ClientEvent::ComponentRemoved {
                        entity,
                        type_id: head.component,
                    });
                }
            }
            MessageKind::OwnershipTransfer => {
                let transfer = OwnershipTransfer::read(&mut reader)?;
                self.owners.insert(transfer.network_id, transfer.new_owner);
                if let Some(entity) = self.identity.entity(transfer.network_id) {
                    self.apply_tag(world, entity, transfer.network_id);
                    events.push(ClientEvent::OwnershipChanged {
                        entity,
                        new_owner: transfer.new_owner,
                    });
                }
            }
            MessageKind::Pong => {
                if let Some((echo, sent)) = self.pending_ping {
                    if header.tick == echo {
                        self.rtt = Some(sent.elapsed());
                        self.pending_ping = None;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_locally_predicted(&self, network_id: NetworkId, type_id: ComponentTypeId) -> bool {
        let Some(local) = self.local_client_id else {
            return false;
        };
        if self.owners.get(&network_id) != Some(&local) {
            return false;
        }
        self.registry
            .schema(type_id)
            .map(|s| s.strategy == SyncStrategy::OwnerPredicted)
            .unwrap_or(false)
    }

    fn apply_tag<W: EntityWorld>(&self, world: &mut W, entity: EntityId, network_id: NetworkId) {
        let owner = self.owners.get(&network_id).copied().unwrap_or(SERVER_OWNER);
        let tag = if self.local_client_id == Some(owner) {
            EntityTag::predicted(owner)
        } else {
            EntityTag::interpolated(owner)
        };
        world.set_tag(entity, tag);
    }
}

/// Kinds whose header tick is a replication tick worth acknowledging.
fn is_state_kind(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::EntitySpawn
            | MessageKind::EntityDespawn
            | MessageKind::HierarchyChange
            | MessageKind::ComponentAdd
            | MessageKind::ComponentUpdate
            | MessageKind::ComponentRemove
            | MessageKind::OwnershipTransfer
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ComponentSchema, FieldKind, FieldValue};
    use crate::server::{ReplicationServer, ServerConfig};
    use crate::transport::{MemoryClientTransport, MemoryServerTransport, ServerTransport};
    use crate::world::MemoryWorld;
    use bytes::Bytes;

    fn test_registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register(
                ComponentSchema::new(1, "Position")
                    .with_field("x", FieldKind::Float)
                    .with_field("y", FieldKind::Float)
                    .with_field("z", FieldKind::Float),
            )
            .unwrap();
        registry
    }

    struct Harness {
        server: ReplicationServer<MemoryServerTransport>,
        client: ReplicationClient<MemoryClientTransport>,
        server_world: MemoryWorld,
        client_world: MemoryWorld,
    }

    impl Harness {
        fn new(registry: SchemaRegistry, config: ServerConfig) -> Self {
            let mut server =
                ReplicationServer::new(MemoryServerTransport::new(), registry.clone(), config);
            let link = server.transport_mut().accept();
            let client = ReplicationClient::new(link, registry, ClientConfig::new());
            Self {
                server,
                client,
                server_world: MemoryWorld::new(),
                client_world: MemoryWorld::new(),
            }
        }

        fn connect(&mut self) {
            // request, accept, receive
            self.client.update(&mut self.client_world).unwrap();
            self.server.update(&mut self.server_world, 0.0).unwrap();
            self.client.update(&mut self.client_world).unwrap();
            assert!(self.client.is_connected());
        }

        /// One server tick followed by one client update.
        fn exchange(&mut self) -> Vec<ClientEvent> {
            self.server
                .update(&mut self.server_world, 1.0 / 60.0)
                .unwrap();
            self.client.update(&mut self.client_world).unwrap()
        }
    }

    #[test]
    fn test_connect_handshake() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.client.update(&mut h.client_world).unwrap();
        h.server.update(&mut h.server_world, 0.0).unwrap();
        let events = h.client.update(&mut h.client_world).unwrap();
        assert_eq!(events, vec![ClientEvent::Connected { client_id: 1 }]);
        assert_eq!(h.client.client_id(), Some(1));
    }

    #[test]
    fn test_spawn_replicates_components() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(
            entity,
            1,
            vec![
                FieldValue::Float(1.5),
                FieldValue::Float(-2.0),
                FieldValue::Float(0.25),
            ],
        );
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();

        let events = h.exchange();
        let replica = h.client.entity(network_id).unwrap();
        assert!(events.contains(&ClientEvent::EntitySpawned {
            entity: replica,
            network_id,
            owner: SERVER_OWNER,
        }));
        assert_eq!(
            h.client_world.get_component(replica, 1).unwrap(),
            vec![
                FieldValue::Float(1.5),
                FieldValue::Float(-2.0),
                FieldValue::Float(0.25),
            ]
        );
        // not locally owned, so the replica interpolates
        let tag = h.client_world.tag(replica).unwrap();
        assert!(!tag.predicted);
        assert_eq!(tag.owner, SERVER_OWNER);
    }

    #[test]
    fn test_delta_reproduces_exact_value() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(
            entity,
            1,
            vec![
                FieldValue::Float(1.0),
                FieldValue::Float(2.0),
                FieldValue::Float(3.0),
            ],
        );
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();

        h.server_world.set_component(
            entity,
            1,
            vec![
                FieldValue::Float(42.5),
                FieldValue::Float(2.0),
                FieldValue::Float(3.0),
            ],
        );
        let events = h.exchange();

        let replica = h.client.entity(network_id).unwrap();
        assert!(events.contains(&ClientEvent::ComponentUpdated {
            entity: replica,
            type_id: 1,
            mask: 0b001,
        }));
        assert_eq!(
            h.client_world.get_component(replica, 1).unwrap(),
            vec![
                FieldValue::Float(42.5),
                FieldValue::Float(2.0),
                FieldValue::Float(3.0),
            ]
        );
    }

    #[test]
    fn test_despawn_removes_replica() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();
        let replica = h.client.entity(network_id).unwrap();

        h.server_world.despawn(entity);
        h.server.despawn_entity(entity).unwrap();
        let events = h.client.update(&mut h.client_world).unwrap();

        assert!(events.contains(&ClientEvent::EntityDespawned {
            entity: replica,
            network_id,
        }));
        assert!(!h.client_world.contains(replica));
        assert_eq!(h.client.entity(network_id), None);
    }

    #[test]
    fn test_hierarchy_replicates() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let parent = h.server_world.spawn();
        let child = h.server_world.spawn();
        for e in [parent, child] {
            h.server_world.set_component(e, 1, vec![
                FieldValue::Float(0.0),
                FieldValue::Float(0.0),
                FieldValue::Float(0.0),
            ]);
        }
        let parent_id = h.server.register_entity(parent, SERVER_OWNER).unwrap();
        let child_id = h.server.register_entity(child, SERVER_OWNER).unwrap();
        h.exchange();

        h.server_world.set_parent(child, Some(parent));
        h.server.set_parent(child, Some(parent)).unwrap();
        let events = h.client.update(&mut h.client_world).unwrap();

        let replica_parent = h.client.entity(parent_id).unwrap();
        let replica_child = h.client.entity(child_id).unwrap();
        assert!(events.contains(&ClientEvent::ParentChanged {
            entity: replica_child,
            parent: Some(replica_parent),
        }));
        assert_eq!(h.client_world.parent(replica_child), Some(replica_parent));

        // detach travels as the zero sentinel
        h.server.set_parent(child, None).unwrap();
        h.client.update(&mut h.client_world).unwrap();
        assert_eq!(h.client_world.parent(replica_child), None);
    }

    #[test]
    fn test_ownership_transfer_retags() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();
        let replica = h.client.entity(network_id).unwrap();
        assert!(!h.client_world.tag(replica).unwrap().predicted);

        h.server.transfer_ownership(entity, 1).unwrap();
        let events = h.client.update(&mut h.client_world).unwrap();
        assert!(events.contains(&ClientEvent::OwnershipChanged {
            entity: replica,
            new_owner: 1,
        }));
        let tag = h.client_world.tag(replica).unwrap();
        assert!(tag.predicted);
        assert_eq!(tag.owner, 1);
    }

    #[test]
    fn test_ownership_request_round_trip() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();

        h.client.request_ownership(network_id).unwrap();
        h.server.update(&mut h.server_world, 0.0).unwrap();
        assert_eq!(h.server.owner(network_id), Some(1));

        let events = h.client.update(&mut h.client_world).unwrap();
        let replica = h.client.entity(network_id).unwrap();
        assert!(events.contains(&ClientEvent::OwnershipChanged {
            entity: replica,
            new_owner: 1,
        }));
    }

    #[test]
    fn test_owner_predicted_update_skipped_on_owner() {
        let registry = test_registry();
        registry
            .register(
                ComponentSchema::new(2, "Velocity")
                    .with_field("vx", FieldKind::Float)
                    .with_strategy(SyncStrategy::OwnerPredicted),
            )
            .unwrap();
        let mut h = Harness::new(registry, ServerConfig::new());
        h.connect();

        // owned by this client (id 1)
        let entity = h.server_world.spawn();
        h.server_world
            .set_component(entity, 2, vec![FieldValue::Float(1.0)]);
        let network_id = h.server.register_entity(entity, 1).unwrap();
        h.exchange();
        let replica = h.client.entity(network_id).unwrap();

        // the client predicted ahead; the server echo must not clobber it
        h.client_world
            .set_component(replica, 2, vec![FieldValue::Float(99.0)]);
        h.server_world
            .set_component(entity, 2, vec![FieldValue::Float(2.0)]);
        h.exchange();

        assert_eq!(
            h.client_world.get_component(replica, 2).unwrap(),
            vec![FieldValue::Float(99.0)]
        );
    }

    #[test]
    fn test_client_ack_reaches_server() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();

        // the ack the client just sent lands on the next server update
        h.server.update(&mut h.server_world, 0.0).unwrap();
        let state = h.server.client(1).unwrap();
        assert_eq!(state.last_acked_tick(), h.server.current_tick());
    }

    #[test]
    fn test_ping_pong_measures_rtt() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();
        // connect() already sent the first ping; answer it
        h.server.update(&mut h.server_world, 0.0).unwrap();
        h.client.update(&mut h.client_world).unwrap();
        assert!(h.client.rtt().is_some());
    }

    #[test]
    fn test_malformed_datagram_discarded() {
        let mut h = Harness::new(test_registry(), ServerConfig::new());
        h.connect();

        let connection = h.server.transport_mut().connections()[0];
        // unknown kind byte
        h.server
            .transport_mut()
            .send(
                connection,
                Bytes::from_static(&[0xEE, 0, 0, 0, 0]),
                DeliveryMode::Unreliable,
            )
            .unwrap();
        let events = h.client.update(&mut h.client_world).unwrap();
        assert!(events.is_empty());
        assert_eq!(h.client.stats().discarded, 1);
        assert!(h.client.is_connected());
    }

    #[test]
    fn test_dropped_deltas_repaired_by_resync() {
        let mut h = Harness::new(
            test_registry(),
            ServerConfig::new().with_tick_rate(60.0).with_resync_tick_gap(2),
        );
        h.connect();

        let entity = h.server_world.spawn();
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(1.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        let network_id = h.server.register_entity(entity, SERVER_OWNER).unwrap();
        h.exchange();
        let replica = h.client.entity(network_id).unwrap();

        // deltas vanish on the wire; the server still replaces its baseline
        h.server.transport_mut().set_drop_outgoing(true);
        h.server_world.set_component(entity, 1, vec![
            FieldValue::Float(50.0),
            FieldValue::Float(0.0),
            FieldValue::Float(0.0),
        ]);
        h.server.update(&mut h.server_world, 1.0 / 60.0).unwrap();
        h.server.transport_mut().set_drop_outgoing(false);

        // the replica is now stale and the baseline matches the world, so no
        // further delta fires on its own
        assert_eq!(
            h.client_world.get_component(replica, 1).unwrap()[0],
            FieldValue::Float(1.0)
        );

        // with no acks arriving, the gap trips and a snapshot repairs it
        for _ in 0..4 {
            h.server.update(&mut h.server_world, 1.0 / 60.0).unwrap();
        }
        h.client.update(&mut h.client_world).unwrap();
        assert_eq!(
            h.client_world.get_component(replica, 1).unwrap()[0],
            FieldValue::Float(50.0)
        );
        // the snapshot reused the existing replica entity
        assert_eq!(h.client.entity(network_id), Some(replica));
    }

    #[test]
    fn test_rejected_client_reports_reason() {
        let registry = test_registry();
        let mut server = ReplicationServer::new(
            MemoryServerTransport::new(),
            registry.clone(),
            ServerConfig::new().with_max_clients(0),
        );
        let link = server.transport_mut().accept();
        let mut client = ReplicationClient::new(link, registry, ClientConfig::new());
        let mut server_world = MemoryWorld::new();
        let mut client_world = MemoryWorld::new();

        client.update(&mut client_world).unwrap();
        server.update(&mut server_world, 0.0).unwrap();
        let events = client.update(&mut client_world).unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Rejected {
                reason: RejectReason::ServerFull
            }
        )));
        assert!(!client.is_connected());
    }
}
