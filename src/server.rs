use crate::bits::{BitReader, BitWriter};
use crate::debug;
use crate::error::{Result, SyncError};
use crate::identity::NetworkIdMap;
use crate::protocol::{
    ClientId, ComponentHead, ConnectionAccepted, ConnectionRejected, EntityDespawn, EntitySpawn,
    HierarchyChange, MessageHeader, MessageKind, NetworkId, OwnershipRequest, OwnershipTransfer,
    RejectReason, NO_NETWORK_ID, SERVER_OWNER,
};
use crate::registry::{ComponentTypeId, SchemaRegistry};
use crate::transport::{ConnectionId, DeliveryMode, ServerTransport, ServerTransportEvent};
use crate::world::{EntityId, EntityWorld};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Replication ticks per second.
    pub tick_rate: f32,
    pub max_clients: usize,
    /// A client whose last ack falls this many ticks behind is resynced with
    /// a fresh full snapshot.
    pub resync_tick_gap: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            max_clients: 32,
            resync_tick_gap: 120,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_rate(mut self, tick_rate: f32) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_resync_tick_gap(mut self, gap: u32) -> Self {
        self.resync_tick_gap = gap;
        self
    }
}

struct Baseline {
    value: crate::registry::ComponentValue,
    /// Tick the baseline was last sent on; drives per-type frequency gating.
    tick: u32,
}

/// Per-connected-peer replication state.
pub struct ClientState {
    connection: ConnectionId,
    client_id: ClientId,
    last_acked_tick: u32,
    /// Tick of the last full snapshot; keeps a silent client from being
    /// resnapshotted every single tick once the gap trips.
    last_snapshot_tick: u32,
    needs_full_snapshot: bool,
    rtt_estimate: Option<Duration>,
    known: AHashSet<NetworkId>,
    baselines: AHashMap<(NetworkId, ComponentTypeId), Baseline>,
}

impl ClientState {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn last_acked_tick(&self) -> u32 {
        self.last_acked_tick
    }

    pub fn needs_full_snapshot(&self) -> bool {
        self.needs_full_snapshot
    }

    pub fn rtt_estimate(&self) -> Option<Duration> {
        self.rtt_estimate
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub ticks: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub full_snapshots: u64,
    pub spawns_sent: u64,
    pub deltas_sent: u64,
    pub despawns_sent: u64,
}

/// Authoritative replication state machine.
///
/// `Idle` until the host starts calling [`update`](Self::update) each frame;
/// every fired tick runs one send pass. Per client, the sub-state goes
/// `AwaitingFullSnapshot` (the `needs_full_snapshot` flag) to `Synced` after
/// the first snapshot.
///
/// Delta baselines are replaced on every send regardless of acknowledgment:
/// a dropped delta silently diverges that client's view until the resync
/// gap triggers a fresh full snapshot. That favors throughput over
/// consistency and is part of the wire contract, not a bug to fix here.
pub struct ReplicationServer<T: ServerTransport> {
    transport: T,
    config: ServerConfig,
    registry: SchemaRegistry,
    identity: NetworkIdMap,
    owners: AHashMap<NetworkId, ClientId>,
    clients: AHashMap<ConnectionId, ClientState>,
    next_client_id: ClientId,
    tick: u32,
    accumulator: f32,
    stats: ServerStats,
}

impl<T: ServerTransport> ReplicationServer<T> {
    pub fn new(transport: T, registry: SchemaRegistry, config: ServerConfig) -> Self {
        Self {
            transport,
            config,
            registry,
            identity: NetworkIdMap::new_authoritative(),
            owners: AHashMap::new(),
            clients: AHashMap::new(),
            next_client_id: SERVER_OWNER + 1,
            tick: 0,
            accumulator: 0.0,
            stats: ServerStats::default(),
        }
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, client_id: ClientId) -> Option<&ClientState> {
        self.clients.values().find(|c| c.client_id == client_id)
    }

    pub fn owner(&self, network_id: NetworkId) -> Option<ClientId> {
        self.owners.get(&network_id).copied()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Assigns a network id to a world entity and starts replicating it.
    /// Connected clients receive the spawn on the next fired tick.
    pub fn register_entity(&mut self, entity: EntityId, owner: ClientId) -> Result<NetworkId> {
        let network_id = self.identity.assign(entity)?;
        self.owners.insert(network_id, owner);
        Ok(network_id)
    }

    pub fn network_id(&self, entity: EntityId) -> Option<NetworkId> {
        self.identity.network_id(entity)
    }

    /// Broadcasts the despawn immediately, outside the tick cadence, and
    /// removes the identity mapping. Unknown entities are a no-op.
    pub fn despawn_entity(&mut self, entity: EntityId) -> Result<()> {
        let Some(network_id) = self.identity.unregister_entity(entity) else {
            return Ok(());
        };
        self.owners.remove(&network_id);
        self.broadcast_despawn(network_id)
    }

    /// Broadcasts the new parent edge immediately; `None` detaches.
    pub fn set_parent(&mut self, child: EntityId, parent: Option<EntityId>) -> Result<()> {
        let child_id = self
            .identity
            .network_id(child)
            .ok_or_else(|| SyncError::InvalidMessage("child entity not registered".into()))?;
        let parent_id = match parent {
            None => NO_NETWORK_ID,
            Some(p) => self
                .identity
                .network_id(p)
                .ok_or_else(|| SyncError::InvalidMessage("parent entity not registered".into()))?,
        };

        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::HierarchyChange, self.tick).write(&mut writer)?;
        HierarchyChange {
            child: child_id,
            parent: parent_id,
        }
        .write(&mut writer)?;
        self.broadcast(writer.finish(), DeliveryMode::ReliableOrdered)
    }

    /// Reassigns ownership and broadcasts it. Re-tagging happens on the
    /// clients; in-progress messages are never mutated mid-flight.
    pub fn transfer_ownership(&mut self, entity: EntityId, new_owner: ClientId) -> Result<()> {
        let network_id = self
            .identity
            .network_id(entity)
            .ok_or_else(|| SyncError::InvalidMessage("entity not registered".into()))?;
        self.owners.insert(network_id, new_owner);
        self.broadcast_ownership(network_id, new_owner)
    }

    /// Drains transport events, advances the fixed-interval clock, and runs
    /// one send pass if at least one tick fired. Returns whether it did.
    pub fn update<W: EntityWorld>(&mut self, world: &mut W, delta_time: f32) -> Result<bool> {
        for event in self.transport.poll() {
            match event {
                ServerTransportEvent::Connected(connection) => self.handle_connect(connection)?,
                ServerTransportEvent::Disconnected(connection) => {
                    self.handle_disconnect(world, connection)?
                }
                ServerTransportEvent::Data(connection, payload) => {
                    // a malformed or truncated datagram is discarded, not fatal
                    match self.handle_message(world, connection, &payload) {
                        Ok(()) => {}
                        Err(SyncError::TruncatedMessage) | Err(SyncError::InvalidMessage(_)) => {
                            debug::trace_receive(MessageKind::None, payload.len(), "discarded")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let fired = self.advance_clock(delta_time);
        if fired {
            self.send_pass(world)?;
        }
        Ok(fired)
    }

    fn advance_clock(&mut self, delta_time: f32) -> bool {
        let interval = 1.0 / self.config.tick_rate;
        self.accumulator += delta_time;
        let mut fired = false;
        while self.accumulator >= interval {
            self.accumulator -= interval;
            self.tick += 1;
            self.stats.ticks += 1;
            fired = true;
        }
        fired
    }

    fn handle_connect(&mut self, connection: ConnectionId) -> Result<()> {
        if self.clients.contains_key(&connection) {
            return Ok(());
        }
        if self.clients.len() >= self.config.max_clients {
            let mut writer = BitWriter::new();
            MessageHeader::new(MessageKind::ConnectionRejected, self.tick).write(&mut writer)?;
            ConnectionRejected {
                reason: RejectReason::ServerFull,
            }
            .write(&mut writer)?;
            // best effort; no client state is created
            let _ = self
                .transport
                .send(connection, writer.finish(), DeliveryMode::ReliableOrdered);
            self.transport.disconnect(connection);
            return Ok(());
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            connection,
            ClientState {
                connection,
                client_id,
                last_acked_tick: self.tick,
                last_snapshot_tick: self.tick,
                needs_full_snapshot: true,
                rtt_estimate: None,
                known: AHashSet::new(),
                baselines: AHashMap::new(),
            },
        );

        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::ConnectionAccepted, self.tick).write(&mut writer)?;
        ConnectionAccepted { client_id }.write(&mut writer)?;
        self.send_to(connection, writer.finish(), DeliveryMode::ReliableOrdered)
    }

    /// Immediate and synchronous: the client's state is gone before this
    /// returns, and every entity it owned is despawned server-side with the
    /// despawn cascading to the remaining clients.
    fn handle_disconnect<W: EntityWorld>(
        &mut self,
        world: &mut W,
        connection: ConnectionId,
    ) -> Result<()> {
        let Some(state) = self.clients.remove(&connection) else {
            return Ok(());
        };
        let gone = state.client_id;

        let owned: Vec<NetworkId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == gone)
            .map(|(id, _)| *id)
            .collect();
        for network_id in owned {
            if let Some(entity) = self.identity.unregister_id(network_id) {
                world.despawn(entity);
            }
            self.owners.remove(&network_id);
            self.broadcast_despawn(network_id)?;
        }
        Ok(())
    }

    fn handle_message<W: EntityWorld>(
        &mut self,
        world: &mut W,
        connection: ConnectionId,
        payload: &[u8],
    ) -> Result<()> {
        let mut reader = BitReader::new(payload);
        let header = MessageHeader::read(&mut reader)?;
        debug::trace_receive(header.kind, payload.len(), "client");

        match header.kind {
            // transports without connection events reach us this way
            MessageKind::ConnectionRequest => self.handle_connect(connection),
            MessageKind::Disconnect => self.handle_disconnect(world, connection),
            MessageKind::Ping => {
                let mut writer = BitWriter::new();
                MessageHeader::new(MessageKind::Pong, header.tick).write(&mut writer)?;
                self.send_to(connection, writer.finish(), DeliveryMode::Unreliable)
            }
            MessageKind::ClientAck => {
                let tick = self.tick;
                let tick_rate = self.config.tick_rate;
                if let Some(state) = self.clients.get_mut(&connection) {
                    if header.tick > state.last_acked_tick {
                        state.last_acked_tick = header.tick;
                    }
                    let behind = tick.saturating_sub(state.last_acked_tick);
                    state.rtt_estimate = Some(Duration::from_secs_f32(behind as f32 / tick_rate));
                }
                Ok(())
            }
            MessageKind::OwnershipRequest => {
                let request = OwnershipRequest::read(&mut reader)?;
                let Some(requester) = self.clients.get(&connection).map(|s| s.client_id) else {
                    return Ok(());
                };
                // only entities the server still owns are up for grabs
                if self.owners.get(&request.network_id) == Some(&SERVER_OWNER) {
                    self.owners.insert(request.network_id, requester);
                    self.broadcast_ownership(request.network_id, requester)?;
                }
                Ok(())
            }
            // host-defined payloads pass through the protocol untouched
            MessageKind::ClientInput
            | MessageKind::Rpc
            | MessageKind::ReliableEvent
            | MessageKind::UnreliableEvent => Ok(()),
            _ => Ok(()),
        }
    }

    fn send_pass<W: EntityWorld>(&mut self, world: &mut W) -> Result<()> {
        debug::trace_tick(self.tick, self.clients.len());
        let connections: Vec<ConnectionId> = self.clients.keys().copied().collect();
        let entities = self.identity.all();

        for connection in connections {
            let needs_full = {
                let Some(state) = self.clients.get_mut(&connection) else {
                    continue;
                };
                let freshest = state.last_acked_tick.max(state.last_snapshot_tick);
                if !state.needs_full_snapshot
                    && self.tick.saturating_sub(freshest) > self.config.resync_tick_gap
                {
                    state.needs_full_snapshot = true;
                }
                state.needs_full_snapshot
            };

            if needs_full {
                for (network_id, entity) in &entities {
                    self.send_spawn(world, connection, *network_id, *entity)?;
                }
                if let Some(state) = self.clients.get_mut(&connection) {
                    state.needs_full_snapshot = false;
                    state.last_snapshot_tick = self.tick;
                }
                self.stats.full_snapshots += 1;
            } else {
                for (network_id, entity) in &entities {
                    self.send_entity_deltas(world, connection, *network_id, *entity)?;
                }
            }
        }
        Ok(())
    }

    fn send_spawn<W: EntityWorld>(
        &mut self,
        world: &W,
        connection: ConnectionId,
        network_id: NetworkId,
        entity: EntityId,
    ) -> Result<()> {
        let owner = self.owners.get(&network_id).copied().unwrap_or(SERVER_OWNER);
        let types = self.ordered_types(world, entity);
        let components: Vec<_> = types
            .into_iter()
            .filter_map(|t| world.get_component(entity, t).map(|v| (t, v)))
            .collect();

        let spawn = EntitySpawn {
            network_id,
            owner,
            components,
        };
        // Wide entities can outgrow the default buffer, so size the writer
        // from the schemas instead of relying on DEFAULT_CAPACITY.
        let capacity = MessageHeader::ENCODED_BYTES + spawn.encoded_size(&self.registry);
        let mut writer = BitWriter::with_capacity(capacity);
        MessageHeader::new(MessageKind::EntitySpawn, self.tick).write(&mut writer)?;
        spawn.write(&self.registry, &mut writer)?;
        let payload = writer.finish();
        debug::trace_send(MessageKind::EntitySpawn, payload.len(), "client");
        self.send_to(connection, payload, DeliveryMode::ReliableOrdered)?;
        self.stats.spawns_sent += 1;

        let tick = self.tick;
        if let Some(state) = self.clients.get_mut(&connection) {
            state.known.insert(network_id);
            for (type_id, value) in spawn.components {
                state.baselines.insert(
                    (network_id, type_id),
                    Baseline { value, tick },
                );
            }
        }
        Ok(())
    }

    fn send_entity_deltas<W: EntityWorld>(
        &mut self,
        world: &W,
        connection: ConnectionId,
        network_id: NetworkId,
        entity: EntityId,
    ) -> Result<()> {
        let known = self
            .clients
            .get(&connection)
            .map(|s| s.known.contains(&network_id))
            .unwrap_or(false);
        if !known {
            // registered after this client's snapshot
            return self.send_spawn(world, connection, network_id, entity);
        }

        let types = self.ordered_types(world, entity);
        for type_id in &types {
            let Some(current) = world.get_component(entity, *type_id) else {
                continue;
            };
            let key = (network_id, *type_id);
            let baseline = self
                .clients
                .get(&connection)
                .and_then(|s| s.baselines.get(&key).map(|b| (b.value.clone(), b.tick)));

            match baseline {
                None => {
                    // component appeared after the entity was spawned
                    let mut writer = BitWriter::new();
                    MessageHeader::new(MessageKind::ComponentAdd, self.tick).write(&mut writer)?;
                    ComponentHead {
                        network_id,
                        component: *type_id,
                    }
                    .write(&mut writer)?;
                    self.registry.serialize_full(*type_id, &current, &mut writer)?;
                    let payload = writer.finish();
                    debug::trace_send(MessageKind::ComponentAdd, payload.len(), "client");
                    self.send_to(connection, payload, DeliveryMode::ReliableOrdered)?;
                    self.replace_baseline(connection, key, current);
                }
                Some((base_value, base_tick)) => {
                    let schema = self
                        .registry
                        .schema(*type_id)
                        .ok_or_else(|| SyncError::InvalidMessage("schema vanished".into()))?;
                    let interval = interval_ticks(self.config.tick_rate, schema.frequency);
                    if self.tick.saturating_sub(base_tick) < interval {
                        continue;
                    }

                    let mask = self
                        .registry
                        .compute_dirty_mask(*type_id, &current, &base_value)?;
                    if mask == 0 {
                        continue;
                    }

                    let mut writer = BitWriter::new();
                    MessageHeader::new(MessageKind::ComponentUpdate, self.tick)
                        .write(&mut writer)?;
                    ComponentHead {
                        network_id,
                        component: *type_id,
                    }
                    .write(&mut writer)?;
                    if schema.supports_delta {
                        self.registry
                            .serialize_delta(*type_id, &current, &base_value, &mut writer)?;
                    } else {
                        // full-state types resend every field under a full mask
                        let full_mask = ((1u64 << schema.fields.len()) - 1) as u32;
                        writer.write_u32(full_mask)?;
                        self.registry.serialize_full(*type_id, &current, &mut writer)?;
                    }
                    let payload = writer.finish();
                    debug::trace_delta(network_id, *type_id, mask);
                    debug::trace_send(MessageKind::ComponentUpdate, payload.len(), "client");
                    self.send_to(connection, payload, DeliveryMode::UnreliableSequenced)?;
                    self.stats.deltas_sent += 1;
                    self.replace_baseline(connection, key, current);
                }
            }
        }

        // components removed since the last send
        let stale: Vec<ComponentTypeId> = self
            .clients
            .get(&connection)
            .map(|s| {
                s.baselines
                    .keys()
                    .filter(|(id, t)| *id == network_id && !types.contains(t))
                    .map(|(_, t)| *t)
                    .collect()
            })
            .unwrap_or_default();
        for type_id in stale {
            let mut writer = BitWriter::new();
            MessageHeader::new(MessageKind::ComponentRemove, self.tick).write(&mut writer)?;
            ComponentHead {
                network_id,
                component: type_id,
            }
            .write(&mut writer)?;
            self.send_to(connection, writer.finish(), DeliveryMode::ReliableOrdered)?;
            if let Some(state) = self.clients.get_mut(&connection) {
                state.baselines.remove(&(network_id, type_id));
            }
        }
        Ok(())
    }

    /// Serializable component types on `entity`, highest priority first.
    fn ordered_types<W: EntityWorld>(&self, world: &W, entity: EntityId) -> Vec<ComponentTypeId> {
        let mut types: Vec<ComponentTypeId> = world
            .component_types(entity)
            .into_iter()
            .filter(|t| self.registry.is_serializable(*t))
            .collect();
        types.sort_by_key(|t| {
            let priority = self.registry.schema(*t).map(|s| s.priority).unwrap_or(0);
            (std::cmp::Reverse(priority), *t)
        });
        types
    }

    fn replace_baseline(
        &mut self,
        connection: ConnectionId,
        key: (NetworkId, ComponentTypeId),
        value: crate::registry::ComponentValue,
    ) {
        let tick = self.tick;
        if let Some(state) = self.clients.get_mut(&connection) {
            state.baselines.insert(key, Baseline { value, tick });
        }
    }

    fn broadcast_despawn(&mut self, network_id: NetworkId) -> Result<()> {
        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::EntityDespawn, self.tick).write(&mut writer)?;
        EntityDespawn { network_id }.write(&mut writer)?;
        self.broadcast(writer.finish(), DeliveryMode::ReliableOrdered)?;
        self.stats.despawns_sent += 1;

        for state in self.clients.values_mut() {
            state.known.remove(&network_id);
            state.baselines.retain(|(id, _), _| *id != network_id);
        }
        Ok(())
    }

    fn broadcast_ownership(&mut self, network_id: NetworkId, new_owner: ClientId) -> Result<()> {
        let mut writer = BitWriter::new();
        MessageHeader::new(MessageKind::OwnershipTransfer, self.tick).write(&mut writer)?;
        OwnershipTransfer {
            network_id,
            new_owner,
        }
        .write(&mut writer)?;
        self.broadcast(writer.finish(), DeliveryMode::ReliableOrdered)
    }

    fn broadcast(&mut self, payload: Bytes, mode: DeliveryMode) -> Result<()> {
        let connections: Vec<ConnectionId> = self.clients.keys().copied().collect();
        for connection in connections {
            self.send_to(connection, payload.clone(), mode)?;
        }
        Ok(())
    }

    fn send_to(&mut self, connection: ConnectionId, payload: Bytes, mode: DeliveryMode) -> Result<()> {
        let len = payload.len() as u64;
        match self.transport.send(connection, payload, mode) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += len;
                Ok(())
            }
            // the peer raced us with a disconnect; its state goes away on the
            // next poll
            Err(SyncError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn interval_ticks(tick_rate: f32, frequency: f32) -> u32 {
    if frequency <= 0.0 {
        return 1;
    }
    ((tick_rate / frequency).round() as u32).max(1)
}
