use crate::bits::{BitReader, BitWriter};
use crate::error::{Result, SyncError};
use crate::registry::{ComponentTypeId, ComponentValue, SchemaRegistry};
use serde::Serialize;

/// Process-unique, server-assigned id for a replicated entity. 0 is
/// reserved to mean "no entity / no parent".
pub type NetworkId = u32;

/// Protocol-assigned peer id. [`SERVER_OWNER`] marks server-owned entities;
/// connected clients get ids starting at 1.
pub type ClientId = i16;

pub const NO_NETWORK_ID: NetworkId = 0;
pub const SERVER_OWNER: ClientId = 0;

/// Wire message-type byte. Ranges are partitioned by concern: connection
/// lifecycle 0x01-0x0F, replication 0x10-0x1F, client input 0x20-0x2F,
/// ownership 0x30-0x3F, RPC/events 0x40-0x4F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MessageKind {
    None = 0x00,
    ConnectionRequest = 0x01,
    ConnectionAccepted = 0x02,
    ConnectionRejected = 0x03,
    Disconnect = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    FullSnapshot = 0x10,
    DeltaSnapshot = 0x11,
    EntitySpawn = 0x12,
    EntityDespawn = 0x13,
    ComponentAdd = 0x14,
    ComponentRemove = 0x15,
    ComponentUpdate = 0x16,
    HierarchyChange = 0x17,
    ClientInput = 0x20,
    ClientAck = 0x21,
    OwnershipTransfer = 0x30,
    OwnershipRequest = 0x31,
    Rpc = 0x40,
    ReliableEvent = 0x41,
    UnreliableEvent = 0x42,
}

impl MessageKind {
    pub const ALL: [MessageKind; 22] = [
        MessageKind::None,
        MessageKind::ConnectionRequest,
        MessageKind::ConnectionAccepted,
        MessageKind::ConnectionRejected,
        MessageKind::Disconnect,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::FullSnapshot,
        MessageKind::DeltaSnapshot,
        MessageKind::EntitySpawn,
        MessageKind::EntityDespawn,
        MessageKind::ComponentAdd,
        MessageKind::ComponentRemove,
        MessageKind::ComponentUpdate,
        MessageKind::HierarchyChange,
        MessageKind::ClientInput,
        MessageKind::ClientAck,
        MessageKind::OwnershipTransfer,
        MessageKind::OwnershipRequest,
        MessageKind::Rpc,
        MessageKind::ReliableEvent,
        MessageKind::UnreliableEvent,
    ];

    pub fn from_u8(value: u8) -> Option<MessageKind> {
        MessageKind::ALL.iter().copied().find(|k| *k as u8 == value)
    }
}

/// Every message starts with a 1-byte kind and a 4-byte tick counter. For
/// ping/pong the tick field carries the echoed timestamp; for acks it
/// carries the acknowledged tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub tick: u32,
}

impl MessageHeader {
    /// Encoded header size: 1-byte kind plus 4-byte tick.
    pub const ENCODED_BYTES: usize = 5;

    pub fn new(kind: MessageKind, tick: u32) -> Self {
        Self { kind, tick }
    }

    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_byte(self.kind as u8)?;
        writer.write_u32(self.tick)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        let raw = reader.read_byte()?;
        let kind = MessageKind::from_u8(raw)
            .ok_or_else(|| SyncError::InvalidMessage(format!("unknown message kind 0x{raw:02X}")))?;
        let tick = reader.read_u32()?;
        Ok(Self { kind, tick })
    }
}

/// Reads the kind byte of a datagram without consuming anything, so a
/// dispatcher can branch before committing to a decode routine.
pub fn peek_message_kind(payload: &[u8]) -> Result<MessageKind> {
    let reader = BitReader::new(payload);
    let raw = reader.peek_byte()?;
    MessageKind::from_u8(raw)
        .ok_or_else(|| SyncError::InvalidMessage(format!("unknown message kind 0x{raw:02X}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySpawn {
    pub network_id: NetworkId,
    pub owner: ClientId,
    pub components: Vec<(ComponentTypeId, ComponentValue)>,
}

impl EntitySpawn {
    /// Encoded size in bytes for the envelope body (header excluded), so a
    /// caller can size the writer before encoding. Every component type must
    /// be registered; `write` rejects unregistered ids anyway.
    pub fn encoded_size(&self, registry: &SchemaRegistry) -> usize {
        let mut bits = 32 + 16 + 8;
        for (type_id, _) in &self.components {
            bits += 16;
            if let Some(schema) = registry.schema(*type_id) {
                bits += schema.encoded_bits();
            }
        }
        (bits + 7) / 8
    }

    pub fn write(&self, registry: &SchemaRegistry, writer: &mut BitWriter) -> Result<()> {
        if self.components.len() > u8::MAX as usize {
            return Err(SyncError::InvalidMessage(format!(
                "spawn carries {} components, count byte holds at most 255",
                self.components.len()
            )));
        }
        writer.write_u32(self.network_id)?;
        writer.write_signed_bits(self.owner as i32, 16)?;
        writer.write_byte(self.components.len() as u8)?;
        for (type_id, value) in &self.components {
            writer.write_u16(*type_id)?;
            registry.serialize_full(*type_id, value, writer)?;
        }
        Ok(())
    }

    /// Components after an unknown type id cannot be framed without its
    /// schema, so decoding keeps everything before it and drops the rest.
    pub fn read(registry: &SchemaRegistry, reader: &mut BitReader) -> Result<Self> {
        let network_id = reader.read_u32()?;
        let owner = reader.read_signed_bits(16)? as ClientId;
        let count = reader.read_byte()?;

        let mut components = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let type_id = reader.read_u16()?;
            match registry.deserialize_full(type_id, reader)? {
                Some(value) => components.push((type_id, value)),
                None => break,
            }
        }
        Ok(Self {
            network_id,
            owner,
            components,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityDespawn {
    pub network_id: NetworkId,
}

impl EntityDespawn {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32(self.network_id)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            network_id: reader.read_u32()?,
        })
    }
}

/// A discrete parent edge change; `parent` of [`NO_NETWORK_ID`] detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HierarchyChange {
    pub child: NetworkId,
    pub parent: NetworkId,
}

impl HierarchyChange {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32(self.child)?;
        writer.write_u32(self.parent)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            child: reader.read_u32()?,
            parent: reader.read_u32()?,
        })
    }
}

/// Head of a `ComponentAdd`/`ComponentUpdate`/`ComponentRemove` message;
/// the component payload that follows is framed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComponentHead {
    pub network_id: NetworkId,
    pub component: ComponentTypeId,
}

impl ComponentHead {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32(self.network_id)?;
        writer.write_u16(self.component)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            network_id: reader.read_u32()?,
            component: reader.read_u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionAccepted {
    pub client_id: ClientId,
}

impl ConnectionAccepted {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_signed_bits(self.client_id as i32, 16)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            client_id: reader.read_signed_bits(16)? as ClientId,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RejectReason {
    ServerFull = 0,
    ShuttingDown = 1,
    Unknown = 255,
}

impl RejectReason {
    pub fn from_code(code: u8) -> RejectReason {
        match code {
            0 => RejectReason::ServerFull,
            1 => RejectReason::ShuttingDown,
            _ => RejectReason::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ServerFull => "server full",
            RejectReason::ShuttingDown => "server shutting down",
            RejectReason::Unknown => "connection rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionRejected {
    pub reason: RejectReason,
}

impl ConnectionRejected {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_byte(self.reason as u8)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            reason: RejectReason::from_code(reader.read_byte()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnershipTransfer {
    pub network_id: NetworkId,
    pub new_owner: ClientId,
}

impl OwnershipTransfer {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32(self.network_id)?;
        writer.write_signed_bits(self.new_owner as i32, 16)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            network_id: reader.read_u32()?,
            new_owner: reader.read_signed_bits(16)? as ClientId,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnershipRequest {
    pub network_id: NetworkId,
}

impl OwnershipRequest {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32(self.network_id)
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            network_id: reader.read_u32()?,
        })
    }
}
