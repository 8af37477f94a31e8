//! Entity replication over a compact bit-packed wire protocol.
//!
//! A `wiresync` server owns the authoritative world: it assigns network ids
//! to entities, snapshots them to newly connected clients, and streams
//! field-level deltas afterward. Clients apply those messages to a local
//! world replica and surface what happened as events.
//!
//! ```no_run
//! use wiresync::{
//!     ComponentSchema, FieldKind, FieldValue, MemoryServerTransport, MemoryWorld,
//!     ReplicationServer, SchemaRegistry, ServerConfig, EntityWorld, SERVER_OWNER,
//! };
//!
//! let registry = SchemaRegistry::new();
//! registry
//!     .register(
//!         ComponentSchema::new(1, "Position")
//!             .with_field("x", FieldKind::Float)
//!             .with_field("y", FieldKind::Float),
//!     )
//!     .unwrap();
//!
//! let mut world = MemoryWorld::new();
//! let mut server = ReplicationServer::new(
//!     MemoryServerTransport::new(),
//!     registry,
//!     ServerConfig::new().with_tick_rate(30.0),
//! );
//!
//! let player = world.spawn();
//! world.set_component(player, 1, vec![FieldValue::Float(0.0), FieldValue::Float(0.0)]);
//! server.register_entity(player, SERVER_OWNER).unwrap();
//!
//! loop {
//!     server.update(&mut world, 1.0 / 30.0).unwrap();
//! }
//! ```

pub mod bits;
pub mod client;
pub mod debug;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod world;

pub use bits::{BitReader, BitWriter, DEFAULT_CAPACITY};
pub use client::{ClientConfig, ClientEvent, ClientStats, ReplicationClient};
pub use debug::init_debug_mode;
pub use error::{Result, SyncError};
pub use identity::NetworkIdMap;
pub use protocol::{
    peek_message_kind, ClientId, ComponentHead, ConnectionAccepted, ConnectionRejected,
    EntityDespawn, EntitySpawn, HierarchyChange, MessageHeader, MessageKind, NetworkId,
    OwnershipRequest, OwnershipTransfer, RejectReason, NO_NETWORK_ID, SERVER_OWNER,
};
pub use registry::{
    ComponentSchema, ComponentTypeId, ComponentValue, FieldKind, FieldSchema, FieldValue,
    SchemaRegistry, SyncStrategy, FLOAT_EPSILON, MAX_FIELDS,
};
pub use server::{ClientState, ReplicationServer, ServerConfig, ServerStats};
pub use transport::{
    ClientTransport, ClientTransportEvent, ConnectionId, DeliveryMode, MemoryClientTransport,
    MemoryServerTransport, ServerTransport, ServerTransportEvent, TransportState,
};
pub use world::{EntityId, EntityTag, EntityWorld, MemoryWorld};
