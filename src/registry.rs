use crate::bits::{BitReader, BitWriter};
use crate::error::{Result, SyncError};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

pub type ComponentTypeId = u16;

/// Epsilon for float field comparison: changes smaller than this do not set
/// a dirty bit.
pub const FLOAT_EPSILON: f32 = 1e-4;

/// The dirty mask is a u32, one bit per declared field.
pub const MAX_FIELDS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Byte,
    UInt16,
    UInt32,
    Int32,
    Float,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Byte(u8),
    UInt16(u16),
    UInt32(u32),
    Int32(i32),
    Float(f32),
}

impl FieldKind {
    /// Wire width of one field of this kind.
    pub fn bits(self) -> usize {
        match self {
            FieldKind::Bool => 1,
            FieldKind::Byte => 8,
            FieldKind::UInt16 => 16,
            FieldKind::UInt32 | FieldKind::Int32 | FieldKind::Float => 32,
        }
    }
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Byte(_) => FieldKind::Byte,
            FieldValue::UInt16(_) => FieldKind::UInt16,
            FieldValue::UInt32(_) => FieldKind::UInt32,
            FieldValue::Int32(_) => FieldKind::Int32,
            FieldValue::Float(_) => FieldKind::Float,
        }
    }

    /// Field-level equality: exact for integers and bools, epsilon-tolerant
    /// for floats.
    pub fn approx_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Float(a), FieldValue::Float(b)) => (a - b).abs() < FLOAT_EPSILON,
            (a, b) => a == b,
        }
    }
}

/// A component's replicated state: declared fields in declaration order.
/// Dirty mask bit `i` corresponds to `fields[i]` of the schema.
pub type ComponentValue = Vec<FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    /// Only the server originates state; every client applies it.
    Authoritative,
    /// The owning client predicts this component locally; server deltas are
    /// not applied on the owner.
    OwnerPredicted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSchema {
    pub type_id: ComponentTypeId,
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub strategy: SyncStrategy,
    /// Maximum delta sends per second for this type; the server converts it
    /// to a tick interval.
    pub frequency: f32,
    /// Higher priority components are written first within an entity.
    pub priority: u8,
    pub supports_delta: bool,
    pub supports_interpolation: bool,
    pub supports_prediction: bool,
}

impl ComponentSchema {
    pub fn new(type_id: ComponentTypeId, name: impl Into<String>) -> Self {
        Self {
            type_id,
            name: name.into(),
            fields: Vec::new(),
            strategy: SyncStrategy::Authoritative,
            frequency: 60.0,
            priority: 0,
            supports_delta: true,
            supports_interpolation: true,
            supports_prediction: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema::new(name, kind));
        self
    }

    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_prediction(mut self, supported: bool) -> Self {
        self.supports_prediction = supported;
        self
    }

    pub fn with_interpolation(mut self, supported: bool) -> Self {
        self.supports_interpolation = supported;
        self
    }

    /// Bits a full payload of this schema occupies on the wire.
    pub fn encoded_bits(&self) -> usize {
        self.fields.iter().map(|f| f.kind.bits()).sum()
    }

    /// Default value with every field zeroed, used as the initial baseline
    /// for late-added components.
    pub fn default_value(&self) -> ComponentValue {
        self.fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Bool => FieldValue::Bool(false),
                FieldKind::Byte => FieldValue::Byte(0),
                FieldKind::UInt16 => FieldValue::UInt16(0),
                FieldKind::UInt32 => FieldValue::UInt32(0),
                FieldKind::Int32 => FieldValue::Int32(0),
                FieldKind::Float => FieldValue::Float(0.0),
            })
            .collect()
    }
}

struct RegistryInner {
    by_id: AHashMap<ComponentTypeId, ComponentSchema>,
    by_name: AHashMap<String, ComponentTypeId>,
}

/// Type-erased full/delta (de)serialization keyed by a stable numeric type
/// id, so the replication state machines never depend on concrete component
/// types.
///
/// Registered once at startup and immutable thereafter; clones share the
/// same table, so server and client can hold the same registry.
pub struct SchemaRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                by_id: AHashMap::new(),
                by_name: AHashMap::new(),
            })),
        }
    }

    pub fn register(&self, schema: ComponentSchema) -> Result<()> {
        if schema.fields.is_empty() {
            return Err(SyncError::InvalidSchema(format!(
                "component '{}' declares no fields",
                schema.name
            )));
        }
        if schema.fields.len() > MAX_FIELDS {
            return Err(SyncError::InvalidSchema(format!(
                "component '{}' declares {} fields, max is {}",
                schema.name,
                schema.fields.len(),
                MAX_FIELDS
            )));
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|e| SyncError::InvalidSchema(format!("lock poisoned: {e}")))?;

        if inner.by_id.contains_key(&schema.type_id) {
            return Err(SyncError::DuplicateTypeId(schema.type_id));
        }
        if inner.by_name.contains_key(&schema.name) {
            return Err(SyncError::InvalidSchema(format!(
                "component name '{}' is already registered",
                schema.name
            )));
        }

        crate::debug::log_value("registered component schema", &schema);
        inner.by_name.insert(schema.name.clone(), schema.type_id);
        inner.by_id.insert(schema.type_id, schema);
        Ok(())
    }

    pub fn is_serializable(&self, type_id: ComponentTypeId) -> bool {
        self.inner
            .read()
            .map(|inner| inner.by_id.contains_key(&type_id))
            .unwrap_or(false)
    }

    pub fn type_id(&self, name: &str) -> Option<ComponentTypeId> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_name.get(name).copied())
    }

    pub fn schema(&self, type_id: ComponentTypeId) -> Option<ComponentSchema> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_id.get(&type_id).cloned())
    }

    pub fn all(&self) -> Vec<ComponentSchema> {
        self.inner
            .read()
            .map(|inner| inner.by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    fn require(&self, type_id: ComponentTypeId) -> Result<ComponentSchema> {
        self.schema(type_id).ok_or_else(|| {
            SyncError::InvalidMessage(format!("component type id {type_id} not registered"))
        })
    }

    fn check_value(schema: &ComponentSchema, value: &ComponentValue) -> Result<()> {
        if value.len() != schema.fields.len() {
            return Err(SyncError::InvalidSchema(format!(
                "'{}' expects {} fields, value has {}",
                schema.name,
                schema.fields.len(),
                value.len()
            )));
        }
        for (field, v) in schema.fields.iter().zip(value) {
            if v.kind() != field.kind {
                return Err(SyncError::InvalidSchema(format!(
                    "'{}' field '{}' expects {:?}, value is {:?}",
                    schema.name,
                    field.name,
                    field.kind,
                    v.kind()
                )));
            }
        }
        Ok(())
    }

    /// Writes the complete value, used for initial spawn and full resync.
    pub fn serialize_full(
        &self,
        type_id: ComponentTypeId,
        value: &ComponentValue,
        writer: &mut BitWriter,
    ) -> Result<()> {
        let schema = self.require(type_id)?;
        Self::check_value(&schema, value)?;
        for field in value {
            write_field(writer, field)?;
        }
        Ok(())
    }

    /// Returns `None` when the type id is unknown, which legitimately occurs
    /// while peer registries briefly disagree during a version transition.
    pub fn deserialize_full(
        &self,
        type_id: ComponentTypeId,
        reader: &mut BitReader,
    ) -> Result<Option<ComponentValue>> {
        let Some(schema) = self.schema(type_id) else {
            return Ok(None);
        };
        let mut value = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            value.push(read_field(reader, field.kind)?);
        }
        Ok(Some(value))
    }

    /// Bit `i` set means declared field `i` differs from the baseline.
    pub fn compute_dirty_mask(
        &self,
        type_id: ComponentTypeId,
        current: &ComponentValue,
        baseline: &ComponentValue,
    ) -> Result<u32> {
        let schema = self.require(type_id)?;
        Self::check_value(&schema, current)?;
        Self::check_value(&schema, baseline)?;

        let mut mask = 0u32;
        for (i, (curr, base)) in current.iter().zip(baseline).enumerate() {
            if !curr.approx_eq(base) {
                mask |= 1 << i;
            }
        }
        Ok(mask)
    }

    /// Writes the dirty mask followed by only the dirty fields, in
    /// declaration order. A zero mask still writes the 4-byte mask so the
    /// decoder can detect "no change" without external metadata. Returns the
    /// mask that was written.
    pub fn serialize_delta(
        &self,
        type_id: ComponentTypeId,
        current: &ComponentValue,
        baseline: &ComponentValue,
        writer: &mut BitWriter,
    ) -> Result<u32> {
        let mask = self.compute_dirty_mask(type_id, current, baseline)?;
        writer.write_u32(mask)?;
        for (i, field) in current.iter().enumerate() {
            if mask >> i & 1 != 0 {
                write_field(writer, field)?;
            }
        }
        Ok(mask)
    }

    /// Reads the mask and applies only the masked fields into `baseline`.
    /// A zero mask leaves the baseline untouched. Returns the mask, or
    /// `None` when the type id is unknown (no-op, baseline untouched).
    pub fn deserialize_delta(
        &self,
        type_id: ComponentTypeId,
        reader: &mut BitReader,
        baseline: &mut ComponentValue,
    ) -> Result<Option<u32>> {
        let Some(schema) = self.schema(type_id) else {
            return Ok(None);
        };
        Self::check_value(&schema, baseline)?;

        let mask = reader.read_u32()?;
        if mask == 0 {
            return Ok(Some(0));
        }
        for (i, field) in schema.fields.iter().enumerate() {
            if mask >> i & 1 != 0 {
                baseline[i] = read_field(reader, field.kind)?;
            }
        }
        Ok(Some(mask))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SchemaRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn write_field(writer: &mut BitWriter, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Bool(v) => writer.write_bool(*v),
        FieldValue::Byte(v) => writer.write_byte(*v),
        FieldValue::UInt16(v) => writer.write_u16(*v),
        FieldValue::UInt32(v) => writer.write_u32(*v),
        FieldValue::Int32(v) => writer.write_signed_bits(*v, 32),
        FieldValue::Float(v) => writer.write_f32(*v),
    }
}

fn read_field(reader: &mut BitReader, kind: FieldKind) -> Result<FieldValue> {
    Ok(match kind {
        FieldKind::Bool => FieldValue::Bool(reader.read_bool()?),
        FieldKind::Byte => FieldValue::Byte(reader.read_byte()?),
        FieldKind::UInt16 => FieldValue::UInt16(reader.read_u16()?),
        FieldKind::UInt32 => FieldValue::UInt32(reader.read_u32()?),
        FieldKind::Int32 => FieldValue::Int32(reader.read_signed_bits(32)?),
        FieldKind::Float => FieldValue::Float(reader.read_f32()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_registry() -> SchemaRegistry {
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

    #[test]
    fn test_registry_lookups() {
        let registry = position_registry();

        assert!(registry.is_serializable(1));
        assert!(!registry.is_serializable(2));
        assert_eq!(registry.type_id("Position"), Some(1));
        assert_eq!(registry.type_id("Velocity"), None);
        assert_eq!(registry.schema(1).unwrap().name, "Position");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = position_registry();

        let dup = ComponentSchema::new(1, "Velocity").with_field("x", FieldKind::Float);
        assert!(matches!(
            registry.register(dup).unwrap_err(),
            SyncError::DuplicateTypeId(1)
        ));

        let dup_name = ComponentSchema::new(2, "Position").with_field("x", FieldKind::Float);
        assert!(registry.register(dup_name).is_err());
    }

    #[test]
    fn test_too_many_fields_rejected() {
        let registry = SchemaRegistry::new();
        let mut schema = ComponentSchema::new(9, "Wide");
        for i in 0..=MAX_FIELDS {
            schema = schema.with_field(format!("f{i}"), FieldKind::Float);
        }
        assert!(registry.register(schema).is_err());
    }

    #[test]
    fn test_schema_encoded_bits() {
        let schema = ComponentSchema::new(5, "Mixed")
            .with_field("alive", FieldKind::Bool)
            .with_field("team", FieldKind::Byte)
            .with_field("hp", FieldKind::UInt16)
            .with_field("x", FieldKind::Float);
        assert_eq!(schema.encoded_bits(), 1 + 8 + 16 + 32);
        assert_eq!(ComponentSchema::new(6, "Empty").encoded_bits(), 0);
    }

    #[test]
    fn test_dirty_mask_single_field() {
        let registry = position_registry();

        let baseline = vec![
            FieldValue::Float(1.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];
        let current = vec![
            FieldValue::Float(10.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];

        let mask = registry.compute_dirty_mask(1, &current, &baseline).unwrap();
        assert_eq!(mask, 0b001);
    }

    #[test]
    fn test_delta_round_trip() {
        let registry = position_registry();

        let baseline = vec![
            FieldValue::Float(1.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];
        let current = vec![
            FieldValue::Float(10.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];

        let mut writer = BitWriter::new();
        let mask = registry
            .serialize_delta(1, &current, &baseline, &mut writer)
            .unwrap();
        assert_eq!(mask, 0b001);

        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        let mut applied = baseline.clone();
        let read_mask = registry
            .deserialize_delta(1, &mut reader, &mut applied)
            .unwrap();

        assert_eq!(read_mask, Some(0b001));
        assert_eq!(applied, current);
    }

    #[test]
    fn test_zero_mask_leaves_baseline_untouched() {
        let registry = position_registry();

        let baseline = vec![
            FieldValue::Float(1.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];

        let mut writer = BitWriter::new();
        let mask = registry
            .serialize_delta(1, &baseline.clone(), &baseline, &mut writer)
            .unwrap();
        assert_eq!(mask, 0);
        // zero mask still occupies the 4-byte mask field
        assert_eq!(writer.bytes_written(), 4);

        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        let mut applied = baseline.clone();
        assert_eq!(
            registry
                .deserialize_delta(1, &mut reader, &mut applied)
                .unwrap(),
            Some(0)
        );
        assert_eq!(applied, baseline);
    }

    #[test]
    fn test_epsilon_insensitivity() {
        let registry = position_registry();

        let baseline = vec![
            FieldValue::Float(1.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];
        let nudged = vec![
            FieldValue::Float(1.00005),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];

        let mask = registry.compute_dirty_mask(1, &nudged, &baseline).unwrap();
        assert_eq!(mask, 0);
    }

    #[test]
    fn test_delta_smaller_than_full() {
        let registry = position_registry();

        let baseline = vec![
            FieldValue::Float(1.0),
            FieldValue::Float(2.0),
            FieldValue::Float(3.0),
        ];
        let mut current = baseline.clone();
        current[1] = FieldValue::Float(99.0);

        let mut full = BitWriter::new();
        registry.serialize_full(1, &current, &mut full).unwrap();

        let mut delta = BitWriter::new();
        registry
            .serialize_delta(1, &current, &baseline, &mut delta)
            .unwrap();

        // 4-byte mask + one 4-byte field vs three 4-byte fields
        assert_eq!(delta.bytes_written(), 8);
        assert_eq!(full.bytes_written(), 12);
        assert!(delta.bytes_written() < full.bytes_written());
    }

    #[test]
    fn test_unknown_type_id_is_noop() {
        let registry = position_registry();

        let bytes = [0u8; 16];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(registry.deserialize_full(99, &mut reader).unwrap(), None);
        assert_eq!(reader.bits_read(), 0);

        let mut baseline = vec![FieldValue::Float(1.0)];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(
            registry
                .deserialize_delta(99, &mut reader, &mut baseline)
                .unwrap(),
            None
        );
        assert_eq!(baseline, vec![FieldValue::Float(1.0)]);
    }

    #[test]
    fn test_full_round_trip_mixed_kinds() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                ComponentSchema::new(7, "Status")
                    .with_field("alive", FieldKind::Bool)
                    .with_field("team", FieldKind::Byte)
                    .with_field("score", FieldKind::Int32)
                    .with_field("flags", FieldKind::UInt16),
            )
            .unwrap();

        let value = vec![
            FieldValue::Bool(true),
            FieldValue::Byte(3),
            FieldValue::Int32(-42),
            FieldValue::UInt16(0xBEEF),
        ];

        let mut writer = BitWriter::new();
        registry.serialize_full(7, &value, &mut writer).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = registry.deserialize_full(7, &mut reader).unwrap().unwrap();
        assert_eq!(decoded, value);
    }
}
