//! Schema and data-model types
//!
//! A schema is a named, ordered map of type definitions. Every field of
//! every type is identified on the wire by a [`FieldId`] which the authority
//! assigns the first time the schema is defined.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use bytes::Bytes;

use crate::{FieldId, ObjectId};

/// Hidden field carried by every type; indexed, holds [`EXISTS_VALUE`] while
/// the object exists.
pub const EXISTS_FIELD: &str = " exists";

/// Value of the hidden exists field for a live object
pub const EXISTS_VALUE: &[u8] = &[1];

/// Schema holding the authority's own records
pub const CORE_SCHEMA: &str = "core";

/// Type of the per-connection record in [`CORE_SCHEMA`]
pub const CONNECTION_TYPE: &str = "Connection";

/// Pseudo-field of a subscription key naming one object; the value is the
/// object's identity as [`ObjectId::to_bytes`] writes it
pub const IDENTITY_FIELD: &str = "_identity";

/// Subscription key selecting the single object `oid`
pub fn identity_key(oid: ObjectId) -> (String, Bytes) {
    (IDENTITY_FIELD.to_owned(), Bytes::copy_from_slice(&oid.to_bytes()))
}

/// The object an identity key names; `None` for malformed values
pub fn parse_identity(value: &[u8]) -> Option<ObjectId> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(ObjectId::from_bytes(bytes))
}

/// Serialized value stored in one slot
pub type Value = Bytes;

/// Serialized value of an indexed field
pub type IndexValue = Bytes;

/// Slot writes; `None` is a tombstone
pub type Writes = HashMap<ObjectFieldId, Option<Value>>;

/// Index membership deltas
pub type SetDeltas = HashMap<IndexId, Vec<ObjectId>>;

/// Field ids handed out for one schema
pub type FieldMapping = BTreeMap<FieldDefinition, FieldId>;

/// (schema, type, field) triple
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldDefinition {
    pub schema: String,
    pub typename: String,
    pub fieldname: String,
}

impl FieldDefinition {
    pub fn new(
        schema: impl Into<String>,
        typename: impl Into<String>,
        fieldname: impl Into<String>,
    ) -> Self {
        FieldDefinition {
            schema: schema.into(),
            typename: typename.into(),
            fieldname: fieldname.into(),
        }
    }

    /// Type this field belongs to
    pub fn type_key(&self) -> TypeKey {
        TypeKey::new(self.schema.clone(), self.typename.clone())
    }

    pub fn is_exists(&self) -> bool {
        self.fieldname == EXISTS_FIELD
    }
}

impl fmt::Display for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.typename, self.fieldname)
    }
}

/// (schema, type) pair
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub schema: String,
    pub typename: String,
}

impl TypeKey {
    pub fn new(schema: impl Into<String>, typename: impl Into<String>) -> Self {
        TypeKey {
            schema: schema.into(),
            typename: typename.into(),
        }
    }

    pub fn field(&self, fieldname: impl Into<String>) -> FieldDefinition {
        FieldDefinition::new(self.schema.clone(), self.typename.clone(), fieldname)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.typename)
    }
}

/// Fields and indices of one type. `indices` is a subset of `fields`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeDefinition {
    pub fields: BTreeSet<String>,
    pub indices: BTreeSet<String>,
}

impl TypeDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into());
        self
    }

    /// Add an indexed field
    pub fn index(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.insert(name.clone());
        self.indices.insert(name);
        self
    }

    /// Union of two definitions
    pub fn merge(&mut self, other: &TypeDefinition) -> bool {
        let before = (self.fields.len(), self.indices.len());
        self.fields.extend(other.fields.iter().cloned());
        self.indices.extend(other.indices.iter().cloned());
        before != (self.fields.len(), self.indices.len())
    }

    /// Fields including the hidden exists field
    pub fn all_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(EXISTS_FIELD))
    }

    pub fn is_indexed(&self, fieldname: &str) -> bool {
        fieldname == EXISTS_FIELD || self.indices.contains(fieldname)
    }
}

/// Typename -> definition
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDefinition {
    pub types: BTreeMap<String, TypeDefinition>,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, typename: impl Into<String>, def: TypeDefinition) -> Self {
        self.types.insert(typename.into(), def);
        self
    }

    /// Merge another definition in; returns true if anything was added
    pub fn merge(&mut self, other: &SchemaDefinition) -> bool {
        let mut grew = false;
        for (typename, def) in &other.types {
            match self.types.get_mut(typename) {
                Some(existing) => grew |= existing.merge(def),
                None => {
                    self.types.insert(typename.clone(), def.clone());
                    grew = true;
                }
            }
        }
        grew
    }

    /// Whether every field and index of `other` is already present
    pub fn covers(&self, other: &SchemaDefinition) -> bool {
        other.types.iter().all(|(typename, def)| {
            self.types.get(typename).map_or(false, |mine| {
                def.fields.is_subset(&mine.fields) && def.indices.is_subset(&mine.indices)
            })
        })
    }

    /// Every field definition of the schema, exists fields included
    pub fn field_definitions(&self, schema: &str) -> Vec<FieldDefinition> {
        self.types
            .iter()
            .flat_map(|(typename, def)| {
                def.all_fields()
                    .map(move |f| FieldDefinition::new(schema, typename.as_str(), f))
            })
            .collect()
    }
}

/// Schema of the authority's connection records
pub fn core_schema() -> SchemaDefinition {
    SchemaDefinition::new().with_type(CONNECTION_TYPE, TypeDefinition::new())
}

/// The versioned slot: a field value, or the field's current index value
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectFieldId {
    pub object: ObjectId,
    pub field: FieldId,
    pub is_index_value: bool,
}

impl ObjectFieldId {
    #[inline]
    pub fn value(object: ObjectId, field: FieldId) -> Self {
        ObjectFieldId {
            object,
            field,
            is_index_value: false,
        }
    }

    #[inline]
    pub fn index(object: ObjectId, field: FieldId) -> Self {
        ObjectFieldId {
            object,
            field,
            is_index_value: true,
        }
    }
}

impl fmt::Debug for ObjectFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slot({}/{}{})",
            self.object,
            self.field,
            if self.is_index_value { "#" } else { "" }
        )
    }
}

/// Set of objects holding `value` for `field`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId {
    pub field: FieldId,
    pub value: IndexValue,
}

impl IndexId {
    pub fn new(field: FieldId, value: impl Into<IndexValue>) -> Self {
        IndexId {
            field,
            value: value.into(),
        }
    }

    /// Index of all live objects of a type
    pub fn exists(exists_field: FieldId) -> Self {
        IndexId::new(exists_field, Bytes::from_static(EXISTS_VALUE))
    }
}

impl fmt::Debug for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index({}={:02x?})", self.field, &self.value[..])
    }
}
