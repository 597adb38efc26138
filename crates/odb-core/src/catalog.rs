//! Schema catalog
//!
//! Holds every known schema and the FieldId of each field. The authority
//! allocates ids with [`Catalog::allocate`]; proxies and clients learn them
//! from `SchemaMapping` messages via [`Catalog::absorb_mapping`].

use std::collections::{BTreeMap, HashMap};

use crate::{FieldDefinition, FieldId, FieldMapping, SchemaDefinition, TypeKey, EXISTS_FIELD};

/// A field of a type, as needed to enumerate an object's slots
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSlot {
    pub name: String,
    pub id: FieldId,
    pub indexed: bool,
}

#[derive(Debug, Default)]
pub struct Catalog {
    schemas: BTreeMap<String, SchemaDefinition>,
    fields: FieldMapping,
    by_id: HashMap<FieldId, FieldDefinition>,
    next_field_id: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            next_field_id: 1,
            ..Default::default()
        }
    }

    /// Next id [`Catalog::allocate`] hands out
    pub fn next_field_id(&self) -> u64 {
        self.next_field_id
    }

    /// Never hand out ids below `next`
    pub fn reserve_field_ids(&mut self, next: u64) {
        self.next_field_id = self.next_field_id.max(next);
    }

    /// Merge `definition` into schema `name`, allocating ids for unseen
    /// fields. Returns the schema's full mapping and whether anything grew.
    pub fn allocate(&mut self, name: &str, definition: &SchemaDefinition) -> (FieldMapping, bool) {
        let is_new = !self.schemas.contains_key(name);
        let schema = self.schemas.entry(name.to_owned()).or_default();
        let grew = schema.merge(definition) || is_new;

        let mut allocated = false;
        for field in schema.field_definitions(name) {
            if !self.fields.contains_key(&field) {
                let id = FieldId::new(self.next_field_id);
                self.next_field_id += 1;
                self.by_id.insert(id, field.clone());
                self.fields.insert(field, id);
                allocated = true;
            }
        }
        (self.mapping(name), grew || allocated)
    }

    /// Record ids assigned elsewhere
    pub fn absorb_mapping(&mut self, name: &str, definition: &SchemaDefinition, mapping: &FieldMapping) {
        self.schemas
            .entry(name.to_owned())
            .or_default()
            .merge(definition);
        for (field, id) in mapping {
            self.fields.insert(field.clone(), *id);
            self.by_id.insert(*id, field.clone());
            self.next_field_id = self.next_field_id.max(id.0 + 1);
        }
    }

    /// Field ids of one schema
    pub fn mapping(&self, name: &str) -> FieldMapping {
        self.fields
            .iter()
            .filter(|(field, _)| field.schema == name)
            .map(|(field, id)| (field.clone(), *id))
            .collect()
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(name)
    }

    pub fn schema_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn resolve(&self, id: FieldId) -> Option<&FieldDefinition> {
        self.by_id.get(&id)
    }

    pub fn type_of(&self, id: FieldId) -> Option<TypeKey> {
        self.resolve(id).map(FieldDefinition::type_key)
    }

    pub fn field_id(&self, field: &FieldDefinition) -> Option<FieldId> {
        self.fields.get(field).copied()
    }

    pub fn exists_field(&self, ty: &TypeKey) -> Option<FieldId> {
        self.field_id(&ty.field(EXISTS_FIELD))
    }

    pub fn has_type(&self, ty: &TypeKey) -> bool {
        self.schemas
            .get(&ty.schema)
            .map_or(false, |s| s.types.contains_key(&ty.typename))
    }

    /// Every field of a type with an allocated id, exists field included
    pub fn type_fields(&self, ty: &TypeKey) -> Vec<FieldSlot> {
        let Some(def) = self
            .schemas
            .get(&ty.schema)
            .and_then(|s| s.types.get(&ty.typename))
        else {
            return Vec::new();
        };
        def.all_fields()
            .filter_map(|name| {
                self.field_id(&ty.field(name)).map(|id| FieldSlot {
                    name: name.to_owned(),
                    id,
                    indexed: def.is_indexed(name),
                })
            })
            .collect()
    }

    /// Whether `id` names an indexed field
    pub fn is_indexed(&self, id: FieldId) -> bool {
        self.resolve(id).map_or(false, |field| {
            self.schemas
                .get(&field.schema)
                .and_then(|s| s.types.get(&field.typename))
                .map_or(false, |def| def.is_indexed(&field.fieldname))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::TypeDefinition;

    use super::*;

    fn counter_schema() -> SchemaDefinition {
        SchemaDefinition::new().with_type("Counter", TypeDefinition::new().index("k").field("x"))
    }

    #[test]
    fn test_allocate_includes_exists_field() {
        let mut catalog = Catalog::new();
        let (mapping, grew) = catalog.allocate("app", &counter_schema());

        // k, x and the hidden exists field
        assert_eq!(mapping.len(), 3);
        assert!(grew);

        let ty = TypeKey::new("app", "Counter");
        let exists = catalog.exists_field(&ty).unwrap();
        assert!(catalog.is_indexed(exists));
        assert_eq!(catalog.type_of(exists), Some(ty.clone()));
        assert_eq!(catalog.type_fields(&ty).len(), 3);
    }

    #[test]
    fn test_absorbed_ids_are_not_reused() {
        let mut authority = Catalog::new();
        let (mapping, _) = authority.allocate("app", &counter_schema());

        let mut mirror = Catalog::new();
        mirror.absorb_mapping("app", &counter_schema(), &mapping);
        assert_eq!(mirror.mapping("app"), mapping);
        assert_eq!(mirror.next_field_id(), authority.next_field_id());

        mirror.reserve_field_ids(2);
        assert_eq!(mirror.next_field_id(), authority.next_field_id());
        let k = mirror.field_id(&FieldDefinition::new("app", "Counter", "k")).unwrap();
        assert!(mirror.is_indexed(k));
        assert!(!mirror.has_type(&TypeKey::new("app", "Other")));
    }
}
