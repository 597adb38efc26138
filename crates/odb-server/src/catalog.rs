//! Stored schema catalog
//!
//! The authority's [`Catalog`] lives in the store: schema names, each
//! schema's definition and mapping, and the next FieldId. [`StoredCatalog`]
//! rebuilds it on start and turns every definition that grows it into the
//! store writes that persist the change.

use bytes::Bytes;

use odb_core::{Catalog, FieldMapping, OdbError, OdbResult, SchemaDefinition};
use odb_store::{Persistence, StoreKey};
use odb_wire::{from_bytes, to_bytes};

const SCHEMA_NAMES_KEY: &str = "schema_names";
const NEXT_FIELD_ID_KEY: &str = "next_field_id";

fn schema_key(name: &str) -> StoreKey {
    StoreKey::meta(format!("schema:{}", name))
}

fn mapping_key(name: &str) -> StoreKey {
    StoreKey::meta(format!("fields:{}", name))
}

pub trait StoredCatalog: Sized {
    /// Rebuild from the store
    fn load(store: &dyn Persistence) -> OdbResult<Self>;

    /// Merge `definition` into schema `name`, allocating ids for unseen
    /// fields. Returns the schema's full mapping and the store writes that
    /// persist the change (empty when nothing grew).
    fn define(
        &mut self,
        name: &str,
        definition: &SchemaDefinition,
    ) -> (FieldMapping, Vec<(StoreKey, Option<Bytes>)>);
}

impl StoredCatalog for Catalog {
    fn load(store: &dyn Persistence) -> OdbResult<Self> {
        let mut catalog = Catalog::new();

        let names: Vec<String> = match store.get(&StoreKey::meta(SCHEMA_NAMES_KEY))? {
            Some(raw) => from_bytes(raw)?,
            None => Vec::new(),
        };
        for name in names {
            let definition: SchemaDefinition = match store.get(&schema_key(&name))? {
                Some(raw) => from_bytes(raw)?,
                None => {
                    return Err(OdbError::Store(format!("schema {} listed but missing", name)))
                }
            };
            let mapping: FieldMapping = match store.get(&mapping_key(&name))? {
                Some(raw) => from_bytes(raw)?,
                None => FieldMapping::new(),
            };
            catalog.absorb_mapping(&name, &definition, &mapping);
        }
        if let Some(raw) = store.get(&StoreKey::meta(NEXT_FIELD_ID_KEY))? {
            catalog.reserve_field_ids(from_bytes(raw)?);
        }

        tracing::debug!(
            "loaded {} schemas, {} fields",
            catalog.schema_count(),
            catalog.field_count()
        );
        Ok(catalog)
    }

    fn define(
        &mut self,
        name: &str,
        definition: &SchemaDefinition,
    ) -> (FieldMapping, Vec<(StoreKey, Option<Bytes>)>) {
        let (mapping, grew) = self.allocate(name, definition);
        let mut writes = Vec::new();
        if grew {
            let names: Vec<String> = self.schema_names().map(str::to_owned).collect();
            writes.push((StoreKey::meta(SCHEMA_NAMES_KEY), Some(to_bytes(&names))));
            writes.push((schema_key(name), self.schema(name).map(to_bytes)));
            writes.push((mapping_key(name), Some(to_bytes(&mapping))));
            writes.push((
                StoreKey::meta(NEXT_FIELD_ID_KEY),
                Some(to_bytes(&self.next_field_id())),
            ));
            tracing::info!("schema {} now has {} fields", name, mapping.len());
        }
        (mapping, writes)
    }
}
