//! Snapshot views and transactions
//!
//! A [`View`] reads the cache at one tid and records what it read. A
//! [`Transaction`] is a view with a write overlay: reads see the overlay
//! first, and `commit` turns the overlay into index deltas and ships it.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use odb_core::{
    FieldId, FieldSlot, IndexId, ObjectFieldId, ObjectId, OdbError, OdbResult, SetDeltas, Tid,
    TypeKey, Writes, EXISTS_FIELD, EXISTS_VALUE,
};

use crate::connection::{ConfirmListener, Submission};
use crate::{DatabaseConnection, TransactionOutcome};

/// What the views of one reactor pass touched
#[derive(Debug, Default)]
pub(crate) struct Touched {
    pub had_writes: bool,
    pub reads: HashSet<ObjectFieldId>,
    pub index_reads: HashSet<IndexId>,
}

pub(crate) type ViewWatcher = Arc<Mutex<Touched>>;

/// Read-only snapshot of the cache at one tid
pub struct View {
    db: DatabaseConnection,
    tid: Tid,
    writes: Writes,
    reads: RefCell<HashSet<ObjectFieldId>>,
    index_reads: RefCell<HashSet<IndexId>>,
    watcher: Option<ViewWatcher>,
}

impl View {
    /// `tid` must already be registered with the cache
    pub(crate) fn open(db: DatabaseConnection, tid: Tid) -> Self {
        View {
            db,
            tid,
            writes: Writes::new(),
            reads: RefCell::new(HashSet::new()),
            index_reads: RefCell::new(HashSet::new()),
            watcher: None,
        }
    }

    pub(crate) fn watched_by(mut self, watcher: ViewWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Slots read so far
    pub fn reads(&self) -> Vec<ObjectFieldId> {
        self.reads.borrow().iter().copied().collect()
    }

    /// Indices enumerated so far
    pub fn index_reads(&self) -> Vec<IndexId> {
        self.index_reads.borrow().iter().cloned().collect()
    }

    fn fields(&self, ty: &TypeKey) -> OdbResult<Vec<FieldSlot>> {
        let cache = self.db.cache().read();
        if !cache.catalog().has_type(ty) {
            return Err(OdbError::UnknownSchema(ty.to_string()));
        }
        Ok(cache.type_fields(ty))
    }

    fn field(&self, ty: &TypeKey, fieldname: &str) -> OdbResult<FieldSlot> {
        self.fields(ty)?
            .into_iter()
            .find(|f| f.name == fieldname)
            .ok_or_else(|| OdbError::UnknownField(format!("{}.{}", ty, fieldname)))
    }

    fn exists_field(&self, ty: &TypeKey) -> OdbResult<FieldId> {
        Ok(self.field(ty, EXISTS_FIELD)?.id)
    }

    /// Read a slot through the overlay, recording the read
    fn read_slot(&self, slot: ObjectFieldId) -> Option<Option<Bytes>> {
        self.reads.borrow_mut().insert(slot);
        match self.writes.get(&slot) {
            Some(value) => Some(value.clone()),
            None => self.db.cache().read().value_at(&slot, self.tid),
        }
    }

    fn object_exists(&self, exists: FieldId, oid: ObjectId) -> bool {
        matches!(
            self.read_slot(ObjectFieldId::index(oid, exists)),
            Some(Some(_))
        )
    }

    pub fn exists(&self, ty: &TypeKey, oid: ObjectId) -> OdbResult<bool> {
        let exists = self.exists_field(ty)?;
        Ok(self.object_exists(exists, oid))
    }

    /// Value of a field; unset fields read as empty
    pub fn get(&self, ty: &TypeKey, oid: ObjectId, fieldname: &str) -> OdbResult<Bytes> {
        let field = self.field(ty, fieldname)?;
        if !self.object_exists(self.exists_field(ty)?, oid) {
            return Err(OdbError::ObjectDoesntExist(oid));
        }

        let slot = ObjectFieldId::value(oid, field.id);
        if !self.writes.contains_key(&slot) {
            let lazy = self.db.cache().read().needs_load(&slot, self.tid);
            if let Some(lazy) = lazy {
                self.db.load_lazy(&lazy, oid)?;
            }
        }
        Ok(self.read_slot(slot).flatten().unwrap_or_default())
    }

    /// Objects whose indexed `fieldname` equals `value`
    pub fn lookup_all(
        &self,
        ty: &TypeKey,
        fieldname: &str,
        value: impl AsRef<[u8]>,
    ) -> OdbResult<Vec<ObjectId>> {
        let field = self.field(ty, fieldname)?;
        if !field.indexed {
            return Err(OdbError::InvalidState(format!(
                "{}.{} is not indexed",
                ty, fieldname
            )));
        }
        let index = IndexId::new(field.id, Bytes::copy_from_slice(value.as_ref()));
        self.members(ty, &index)
    }

    pub fn lookup_any(
        &self,
        ty: &TypeKey,
        fieldname: &str,
        value: impl AsRef<[u8]>,
    ) -> OdbResult<Option<ObjectId>> {
        Ok(self.lookup_all(ty, fieldname, value)?.into_iter().next())
    }

    /// Every live object of a type
    pub fn lookup_type(&self, ty: &TypeKey) -> OdbResult<Vec<ObjectId>> {
        let index = IndexId::exists(self.exists_field(ty)?);
        self.members(ty, &index)
    }

    fn members(&self, ty: &TypeKey, index: &IndexId) -> OdbResult<Vec<ObjectId>> {
        let mut members: BTreeSet<ObjectId> = {
            let cache = self.db.cache().read();
            if !cache.covers(index) {
                return Err(OdbError::NotSubscribed {
                    schema: ty.schema.clone(),
                    typename: ty.typename.clone(),
                    detail: format!("index on field {}", index.field),
                });
            }
            cache.members_at(index, self.tid).into_iter().collect()
        };
        self.index_reads.borrow_mut().insert(index.clone());

        for (slot, value) in &self.writes {
            if !slot.is_index_value || slot.field != index.field {
                continue;
            }
            if value.as_ref() == Some(&index.value) {
                members.insert(slot.object);
            } else {
                members.remove(&slot.object);
            }
        }
        Ok(members.into_iter().collect())
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.db.cache().write().close_view(self.tid);
        if let Some(watcher) = &self.watcher {
            let mut touched = watcher.lock();
            if self.writes.is_empty() {
                touched.reads.extend(self.reads.get_mut().drain());
                touched.index_reads.extend(self.index_reads.get_mut().drain());
            } else {
                touched.had_writes = true;
            }
        }
    }
}

/// A view with pending writes
pub struct Transaction {
    view: View,
    listeners: Vec<ConfirmListener>,
}

impl Deref for Transaction {
    type Target = View;

    fn deref(&self) -> &View {
        &self.view
    }
}

impl Transaction {
    pub(crate) fn new(view: View) -> Self {
        Transaction {
            view,
            listeners: Vec::new(),
        }
    }

    pub fn writes(&self) -> &Writes {
        &self.view.writes
    }

    fn write(&mut self, slot: ObjectFieldId, value: Option<Bytes>) {
        self.view.writes.insert(slot, value);
    }

    /// Write an index slot, recording the value it replaces as a read
    fn write_index(&mut self, oid: ObjectId, field: FieldId, value: Option<Bytes>) {
        let slot = ObjectFieldId::index(oid, field);
        self.view.reads.borrow_mut().insert(slot);
        self.write(slot, value);
    }

    /// Create an object; fields not given start empty
    pub fn create(&mut self, ty: &TypeKey, values: &[(&str, Bytes)]) -> OdbResult<ObjectId> {
        let fields = self.view.fields(ty)?;
        for (name, _) in values {
            if *name == EXISTS_FIELD || !fields.iter().any(|f| f.name == *name) {
                return Err(OdbError::UnknownField(format!("{}.{}", ty, name)));
            }
        }

        let oid = self.view.db.new_object_id()?;
        for field in &fields {
            let value = if field.name == EXISTS_FIELD {
                Bytes::from_static(EXISTS_VALUE)
            } else {
                values
                    .iter()
                    .find(|(name, _)| *name == field.name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            };
            self.write(ObjectFieldId::value(oid, field.id), Some(value.clone()));
            if field.indexed {
                self.write(ObjectFieldId::index(oid, field.id), Some(value));
            }
        }
        Ok(oid)
    }

    pub fn set(
        &mut self,
        ty: &TypeKey,
        oid: ObjectId,
        fieldname: &str,
        value: impl Into<Bytes>,
    ) -> OdbResult<()> {
        if fieldname == EXISTS_FIELD {
            return Err(OdbError::UnknownField(format!("{}.{}", ty, fieldname)));
        }
        let field = self.view.field(ty, fieldname)?;
        if !self.view.exists(ty, oid)? {
            return Err(OdbError::ObjectDoesntExist(oid));
        }

        let value = value.into();
        self.write(ObjectFieldId::value(oid, field.id), Some(value.clone()));
        if field.indexed {
            self.write_index(oid, field.id, Some(value));
        }
        Ok(())
    }

    /// Delete an object: every field and index slot is cleared
    pub fn delete(&mut self, ty: &TypeKey, oid: ObjectId) -> OdbResult<()> {
        if !self.view.exists(ty, oid)? {
            return Err(OdbError::ObjectDoesntExist(oid));
        }
        for field in self.view.fields(ty)? {
            self.write(ObjectFieldId::value(oid, field.id), None);
            if field.indexed {
                self.write_index(oid, field.id, None);
            }
        }
        Ok(())
    }

    /// Call `listener` once with the outcome, whether or not `commit` waits.
    /// A transaction with no writes reports `Success` right away.
    pub fn on_confirmed<F>(&mut self, listener: F)
    where
        F: FnOnce(&TransactionOutcome) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Index membership changes implied by the overlay
    fn set_deltas(&self) -> (SetDeltas, SetDeltas) {
        let mut adds = SetDeltas::new();
        let mut removes = SetDeltas::new();
        let cache = self.view.db.cache().read();
        for (slot, new) in &self.view.writes {
            if !slot.is_index_value {
                continue;
            }
            let old = cache.value_at(slot, self.view.tid).flatten();
            if old.as_ref() == new.as_ref() {
                continue;
            }
            if let Some(old) = old {
                removes
                    .entry(IndexId::new(slot.field, old))
                    .or_default()
                    .push(slot.object);
            }
            if let Some(new) = new {
                adds.entry(IndexId::new(slot.field, new.clone()))
                    .or_default()
                    .push(slot.object);
            }
        }
        (adds, removes)
    }

    /// Hand the overlay to the connection. With no writes nothing is sent
    /// and no tid is consumed: listeners get `Success` on this thread.
    fn submit(&mut self, wait: bool) -> OdbResult<Option<TransactionOutcome>> {
        let listeners = std::mem::take(&mut self.listeners);
        if self.view.writes.is_empty() {
            for listener in listeners {
                listener(&TransactionOutcome::Success);
            }
            return Ok(Some(TransactionOutcome::Success));
        }

        let (set_adds, set_removes) = self.set_deltas();
        let submission = Submission {
            as_of: self.view.tid,
            writes: self.view.writes.clone(),
            set_adds,
            set_removes,
            reads: self.view.reads(),
            index_reads: self.view.index_reads(),
        };
        self.view.db.submit(submission, listeners, wait)
    }

    /// Send and wait for the authority's verdict. An empty transaction
    /// succeeds locally without reaching the authority.
    pub fn commit(mut self) -> OdbResult<()> {
        match self.submit(true)? {
            Some(outcome) => outcome.into_result(),
            None => Ok(()),
        }
    }

    /// Send without waiting; the outcome reaches `on_confirmed` listeners
    pub fn commit_nowait(mut self) -> OdbResult<()> {
        self.submit(false).map(|_| ())
    }
}
