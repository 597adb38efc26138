//! Random write workloads
//!
//! Each [`Worker`] drives one connection through a seeded sequence of
//! creates, updates and deletes on `app.Counter`. Every operation picks its
//! target from the transaction's own snapshot, so it is always valid there;
//! commits race with the other workers and are retried on conflict.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use odb_client::DatabaseConnection;
use odb_core::{ObjectId, OdbResult};

use crate::counter_type;

/// Values `k` takes; small so index sets overlap
pub const KEY_SPACE: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    SetKey,
    SetValue,
    Delete,
}

impl Operation {
    fn pick(rng: &mut StdRng) -> Self {
        match rng.gen_range(0..10) {
            0..=3 => Operation::Create,
            4..=5 => Operation::SetKey,
            6..=8 => Operation::SetValue,
            _ => Operation::Delete,
        }
    }
}

/// Seeded operation source for one connection
pub struct Worker {
    db: DatabaseConnection,
    rng: StdRng,
    name: String,
}

impl Worker {
    pub fn new(db: DatabaseConnection, seed: u64) -> Self {
        Worker {
            db,
            rng: StdRng::seed_from_u64(seed),
            name: format!("w{}", seed),
        }
    }

    fn key(&mut self) -> Bytes {
        Bytes::from(vec![b'0' + self.rng.gen_range(0..KEY_SPACE)])
    }

    /// Run one operation to commit. Returns what was attempted.
    pub fn step(&mut self, n: usize) -> OdbResult<Operation> {
        let op = Operation::pick(&mut self.rng);
        let key = self.key();
        let value = Bytes::from(format!("{}-{}", self.name, n));
        let choice: usize = self.rng.gen();
        let ty = counter_type();

        self.db.transact(|t| {
            let existing = t.lookup_type(&ty)?;
            let target = (!existing.is_empty()).then(|| existing[choice % existing.len()]);
            match (op, target) {
                (Operation::SetKey, Some(oid)) => t.set(&ty, oid, "k", key.clone()),
                (Operation::SetValue, Some(oid)) => t.set(&ty, oid, "x", value.clone()),
                (Operation::Delete, Some(oid)) => t.delete(&ty, oid),
                _ => t
                    .create(&ty, &[("k", key.clone()), ("x", value.clone())])
                    .map(|_| ()),
            }
        })?;
        Ok(op)
    }

    pub fn run(&mut self, steps: usize) -> OdbResult<()> {
        for n in 0..steps {
            let op = self.step(n)?;
            tracing::trace!("{} step {}: {:?}", self.name, n, op);
        }
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Every live counter as (k, x), read at one snapshot
pub fn counter_state(db: &DatabaseConnection) -> OdbResult<BTreeMap<ObjectId, (Bytes, Bytes)>> {
    let ty = counter_type();
    let view = db.view();
    view.lookup_type(&ty)?
        .into_iter()
        .map(|oid| Ok((oid, (view.get(&ty, oid, "k")?, view.get(&ty, oid, "x")?))))
        .collect()
}

/// Objects per `k` value at one snapshot
pub fn key_groups(db: &DatabaseConnection) -> OdbResult<BTreeMap<u8, Vec<ObjectId>>> {
    let ty = counter_type();
    let view = db.view();
    (0..KEY_SPACE)
        .map(|k| Ok((k, view.lookup_all(&ty, "k", [b'0' + k])?)))
        .collect()
}
