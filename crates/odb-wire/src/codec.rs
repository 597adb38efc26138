//! Little-endian binary codec
//!
//! Integers are little-endian, strings and byte strings carry a u32 length,
//! options a presence byte, lists and maps a u32 count.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use odb_core::{
    BadKey, FieldDefinition, FieldId, Guid, IndexId, ObjectFieldId, ObjectId, OdbError,
    OdbResult, SchemaDefinition, Tid, TypeDefinition,
};

/// A type with a wire representation
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut Bytes) -> OdbResult<Self>;
}

/// Encode a value into a fresh buffer
pub fn to_bytes<T: Wire>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}

/// Decode a value that must span the whole buffer
pub fn from_bytes<T: Wire>(mut bytes: Bytes) -> OdbResult<T> {
    let value = T::decode(&mut bytes)?;
    if bytes.has_remaining() {
        return Err(OdbError::InvalidWireFormat(format!(
            "{} trailing bytes",
            bytes.remaining()
        )));
    }
    Ok(value)
}

#[inline]
fn need(buf: &Bytes, n: usize) -> OdbResult<()> {
    if buf.remaining() < n {
        return Err(OdbError::BufferTooShort {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32_le(len as u32);
}

fn get_len(buf: &mut Bytes) -> OdbResult<usize> {
    need(buf, 4)?;
    Ok(buf.get_u32_le() as usize)
}

impl Wire for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        need(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl Wire for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(OdbError::InvalidWireFormat(format!("bad bool {}", other))),
        }
    }
}

impl Wire for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        need(buf, 4)?;
        Ok(buf.get_u32_le())
    }
}

impl Wire for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        need(buf, 8)?;
        Ok(buf.get_u64_le())
    }
}

impl Wire for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let len = get_len(buf)?;
        need(buf, len)?;
        Ok(buf.split_to(len))
    }
}

impl Wire for String {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let raw = Bytes::decode(buf)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| OdbError::InvalidWireFormat(format!("bad utf-8: {}", e)))
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let count = get_len(buf)?;
        // Every element occupies at least one byte
        let mut out = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            out.push(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<T: Wire + Ord> Wire for BTreeSet<T> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let count = get_len(buf)?;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for (k, v) in self {
            k.encode(buf);
            v.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let count = get_len(buf)?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = K::decode(buf)?;
            out.insert(k, V::decode(buf)?);
        }
        Ok(out)
    }
}

impl<K: Wire + Eq + Hash, V: Wire> Wire for HashMap<K, V> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for (k, v) in self {
            k.encode(buf);
            v.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let count = get_len(buf)?;
        let mut out = HashMap::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let k = K::decode(buf)?;
            out.insert(k, V::decode(buf)?);
        }
        Ok(out)
    }
}

macro_rules! wire_newtype {
    ($($ty:ident),*) => {
        $(
            impl Wire for $ty {
                fn encode(&self, buf: &mut BytesMut) {
                    buf.put_u64_le(self.0);
                }

                fn decode(buf: &mut Bytes) -> OdbResult<Self> {
                    Ok($ty(u64::decode(buf)?))
                }
            }
        )*
    };
}

wire_newtype!(ObjectId, FieldId, Tid, Guid);

impl Wire for ObjectFieldId {
    fn encode(&self, buf: &mut BytesMut) {
        self.object.encode(buf);
        self.field.encode(buf);
        self.is_index_value.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok(ObjectFieldId {
            object: ObjectId::decode(buf)?,
            field: FieldId::decode(buf)?,
            is_index_value: bool::decode(buf)?,
        })
    }
}

impl Wire for IndexId {
    fn encode(&self, buf: &mut BytesMut) {
        self.field.encode(buf);
        self.value.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok(IndexId {
            field: FieldId::decode(buf)?,
            value: Bytes::decode(buf)?,
        })
    }
}

impl Wire for FieldDefinition {
    fn encode(&self, buf: &mut BytesMut) {
        self.schema.encode(buf);
        self.typename.encode(buf);
        self.fieldname.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok(FieldDefinition {
            schema: String::decode(buf)?,
            typename: String::decode(buf)?,
            fieldname: String::decode(buf)?,
        })
    }
}

impl Wire for TypeDefinition {
    fn encode(&self, buf: &mut BytesMut) {
        self.fields.encode(buf);
        self.indices.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let def = TypeDefinition {
            fields: BTreeSet::decode(buf)?,
            indices: BTreeSet::decode(buf)?,
        };
        if !def.indices.is_subset(&def.fields) {
            return Err(OdbError::InvalidWireFormat(
                "index on undeclared field".into(),
            ));
        }
        Ok(def)
    }
}

impl Wire for SchemaDefinition {
    fn encode(&self, buf: &mut BytesMut) {
        self.types.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok(SchemaDefinition {
            types: BTreeMap::decode(buf)?,
        })
    }
}

impl Wire for BadKey {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            BadKey::Field(key) => {
                buf.put_u8(0);
                key.encode(buf);
            }
            BadKey::Index(index) => {
                buf.put_u8(1);
                index.encode(buf);
            }
            BadKey::Other(reason) => {
                buf.put_u8(2);
                reason.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        match u8::decode(buf)? {
            0 => Ok(BadKey::Field(ObjectFieldId::decode(buf)?)),
            1 => Ok(BadKey::Index(IndexId::decode(buf)?)),
            2 => Ok(BadKey::Other(String::decode(buf)?)),
            other => Err(OdbError::InvalidWireFormat(format!("bad key tag {}", other))),
        }
    }
}
