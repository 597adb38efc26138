//! Identity types for ODB
//!
//! Object identities are 64-bit: the high 32 bits are the identity root
//! handed to a connection, the low 32 bits a counter local to that root.
//! Connections can therefore mint identities without a round trip.

use std::fmt;

/// Object identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        ObjectId(id)
    }

    /// Create an object ID from an identity root and a local counter
    /// Format: \[root:32\]\[counter:32\]
    #[inline]
    pub fn from_root(root: u32, counter: u32) -> Self {
        ObjectId(((root as u64) << 32) | counter as u64)
    }

    #[inline]
    pub fn root(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn counter(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        ObjectId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:08x}:{:08x})", self.root(), self.counter())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.root(), self.counter())
    }
}

/// Field handle - stands for one (schema, type, field) triple
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FieldId(pub u64);

impl FieldId {
    #[inline]
    pub fn new(id: u64) -> Self {
        FieldId(id)
    }
}

impl fmt::Debug for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({})", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction id - the global commit counter
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(pub u64);

impl Tid {
    pub const ZERO: Tid = Tid(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        Tid(id)
    }

    #[inline]
    pub fn next(self) -> Self {
        Tid(self.0 + 1)
    }

    #[inline]
    pub fn saturating_sub(self, n: u64) -> Self {
        Tid(self.0.saturating_sub(n))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request correlation id (transactions, flushes, dependent connections)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub u64);

impl Guid {
    #[inline]
    pub fn new(id: u64) -> Self {
        Guid(id)
    }

    /// Generate a random guid
    pub fn random() -> Self {
        Guid(rand::random())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:016x})", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Server-side handle for one attached channel
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(pub u64);

impl ChannelId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ChannelId(id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
