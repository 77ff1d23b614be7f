//! Storage parts and their serialization.

use std::collections::BTreeMap;
use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{KvError, Result};

/// A value that can live in a record store
pub trait StoragePart {
    /// Small integer tag of the part's type
    fn record_type(&self) -> u8;

    /// Identity of the part within its type
    fn primary_key(&self) -> i64;
}

/// Converts parts to payload bytes and back
pub trait PartSerializer<P>: Send + Sync {
    fn serialize(&self, part: &P, out: &mut dyn Write) -> Result<()>;

    /// Decode a payload written for a part of type `record_type`
    fn deserialize(&self, record_type: u8, bytes: &[u8]) -> Result<P>;
}

/// Default serializer: serde + bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl<P> PartSerializer<P> for BincodeSerializer
where
    P: Serialize + DeserializeOwned,
{
    fn serialize(&self, part: &P, out: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(out, part)?;
        Ok(())
    }

    fn deserialize(&self, _record_type: u8, bytes: &[u8]) -> Result<P> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Closed set of record types a store accepts
#[derive(Debug, Clone, Default)]
pub struct RecordTypeRegistry {
    names: BTreeMap<u8, String>,
}

impl RecordTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type tag under a readable name
    pub fn register(mut self, record_type: u8, name: impl Into<String>) -> Self {
        self.names.insert(record_type, name.into());
        self
    }

    pub fn contains(&self, record_type: u8) -> bool {
        self.names.contains_key(&record_type)
    }

    pub fn name(&self, record_type: u8) -> Option<&str> {
        self.names.get(&record_type).map(String::as_str)
    }

    pub fn record_types(&self) -> impl Iterator<Item = u8> + '_ {
        self.names.keys().copied()
    }

    /// Fail with `UnknownRecordType` for tags outside the registry
    pub fn ensure_known(&self, record_type: u8) -> Result<()> {
        if self.contains(record_type) {
            Ok(())
        } else {
            Err(KvError::UnknownRecordType(record_type))
        }
    }
}
