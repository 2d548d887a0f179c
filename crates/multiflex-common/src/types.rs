//! Core type definitions for Multiflex
//!
//! This module defines the persisted field encodings, the store identity
//! and the metadata keys reserved for store-internal use.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Encoding of a track's field data.
///
/// The tag of each variant is part of the on-disk format: it is written into
/// every persisted descriptor. Tags are fixed and must never be renumbered
/// or reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[repr(i32)]
pub enum Encoding {
    /// No data
    #[display("NONE")]
    None = 0,
    /// Raw bytes, stored verbatim
    #[display("BINARY")]
    Binary = 1,
    /// UTF-8 text without terminator or length prefix
    #[display("UTF8_STRING")]
    Utf8String = 2,
    /// 32-bit integers, variable-byte compressed
    #[display("INT32_VARBYTE")]
    Int32VarByte = 3,
    /// 32-bit integers, delta transformed then variable-byte compressed
    #[display("INT32_DELTA_VARBYTE")]
    Int32DeltaVarByte = 4,
    /// 32-bit integers with a center-line filter applied before compression
    #[display("INT32_CENTER_FILTERED")]
    Int32CenterFiltered = 5,
}

impl Encoding {
    /// All encodings in tag order
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::Binary,
        Self::Utf8String,
        Self::Int32VarByte,
        Self::Int32DeltaVarByte,
        Self::Int32CenterFiltered,
    ];

    /// Persisted tag of this encoding
    #[must_use]
    pub const fn tag(self) -> i32 {
        self as i32
    }

    /// Resolve a persisted tag
    pub fn from_tag(tag: i32) -> Result<Self> {
        Self::ALL
            .get(usize::try_from(tag).map_err(|_| Error::UnknownEncoding(tag))?)
            .copied()
            .ok_or(Error::UnknownEncoding(tag))
    }

    /// Whether fields of this encoding hold 32-bit integers
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int32VarByte | Self::Int32DeltaVarByte | Self::Int32CenterFiltered
        )
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|encoding| encoding.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_argument(format!("unknown encoding name: {s}")))
    }
}

/// Unique identifier of a store (container file), a version 4 UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Generate a new random store ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse a persisted identity, accepting only well-formed v4 UUIDs
    pub fn parse(value: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(value)
            .map_err(|e| Error::invalid_identity(format!("malformed store id {value:?}: {e}")))?;
        if uuid.get_version_num() != 4 {
            return Err(Error::invalid_identity(format!(
                "store id {value} is not a UUIDv4"
            )));
        }
        Ok(Self(uuid))
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata keys reserved for store-internal purposes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ReservedMetaKey {
    #[display("ID")]
    Id,
    #[display("EPOCH_MICROS")]
    EpochMicros,
    #[display("VERSION")]
    Version,
}

impl ReservedMetaKey {
    /// All reserved keys
    pub const ALL: [Self; 3] = [Self::Id, Self::EpochMicros, Self::Version];

    /// Key as stored in the metadata table
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::EpochMicros => "EPOCH_MICROS",
            Self::Version => "VERSION",
        }
    }

    /// Check if a metadata key is reserved
    #[must_use]
    pub fn is_reserved(key: &str) -> bool {
        Self::ALL.iter().any(|reserved| reserved.as_str() == key)
    }
}
