//! Redb table definitions for container files.

use redb::{TableDefinition, TableHandle, WriteTransaction};

// Metadata: reserved keys (ID, VERSION, EPOCH_MICROS) and user keys
pub const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

// Descriptors
// Key: persisted id (1-based), Value: descriptor encoding
pub const TRACK_DESCRIPTOR: TableDefinition<u64, &[u8]> =
    TableDefinition::new("track_descriptor");
// Key: descriptor encoding, Value: persisted id (keeps encodings unique)
pub const TRACK_DESCRIPTOR_CONTENT: TableDefinition<&[u8], u64> =
    TableDefinition::new("track_descriptor_content");

// Chunks
// Key: timestamp, Value: (descriptor id, chunk payload)
pub const TRACK: TableDefinition<i64, (u64, &[u8])> = TableDefinition::new("track");

/// Tables a migration can create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Meta,
    TrackDescriptor,
    TrackDescriptorContent,
    Track,
}

impl Table {
    /// Name of the table in the container file
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Meta => META.name(),
            Self::TrackDescriptor => TRACK_DESCRIPTOR.name(),
            Self::TrackDescriptorContent => TRACK_DESCRIPTOR_CONTENT.name(),
            Self::Track => TRACK.name(),
        }
    }

    /// Create the table if it doesn't exist yet.
    pub fn create(self, txn: &WriteTransaction) -> Result<(), redb::TableError> {
        match self {
            Self::Meta => txn.open_table(META).map(drop),
            Self::TrackDescriptor => txn.open_table(TRACK_DESCRIPTOR).map(drop),
            Self::TrackDescriptorContent => txn.open_table(TRACK_DESCRIPTOR_CONTENT).map(drop),
            Self::Track => txn.open_table(TRACK).map(drop),
        }
    }
}
