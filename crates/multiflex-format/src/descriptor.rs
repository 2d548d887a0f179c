//! Track descriptors
//!
//! A [`Descriptor`] is the schema shared by one or more chunks: the sorted
//! list of tracks (track id and field encoding) that a chunk's index refers to
//! by position. Descriptors are scoped to one store and receive a persisted id
//! when they are first written there.
//!
//! # Binary layout
//!
//! ```text
//! [track count: u32 LE]
//! [track ids, delta var-byte compressed]
//! [encoding tags, var-byte compressed]
//! ```

use crate::codec::{DELTA_VAR_BYTE, IntegerCodec, VAR_BYTE};
use bytes::{BufMut, Bytes, BytesMut};
use multiflex_common::{Encoding, Error, Result, StoreId};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// One typed data channel within a descriptor
#[derive(Clone, Copy, Debug)]
pub struct Track {
    id: i32,
    encoding: Encoding,
    index: usize,
}

impl Track {
    /// Application-defined track id
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Encoding of this track's field data
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Position of this track in the descriptor (and in every chunk index)
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.encoding == other.encoding
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.encoding.hash(state);
    }
}

/// Sorted, store-scoped set of tracks
#[derive(Clone, Debug)]
pub struct Descriptor {
    tracks: Arc<[Track]>,
    store_id: Option<StoreId>,
    /// 0 until the descriptor has been interned by a store
    persisted_id: u64,
}

impl Descriptor {
    /// Create a builder for descriptors not yet bound to a store
    #[must_use]
    pub fn builder() -> DescriptorBuilder {
        DescriptorBuilder::default()
    }

    /// Number of tracks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Check if the descriptor has no tracks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// All tracks, sorted ascending by id
    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Iterate over the tracks in id order
    pub fn iter(&self) -> std::slice::Iter<'_, Track> {
        self.tracks.iter()
    }

    /// Look up a track by id
    #[must_use]
    pub fn get_track(&self, track_id: i32) -> Option<&Track> {
        self.tracks
            .binary_search_by_key(&track_id, Track::id)
            .ok()
            .map(|i| &self.tracks[i])
    }

    /// Store this descriptor is scoped to
    #[must_use]
    pub const fn store_id(&self) -> Option<StoreId> {
        self.store_id
    }

    /// Database id assigned by interning, 0 if not yet persisted
    #[must_use]
    pub const fn persisted_id(&self) -> u64 {
        self.persisted_id
    }

    /// Check if this descriptor has been persisted in its store
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        self.persisted_id != 0
    }

    /// Scope this descriptor to a store.
    ///
    /// Returns the same instance if it already belongs to `store_id`,
    /// otherwise a copy with the new scope that has to be interned again.
    #[must_use]
    pub fn for_store(self: &Arc<Self>, store_id: StoreId) -> Arc<Self> {
        if self.store_id == Some(store_id) {
            return Arc::clone(self);
        }
        Arc::new(Self {
            tracks: Arc::clone(&self.tracks),
            store_id: Some(store_id),
            persisted_id: 0,
        })
    }

    /// Copy of this descriptor carrying the id its store assigned to it.
    #[must_use]
    pub fn with_persisted_id(&self, persisted_id: u64) -> Self {
        Self {
            tracks: Arc::clone(&self.tracks),
            store_id: self.store_id,
            persisted_id,
        }
    }

    /// Serialize the track list.
    ///
    /// The encoding only depends on the tracks, so two descriptors with the
    /// same content always produce identical bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let ids: Vec<i32> = self.tracks.iter().map(Track::id).collect();
        let tags: Vec<i32> = self.tracks.iter().map(|t| t.encoding.tag()).collect();

        let mut buf = BytesMut::with_capacity(4 + self.tracks.len() * 2);
        // track count fits: the builder caps it at i32::MAX
        buf.put_u32_le(self.tracks.len() as u32);
        DELTA_VAR_BYTE.compress(&ids, &mut buf);
        VAR_BYTE.compress(&tags, &mut buf);
        buf.freeze()
    }

    /// Deserialize a descriptor read back from a store.
    pub fn decode(data: &[u8], persisted_id: u64, store_id: Option<StoreId>) -> Result<Self> {
        let Some((count, rest)) = data.split_first_chunk::<4>() else {
            return Err(Error::corrupt(format!(
                "descriptor {persisted_id} is too short: {} bytes",
                data.len()
            )));
        };
        let count = u32::from_le_bytes(*count) as usize;

        let mut ids = Vec::new();
        let consumed = DELTA_VAR_BYTE.decompress(rest, count, &mut ids)?;
        let mut tags = Vec::new();
        let consumed = consumed + VAR_BYTE.decompress(&rest[consumed..], count, &mut tags)?;
        if consumed != rest.len() {
            return Err(Error::corrupt(format!(
                "descriptor {persisted_id} has {} trailing bytes",
                rest.len() - consumed
            )));
        }

        let mut tracks = Vec::with_capacity(count);
        for (index, (&id, &tag)) in ids.iter().zip(&tags).enumerate() {
            if let Some(previous) = tracks.last().map(Track::id)
                && previous >= id
            {
                return Err(Error::corrupt(format!(
                    "descriptor {persisted_id} track ids are not strictly ascending ({previous} before {id})"
                )));
            }
            tracks.push(Track {
                id,
                encoding: Encoding::from_tag(tag)?,
                index,
            });
        }

        Ok(Self {
            tracks: tracks.into(),
            store_id,
            persisted_id,
        })
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.store_id == other.store_id && self.tracks == other.tracks
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.store_id.hash(state);
        self.tracks.hash(state);
    }
}

impl<'a> IntoIterator for &'a Descriptor {
    type Item = &'a Track;
    type IntoIter = std::slice::Iter<'a, Track>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Re-usable builder for descriptors
#[derive(Clone, Debug, Default)]
pub struct DescriptorBuilder {
    tracks: Vec<(i32, Encoding)>,
    store_id: Option<StoreId>,
}

impl DescriptorBuilder {
    /// Create a builder producing descriptors scoped to `store_id`
    #[must_use]
    pub fn for_store(store_id: StoreId) -> Self {
        Self {
            tracks: Vec::new(),
            store_id: Some(store_id),
        }
    }

    /// Add a track
    pub fn add_track(&mut self, track_id: i32, encoding: Encoding) -> &mut Self {
        self.tracks.push((track_id, encoding));
        self
    }

    /// Build a descriptor from the added tracks and reset this builder.
    ///
    /// Tracks are sorted by id and indexed in that order. Adding the same
    /// track id twice is rejected with [`Error::DuplicateTrack`].
    pub fn build(&mut self) -> Result<Descriptor> {
        let mut added = std::mem::take(&mut self.tracks);
        added.sort_by_key(|&(id, _)| id);

        if let Some(pair) = added.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(Error::DuplicateTrack(pair[0].0));
        }
        if i32::try_from(added.len()).is_err() {
            return Err(Error::invalid_argument(format!(
                "too many tracks: {}",
                added.len()
            )));
        }

        let tracks: Vec<Track> = added
            .into_iter()
            .enumerate()
            .map(|(index, (id, encoding))| Track {
                id,
                encoding,
                index,
            })
            .collect();

        Ok(Descriptor {
            tracks: tracks.into(),
            store_id: self.store_id,
            persisted_id: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptor {
        Descriptor::builder()
            .add_track(42, Encoding::Utf8String)
            .add_track(-7, Encoding::Binary)
            .add_track(3, Encoding::Int32DeltaVarByte)
            .add_track(1000, Encoding::Int32VarByte)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_sorts_and_indexes() {
        let descriptor = sample();
        let ids: Vec<i32> = descriptor.iter().map(Track::id).collect();
        assert_eq!(ids, vec![-7, 3, 42, 1000]);

        for (i, track) in descriptor.iter().enumerate() {
            assert_eq!(track.index(), i);
        }
        assert!(!descriptor.is_persisted());
    }

    #[test]
    fn test_get_track() {
        let descriptor = sample();
        let track = descriptor.get_track(42).unwrap();
        assert_eq!(track.encoding(), Encoding::Utf8String);
        assert_eq!(track.index(), 2);
        assert!(descriptor.get_track(4).is_none());
        assert!(descriptor.get_track(i32::MIN).is_none());
    }

    #[test]
    fn test_builder_resets() {
        let mut builder = Descriptor::builder();
        builder.add_track(1, Encoding::Binary);
        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_duplicate_track_rejected() {
        let err = Descriptor::builder()
            .add_track(5, Encoding::Binary)
            .add_track(5, Encoding::Utf8String)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTrack(5)));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let descriptor = sample();
        let bytes = descriptor.encode();
        let decoded = Descriptor::decode(&bytes, 9, None).unwrap();

        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.persisted_id(), 9);
        for (a, b) in decoded.iter().zip(descriptor.iter()) {
            assert_eq!(a.index(), b.index());
        }
    }

    #[test]
    fn test_empty_descriptor_roundtrip() {
        let descriptor = Descriptor::builder().build().unwrap();
        let bytes = descriptor.encode();
        assert_eq!(bytes.len(), 4);
        assert!(Descriptor::decode(&bytes, 1, None).unwrap().is_empty());
    }

    #[test]
    fn test_identical_content_encodes_identically() {
        let a = sample();
        let b = DescriptorBuilder::for_store(StoreId::new())
            .add_track(1000, Encoding::Int32VarByte)
            .add_track(3, Encoding::Int32DeltaVarByte)
            .add_track(-7, Encoding::Binary)
            .add_track(42, Encoding::Utf8String)
            .build()
            .unwrap();
        assert_eq!(a.encode(), b.encode());
        // different scope, so not equal
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Descriptor::decode(&[1, 0], 1, None).unwrap_err().is_corruption());

        let mut bytes = sample().encode().to_vec();
        bytes.push(0);
        assert!(Descriptor::decode(&bytes, 1, None).unwrap_err().is_corruption());

        // count claims far more tracks than there are bytes
        let bytes = [0xff, 0xff, 0xff, 0x7f, 1, 2];
        assert!(Descriptor::decode(&bytes, 1, None).unwrap_err().is_corruption());
    }

    #[test]
    fn test_decode_rejects_unknown_encoding() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        DELTA_VAR_BYTE.compress(&[1], &mut buf);
        VAR_BYTE.compress(&[99], &mut buf);
        assert!(matches!(
            Descriptor::decode(&buf, 1, None),
            Err(Error::UnknownEncoding(99))
        ));
    }

    #[test]
    fn test_for_store() {
        let store = StoreId::new();
        let descriptor = Arc::new(
            DescriptorBuilder::for_store(store)
                .add_track(1, Encoding::Binary)
                .build()
                .unwrap()
                .with_persisted_id(12),
        );

        let same = descriptor.for_store(store);
        assert!(Arc::ptr_eq(&same, &descriptor));
        assert_eq!(same.persisted_id(), 12);

        let other = StoreId::new();
        let moved = descriptor.for_store(other);
        assert_eq!(moved.store_id(), Some(other));
        assert_eq!(moved.persisted_id(), 0);
        assert_eq!(moved.tracks(), descriptor.tracks());
    }
}
