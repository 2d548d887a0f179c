//! Chunks
//!
//! A [`Chunk`] holds one timestamp's field data for every track of its
//! [`Descriptor`], packed into a single buffer:
//!
//! ```text
//! [field offsets, delta var-byte compressed]   n = descriptor.len()
//! [element counts, var-byte compressed]
//! [field 0][field 1]...[field n-1]
//! ```
//!
//! Offsets are relative to the start of the field region. A field ends where
//! the next one starts, the last one at the end of the buffer. Tracks without
//! a value occupy zero bytes.
//!
//! The index is decoded on first field access and kept until [`Chunk::close`].

use crate::codec::{DELTA_VAR_BYTE, IntegerCodec, VAR_BYTE};
use crate::descriptor::{Descriptor, Track};
use crate::field::{self, FieldValue};
use bytes::{BufMut, Bytes, BytesMut};
use multiflex_common::{Error, Result};
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// Decoded offset/length index of a chunk
#[derive(Clone, Debug)]
struct ChunkIndex {
    /// Start of the field region within the payload
    field_start: usize,
    /// Field offsets relative to `field_start`
    offsets: Vec<usize>,
    /// Element counts (integers for integer fields, bytes otherwise)
    lengths: Vec<usize>,
}

impl ChunkIndex {
    fn decode(payload: &[u8], count: usize) -> Result<Self> {
        let mut raw_offsets = Vec::new();
        let consumed = DELTA_VAR_BYTE.decompress(payload, count, &mut raw_offsets)?;
        let mut raw_lengths = Vec::new();
        let field_start =
            consumed + VAR_BYTE.decompress(&payload[consumed..], count, &mut raw_lengths)?;
        let field_len = payload.len() - field_start;

        let mut offsets = Vec::with_capacity(count);
        for raw in raw_offsets {
            let offset = usize::try_from(raw)
                .map_err(|_| Error::corrupt(format!("negative field offset {raw}")))?;
            if offset > field_len {
                return Err(Error::corrupt(format!(
                    "field offset {offset} beyond field region of {field_len} bytes"
                )));
            }
            if let Some(&previous) = offsets.last()
                && previous > offset
            {
                return Err(Error::corrupt(format!(
                    "field offsets decrease ({previous} before {offset})"
                )));
            }
            offsets.push(offset);
        }

        let lengths = raw_lengths
            .into_iter()
            .map(|raw| {
                usize::try_from(raw)
                    .map_err(|_| Error::corrupt(format!("negative field length {raw}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            field_start,
            offsets,
            lengths,
        })
    }

    /// Byte range of the field at `index` within the payload
    fn range(&self, index: usize, payload_len: usize) -> Range<usize> {
        let start = self.field_start + self.offsets[index];
        let end = self
            .offsets
            .get(index + 1)
            .map_or(payload_len, |&next| self.field_start + next);
        start..end
    }
}

/// One timestamp's worth of field data
#[derive(Clone, Debug)]
pub struct Chunk {
    descriptor: Arc<Descriptor>,
    timestamp: i64,
    payload: Bytes,
    index: OnceLock<ChunkIndex>,
}

impl Chunk {
    /// Create a builder for chunks using `descriptor`
    #[must_use]
    pub fn builder(descriptor: Arc<Descriptor>) -> ChunkBuilder {
        ChunkBuilder::new(descriptor)
    }

    /// Wrap a serialized payload read back from a store.
    ///
    /// Nothing is decoded until a field is accessed.
    #[must_use]
    pub fn from_parts(descriptor: Arc<Descriptor>, timestamp: i64, payload: Bytes) -> Self {
        Self {
            descriptor,
            timestamp,
            payload,
            index: OnceLock::new(),
        }
    }

    /// Descriptor this chunk's index refers to
    #[must_use]
    pub const fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Serialized form of this chunk
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Drop the decoded index; it is decoded again on the next access.
    pub fn close(&mut self) {
        self.index.take();
    }

    fn index(&self) -> Result<&ChunkIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let decoded = ChunkIndex::decode(&self.payload, self.descriptor.len())?;
        Ok(self.index.get_or_init(|| decoded))
    }

    /// Resolve a track to its byte range and element count.
    fn field(&self, track_id: i32) -> Result<Option<(&Track, Range<usize>, usize)>> {
        let Some(track) = self.descriptor.get_track(track_id) else {
            return Ok(None);
        };
        let index = self.index()?;
        let range = index.range(track.index(), self.payload.len());
        Ok(Some((track, range, index.lengths[track.index()])))
    }

    /// Element count recorded for a track: integers for integer tracks,
    /// bytes otherwise. `None` if the track is not part of the descriptor.
    pub fn field_len(&self, track_id: i32) -> Result<Option<usize>> {
        Ok(self.field(track_id)?.map(|(_, _, length)| length))
    }

    /// Integer values of a track, `None` if the track is not part of the
    /// descriptor. Unset tracks yield an empty vector.
    pub fn get_integers(&self, track_id: i32) -> Result<Option<Vec<i32>>> {
        let Some((track, range, count)) = self.field(track_id)? else {
            return Ok(None);
        };
        field::decode_integers(track, &self.payload[range], count).map(Some)
    }

    /// Text of a track, `None` if the track is not part of the descriptor.
    /// Unset tracks yield an empty string.
    pub fn get_text(&self, track_id: i32) -> Result<Option<String>> {
        let Some((track, range, length)) = self.field(track_id)? else {
            return Ok(None);
        };
        field::decode_text(track, &self.payload[range], length).map(Some)
    }

    /// Raw bytes of a track without copying, `None` if the track is not
    /// part of the descriptor. Unset tracks yield empty bytes.
    pub fn get_binary(&self, track_id: i32) -> Result<Option<Bytes>> {
        let Some((track, range, length)) = self.field(track_id)? else {
            return Ok(None);
        };
        field::decode_binary(track, self.payload.slice(range), length).map(Some)
    }
}

/// An encoded field waiting for `build`
#[derive(Clone, Debug)]
struct PendingField {
    data: Bytes,
    length: usize,
}

/// Accumulates field values for one descriptor and serializes them.
///
/// The builder is reset after every successful [`ChunkBuilder::build`] and
/// can be reused for the next timestamp.
#[derive(Clone, Debug)]
pub struct ChunkBuilder {
    descriptor: Arc<Descriptor>,
    timestamp: Option<i64>,
    fields: Vec<Option<PendingField>>,
}

impl ChunkBuilder {
    /// Create a builder bound to `descriptor`
    #[must_use]
    pub fn new(descriptor: Arc<Descriptor>) -> Self {
        let fields = vec![None; descriptor.len()];
        Self {
            descriptor,
            timestamp: None,
            fields,
        }
    }

    /// Descriptor the built chunks refer to
    #[must_use]
    pub const fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    /// Set the chunk's timestamp, which must not be negative
    pub fn set_timestamp(&mut self, timestamp: i64) -> Result<&mut Self> {
        if timestamp < 0 {
            return Err(Error::invalid_argument(format!(
                "timestamp must not be negative: {timestamp}"
            )));
        }
        self.timestamp = Some(timestamp);
        Ok(self)
    }

    pub fn set_integers(&mut self, track_id: i32, values: &[i32]) -> Result<&mut Self> {
        self.set(track_id, FieldValue::Integers(values))
    }

    pub fn set_text(&mut self, track_id: i32, text: &str) -> Result<&mut Self> {
        self.set(track_id, FieldValue::Text(text))
    }

    pub fn set_binary(&mut self, track_id: i32, bytes: &[u8]) -> Result<&mut Self> {
        self.set(track_id, FieldValue::Binary(bytes))
    }

    /// Encode and remember the value for one track.
    ///
    /// Every track can be set at most once per build cycle.
    pub fn set(&mut self, track_id: i32, value: FieldValue<'_>) -> Result<&mut Self> {
        let track = *self
            .descriptor
            .get_track(track_id)
            .ok_or(Error::UnknownTrack(track_id))?;
        if self.fields[track.index()].is_some() {
            return Err(Error::DuplicateField(track_id));
        }
        if i32::try_from(value.len()).is_err() {
            return Err(Error::invalid_argument(format!(
                "track {track_id} holds too many elements: {}",
                value.len()
            )));
        }

        let mut data = BytesMut::new();
        field::encode(&track, value, &mut data)?;
        self.fields[track.index()] = Some(PendingField {
            data: data.freeze(),
            length: value.len(),
        });
        Ok(self)
    }

    /// Forget the timestamp and all field values
    pub fn reset(&mut self) {
        self.timestamp = None;
        self.fields.iter_mut().for_each(|field| *field = None);
    }

    /// Serialize the collected values into a chunk and reset the builder.
    pub fn build(&mut self) -> Result<Chunk> {
        let timestamp = self.timestamp.ok_or(Error::MissingTimestamp)?;

        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut lengths = Vec::with_capacity(self.fields.len());
        let mut position = 0usize;
        for field in &self.fields {
            let offset = i32::try_from(position).map_err(|_| {
                Error::invalid_argument(format!("chunk field data too large: {position} bytes"))
            })?;
            offsets.push(offset);
            let (size, length) = field
                .as_ref()
                .map_or((0, 0), |field| (field.data.len(), field.length));
            // element counts were range checked in `set`
            lengths.push(length as i32);
            position += size;
        }

        let mut payload = BytesMut::with_capacity(position + 2 * offsets.len());
        DELTA_VAR_BYTE.compress(&offsets, &mut payload);
        VAR_BYTE.compress(&lengths, &mut payload);
        for field in self.fields.iter().flatten() {
            payload.put_slice(&field.data);
        }

        let chunk = Chunk::from_parts(Arc::clone(&self.descriptor), timestamp, payload.freeze());
        self.reset();
        Ok(chunk)
    }
}
