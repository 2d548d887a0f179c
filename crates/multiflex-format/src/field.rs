//! Field encoding
//!
//! Converts per-track values to and from the byte ranges stored in a chunk.
//! Field bytes carry no length prefix: the element count lives in the chunk
//! index and is handed back to the decoder.

use crate::codec::codec_for;
use crate::descriptor::Track;
use bytes::{BufMut, Bytes, BytesMut};
use multiflex_common::{Encoding, Error, Result};

/// A value for one track
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Raw bytes
    Binary(&'a [u8]),
    /// UTF-8 text
    Text(&'a str),
    /// 32-bit integers
    Integers(&'a [i32]),
}

/// Kind of value a track can hold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Binary,
    Text,
    Integers,
}

impl FieldKind {
    /// Name of the value kind, used in error messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Integers => "integer",
        }
    }

    /// Check if fields of this kind can be stored with `encoding`
    #[must_use]
    pub const fn accepts(self, encoding: Encoding) -> bool {
        match self {
            Self::Binary => matches!(encoding, Encoding::Binary),
            Self::Text => matches!(encoding, Encoding::Utf8String),
            Self::Integers => encoding.is_integer(),
        }
    }
}

impl FieldValue<'_> {
    /// Kind of this value
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::Binary(_) => FieldKind::Binary,
            Self::Text(_) => FieldKind::Text,
            Self::Integers(_) => FieldKind::Integers,
        }
    }

    /// Element count recorded in the chunk index: bytes for binary and text,
    /// integers for integer arrays
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
            Self::Integers(values) => values.len(),
        }
    }

    /// Check if the value holds no elements
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check that a track's encoding can hold a value kind.
fn check_kind(track: &Track, kind: FieldKind) -> Result<()> {
    let encoding = track.encoding();
    if kind.accepts(encoding) {
        return Ok(());
    }
    if matches!(encoding, Encoding::None) {
        return Err(Error::UnsupportedEncoding(encoding));
    }
    Err(Error::EncodingMismatch {
        track: track.id(),
        encoding,
        kind: kind.as_str(),
    })
}

/// Unset field of a track whose encoding never holds data.
///
/// Such fields read back as empty whatever kind is requested.
const fn is_empty_without_data(track: &Track, data: &[u8], length: usize) -> bool {
    matches!(
        track.encoding(),
        Encoding::None | Encoding::Int32CenterFiltered
    ) && data.is_empty()
        && length == 0
}

/// Append the encoded form of `value` for `track` to `out`.
pub fn encode(track: &Track, value: FieldValue<'_>, out: &mut BytesMut) -> Result<()> {
    check_kind(track, value.kind())?;
    match value {
        FieldValue::Binary(bytes) => out.put_slice(bytes),
        FieldValue::Text(text) => out.put_slice(text.as_bytes()),
        FieldValue::Integers(values) => codec_for(track.encoding())?.compress(values, out),
    }
    Ok(())
}

/// Decode an integer field holding exactly `count` values.
///
/// The field's byte range must be consumed completely, otherwise the index
/// and the field data disagree and the chunk is corrupt.
pub fn decode_integers(track: &Track, data: &[u8], count: usize) -> Result<Vec<i32>> {
    if is_empty_without_data(track, data, count) {
        return Ok(Vec::new());
    }
    check_kind(track, FieldKind::Integers)?;
    let mut values = Vec::new();
    let consumed = codec_for(track.encoding())?.decompress(data, count, &mut values)?;
    if consumed != data.len() {
        return Err(Error::corrupt(format!(
            "track {} decoded {count} integers from {consumed} of {} bytes",
            track.id(),
            data.len()
        )));
    }
    Ok(values)
}

/// Decode a text field.
pub fn decode_text(track: &Track, data: &[u8], length: usize) -> Result<String> {
    if is_empty_without_data(track, data, length) {
        return Ok(String::new());
    }
    check_kind(track, FieldKind::Text)?;
    check_length(track, data, length)?;
    String::from_utf8(data.to_vec())
        .map_err(|e| Error::corrupt(format!("track {} holds invalid UTF-8: {e}", track.id())))
}

/// Decode a binary field (zero-copy).
pub fn decode_binary(track: &Track, data: Bytes, length: usize) -> Result<Bytes> {
    if is_empty_without_data(track, &data, length) {
        return Ok(data);
    }
    check_kind(track, FieldKind::Binary)?;
    check_length(track, &data, length)?;
    Ok(data)
}

fn check_length(track: &Track, data: &[u8], length: usize) -> Result<()> {
    if data.len() != length {
        return Err(Error::corrupt(format!(
            "track {} holds {} bytes but the index declares {length}",
            track.id(),
            data.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Descriptor;

    fn tracks() -> Descriptor {
        Descriptor::builder()
            .add_track(1, Encoding::Binary)
            .add_track(2, Encoding::Utf8String)
            .add_track(3, Encoding::Int32VarByte)
            .add_track(4, Encoding::Int32DeltaVarByte)
            .add_track(5, Encoding::None)
            .add_track(6, Encoding::Int32CenterFiltered)
            .build()
            .unwrap()
    }

    #[test]
    fn test_binary_is_verbatim() {
        let descriptor = tracks();
        let track = descriptor.get_track(1).unwrap();
        let mut out = BytesMut::new();
        encode(track, FieldValue::Binary(&[0, 1, 255]), &mut out).unwrap();
        assert_eq!(&out[..], &[0, 1, 255]);

        let decoded = decode_binary(track, out.freeze(), 3).unwrap();
        assert_eq!(&decoded[..], &[0, 1, 255]);
    }

    #[test]
    fn test_text_has_no_terminator() {
        let descriptor = tracks();
        let track = descriptor.get_track(2).unwrap();
        let mut out = BytesMut::new();
        let value = FieldValue::Text("grüß");
        encode(track, value, &mut out).unwrap();
        assert_eq!(out.len(), value.len());
        assert_eq!(decode_text(track, &out, value.len()).unwrap(), "grüß");
    }

    #[test]
    fn test_integers_roundtrip() {
        let descriptor = tracks();
        for id in [3, 4] {
            let track = descriptor.get_track(id).unwrap();
            let values = [10, 12, 9, 9, 50];
            let mut out = BytesMut::new();
            encode(track, FieldValue::Integers(&values), &mut out).unwrap();
            assert_eq!(decode_integers(track, &out, values.len()).unwrap(), values);
        }
    }

    #[test]
    fn test_kind_mismatch() {
        let descriptor = tracks();
        let mut out = BytesMut::new();

        let err = encode(
            descriptor.get_track(2).unwrap(),
            FieldValue::Integers(&[1]),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::EncodingMismatch {
                track: 2,
                kind: "integer",
                ..
            }
        ));

        let err = decode_text(descriptor.get_track(3).unwrap(), b"abc", 3).unwrap_err();
        assert!(matches!(err, Error::EncodingMismatch { track: 3, .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_unsupported_encodings() {
        let descriptor = tracks();
        let mut out = BytesMut::new();
        let err = encode(
            descriptor.get_track(5).unwrap(),
            FieldValue::Binary(b"x"),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedEncoding(Encoding::None)));

        let err = encode(
            descriptor.get_track(6).unwrap(),
            FieldValue::Integers(&[1, 2]),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedEncoding(Encoding::Int32CenterFiltered)
        ));
    }

    #[test]
    fn test_dataless_encodings_decode_empty() {
        let descriptor = tracks();
        for id in [5, 6] {
            let track = descriptor.get_track(id).unwrap();
            assert!(decode_integers(track, &[], 0).unwrap().is_empty());
            assert!(decode_text(track, &[], 0).unwrap().is_empty());
            assert!(decode_binary(track, Bytes::new(), 0).unwrap().is_empty());
        }

        // bytes in a field that cannot hold data are still rejected
        let none = descriptor.get_track(5).unwrap();
        assert!(matches!(
            decode_binary(none, Bytes::from_static(b"x"), 1),
            Err(Error::UnsupportedEncoding(Encoding::None))
        ));
        let filtered = descriptor.get_track(6).unwrap();
        assert!(matches!(
            decode_integers(filtered, &[2], 1),
            Err(Error::UnsupportedEncoding(Encoding::Int32CenterFiltered))
        ));
    }

    #[test]
    fn test_inconsistent_lengths_are_corrupt() {
        let descriptor = tracks();
        let track = descriptor.get_track(2).unwrap();
        assert!(decode_text(track, b"hello", 4).unwrap_err().is_corruption());
        assert!(decode_text(track, &[0xff, 0xfe], 2).unwrap_err().is_corruption());

        let track = descriptor.get_track(3).unwrap();
        // two codes present, one expected
        assert!(decode_integers(track, &[1, 2], 1).unwrap_err().is_corruption());
        // one code present, two expected
        assert!(decode_integers(track, &[1], 2).unwrap_err().is_corruption());
    }
}
