//! Headless integer compression
//!
//! Integer arrays are stored without an embedded length prefix: the reader
//! always knows how many integers to expect (from the descriptor for field
//! data, from the track count for chunk index blocks). Decoders report how
//! many input bytes they consumed so callers can walk a buffer holding several
//! back-to-back compressed regions with a single cursor.
//!
//! Codecs are stateless and shared as `&'static` references.

use bytes::{BufMut, BytesMut};
use multiflex_common::{Encoding, Error, Result};

/// Longest var-byte code for a 32-bit value
const MAX_VAR_BYTE_LEN: usize = 5;

/// Compression of `i32` arrays without an embedded element count.
pub trait IntegerCodec: Send + Sync {
    /// Human-readable codec name
    fn name(&self) -> &'static str;

    /// Append the compressed form of `input` to `out`.
    fn compress(&self, input: &[i32], out: &mut BytesMut);

    /// Decode exactly `count` integers from the start of `input` into `out`.
    ///
    /// Returns the number of input bytes consumed. Input that ends early or
    /// holds an over-long code is reported as [`Error::DecodeCorrupt`].
    fn decompress(&self, input: &[u8], count: usize, out: &mut Vec<i32>) -> Result<usize>;
}

/// Plain variable-byte codec: seven payload bits per byte, high bit set on
/// every byte but the last.
#[derive(Clone, Copy, Debug, Default)]
pub struct VarByte;

/// Delta transform followed by variable-byte compression.
///
/// The first value is stored verbatim, every following value as the
/// (wrapping) difference to its predecessor. Best suited to non-decreasing
/// sequences such as chunk offsets or sorted track ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaVarByte;

/// Shared plain var-byte codec
pub static VAR_BYTE: VarByte = VarByte;

/// Shared delta var-byte codec
pub static DELTA_VAR_BYTE: DeltaVarByte = DeltaVarByte;

/// Resolve the integer codec used for an encoding.
pub fn codec_for(encoding: Encoding) -> Result<&'static dyn IntegerCodec> {
    match encoding {
        Encoding::Int32VarByte => Ok(&VAR_BYTE),
        Encoding::Int32DeltaVarByte => Ok(&DELTA_VAR_BYTE),
        other => Err(Error::UnsupportedEncoding(other)),
    }
}

fn put_var_byte(out: &mut BytesMut, value: u32) {
    let mut value = value;
    while value >= 0x80 {
        out.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn get_var_byte(input: &[u8], pos: &mut usize) -> Result<u32> {
    let mut value = 0u32;
    for i in 0..MAX_VAR_BYTE_LEN {
        let byte = *input
            .get(*pos)
            .ok_or_else(|| Error::corrupt(format!("var-byte code truncated at byte {}", *pos)))?;
        *pos += 1;

        let bits = u32::from(byte & 0x7f);
        if i == MAX_VAR_BYTE_LEN - 1 && bits > 0x0f {
            return Err(Error::corrupt("var-byte code overflows 32 bits"));
        }
        value |= bits << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::corrupt(format!(
        "var-byte code longer than {MAX_VAR_BYTE_LEN} bytes"
    )))
}

/// Reject counts that can't possibly fit in the input (every code is at
/// least one byte) before allocating for them.
fn check_count(input: &[u8], count: usize) -> Result<()> {
    if count > input.len() {
        return Err(Error::corrupt(format!(
            "expected {count} integers but only {} bytes are available",
            input.len()
        )));
    }
    Ok(())
}

impl IntegerCodec for VarByte {
    fn name(&self) -> &'static str {
        "varbyte"
    }

    fn compress(&self, input: &[i32], out: &mut BytesMut) {
        out.reserve(input.len());
        for &value in input {
            put_var_byte(out, value.cast_unsigned());
        }
    }

    fn decompress(&self, input: &[u8], count: usize, out: &mut Vec<i32>) -> Result<usize> {
        check_count(input, count)?;
        out.reserve(count);
        let mut pos = 0;
        for _ in 0..count {
            out.push(get_var_byte(input, &mut pos)?.cast_signed());
        }
        Ok(pos)
    }
}

impl IntegerCodec for DeltaVarByte {
    fn name(&self) -> &'static str {
        "delta-varbyte"
    }

    fn compress(&self, input: &[i32], out: &mut BytesMut) {
        out.reserve(input.len());
        let mut previous = 0i32;
        for (i, &value) in input.iter().enumerate() {
            let delta = if i == 0 {
                value
            } else {
                value.wrapping_sub(previous)
            };
            put_var_byte(out, delta.cast_unsigned());
            previous = value;
        }
    }

    fn decompress(&self, input: &[u8], count: usize, out: &mut Vec<i32>) -> Result<usize> {
        let start = out.len();
        let consumed = VAR_BYTE.decompress(input, count, out)?;

        // inclusive prefix sum, seeded with the first value
        let decoded = &mut out[start..];
        for i in 1..decoded.len() {
            decoded[i] = decoded[i].wrapping_add(decoded[i - 1]);
        }
        Ok(consumed)
    }
}
