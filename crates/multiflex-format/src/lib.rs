//! Multiflex Format - Chunk and descriptor encoding
//!
//! This crate implements the binary formats stored in a Multiflex container:
//! - Headless integer codecs (var-byte, delta var-byte)
//! - Field encoding per track encoding
//! - Track descriptors and their compact encoding
//! - Chunks with a lazily decoded offset/length index

pub mod chunk;
pub mod codec;
pub mod descriptor;
pub mod field;

pub use chunk::{Chunk, ChunkBuilder};
pub use codec::{DELTA_VAR_BYTE, DeltaVarByte, IntegerCodec, VAR_BYTE, VarByte, codec_for};
pub use descriptor::{Descriptor, DescriptorBuilder, Track};
pub use field::{FieldKind, FieldValue};
