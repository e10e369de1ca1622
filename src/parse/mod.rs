//! Parsing primitives over segmented buffers.
//!
//! Everything here works on [`ReadableBuffer`](crate::ReadableBuffer) without flattening it: byte
//! searches run span by span and continue across segment boundaries, numbers are read in place
//! when they fit in the first span, and text decoding carries split UTF-8 sequences over.
mod primitives;
mod search;
mod text;

pub use primitives::Primitive;
pub use text::{DecodeError, Utf8Decoder};
