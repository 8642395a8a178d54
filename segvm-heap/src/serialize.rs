//! Save-Game Field Stream
//!
//! Saved state is an ordered sequence of primitive-typed fields. The heap
//! and every live segment write themselves into a [`FieldWriter`] and read
//! themselves back from a [`FieldReader`] in the same order.
//!
//! # Design
//!
//! - [`Field`] is the intermediate representation; every primitive write
//!   produces exactly one field.
//! - Sequences are framed by [`Field::Len`], a variant no primitive write
//!   produces. A reader therefore never mistakes a payload value for the
//!   framing marker.
//! - [`FieldStream`] is serde-serializable so the outer save-game layer can
//!   store it in whatever container it likes (JSON helpers are provided).
//!
//! # Example
//!
//! ```rust,ignore
//! use segvm_heap::serialize::{FieldStream, Syncable};
//!
//! let stream = FieldStream::capture(&heap);
//! let json = stream.to_json()?;
//! let restored: Heap = FieldStream::from_json(&json)?.restore()?;
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MemoryError;

// ============================================================================
// FIELD TYPE
// ============================================================================

/// A single primitive-typed field in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned byte.
    U8(u8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 32-bit integer.
    I32(i32),
    /// UTF-8 string.
    Str(String),
    /// Raw byte buffer.
    Bytes(Vec<u8>),
    /// Sequence framing: the number of elements that follow.
    Len(u32),
}

impl Field {
    /// Name of the field's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Field::Bool(_) => "bool",
            Field::U8(_) => "u8",
            Field::U16(_) => "u16",
            Field::U32(_) => "u32",
            Field::I32(_) => "i32",
            Field::Str(_) => "string",
            Field::Bytes(_) => "bytes",
            Field::Len(_) => "length",
        }
    }
}

// ============================================================================
// SERIALIZATION ERROR
// ============================================================================

/// Error raised while restoring saved state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializeError {
    /// The stream ended before the value was complete.
    #[error("unexpected end of field stream")]
    UnexpectedEof,

    /// The next field has a different type than expected.
    #[error("type mismatch at field {position}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type.
        expected: &'static str,
        /// Actual type found.
        found: &'static str,
        /// Index of the field in the stream.
        position: usize,
    },

    /// A field decoded but holds an impossible value.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// Description of the issue.
        message: String,
    },

    /// Restored state violates a heap invariant.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The outer JSON container could not be parsed or produced.
    #[error("json: {0}")]
    Json(String),
}

impl From<serde_json::Error> for SerializeError {
    fn from(e: serde_json::Error) -> Self {
        SerializeError::Json(e.to_string())
    }
}

/// Result type for save/restore operations.
pub type Result<T> = std::result::Result<T, SerializeError>;

// ============================================================================
// SYNCABLE TRAIT
// ============================================================================

/// Types that can be written to and restored from a field stream.
pub trait Syncable: Sized {
    /// Append this value's fields to the writer.
    fn save(&self, out: &mut FieldWriter);

    /// Read a value written by [`Syncable::save`].
    fn load(input: &mut FieldReader<'_>) -> Result<Self>;
}

// ============================================================================
// STREAM, WRITER, READER
// ============================================================================

/// An ordered sequence of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStream {
    fields: Vec<Field>,
}

impl FieldStream {
    /// Serialize a value into a fresh stream.
    pub fn capture<T: Syncable>(value: &T) -> Self {
        let mut writer = FieldWriter::new();
        value.save(&mut writer);
        writer.finish()
    }

    /// Restore a value from the start of the stream.
    ///
    /// Trailing fields are an error: a stream holds exactly one value.
    pub fn restore<T: Syncable>(&self) -> Result<T> {
        let mut reader = self.reader();
        let value = T::load(&mut reader)?;
        if !reader.is_at_end() {
            return Err(SerializeError::InvalidValue {
                message: format!("{} trailing fields", reader.remaining()),
            });
        }
        Ok(value)
    }

    /// A reader positioned at the first field.
    pub fn reader(&self) -> FieldReader<'_> {
        FieldReader {
            fields: &self.fields,
            position: 0,
        }
    }

    /// The fields in order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the stream holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Appends fields to a stream.
#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<Field>,
}

impl FieldWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a boolean.
    pub fn write_bool(&mut self, v: bool) {
        self.fields.push(Field::Bool(v));
    }

    /// Write a byte.
    pub fn write_u8(&mut self, v: u8) {
        self.fields.push(Field::U8(v));
    }

    /// Write a 16-bit unsigned integer.
    pub fn write_u16(&mut self, v: u16) {
        self.fields.push(Field::U16(v));
    }

    /// Write a 32-bit unsigned integer.
    pub fn write_u32(&mut self, v: u32) {
        self.fields.push(Field::U32(v));
    }

    /// Write a 32-bit signed integer.
    pub fn write_i32(&mut self, v: i32) {
        self.fields.push(Field::I32(v));
    }

    /// Write a string.
    pub fn write_str(&mut self, v: &str) {
        self.fields.push(Field::Str(v.to_string()));
    }

    /// Write a byte buffer.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.fields.push(Field::Bytes(v.to_vec()));
    }

    /// Write the framing marker for a sequence of `len` elements.
    pub fn write_len(&mut self, len: usize) {
        self.fields.push(Field::Len(len as u32));
    }

    /// Write a framed sequence of values.
    pub fn write_seq<T: Syncable>(&mut self, items: &[T]) {
        self.write_len(items.len());
        for item in items {
            item.save(self);
        }
    }

    /// Write an optional value as a presence flag plus payload.
    pub fn write_option<T: Syncable>(&mut self, value: Option<&T>) {
        self.write_bool(value.is_some());
        if let Some(v) = value {
            v.save(self);
        }
    }

    /// Consume the writer.
    pub fn finish(self) -> FieldStream {
        FieldStream {
            fields: self.fields,
        }
    }
}

/// Reads fields from a stream in order.
#[derive(Debug)]
pub struct FieldReader<'a> {
    fields: &'a [Field],
    position: usize,
}

macro_rules! read_primitive {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        #[doc = concat!("Read a `", $label, "` field.")]
        pub fn $name(&mut self) -> Result<$ty> {
            match self.next()? {
                Field::$variant(v) => Ok(v.clone()),
                other => Err(self.mismatch($label, other)),
            }
        }
    };
}

impl<'a> FieldReader<'a> {
    fn next(&mut self) -> Result<&'a Field> {
        let field = self
            .fields
            .get(self.position)
            .ok_or(SerializeError::UnexpectedEof)?;
        self.position += 1;
        Ok(field)
    }

    fn mismatch(&self, expected: &'static str, found: &Field) -> SerializeError {
        SerializeError::TypeMismatch {
            expected,
            found: found.type_name(),
            position: self.position - 1,
        }
    }

    read_primitive!(read_bool, Bool, bool, "bool");
    read_primitive!(read_u8, U8, u8, "u8");
    read_primitive!(read_u16, U16, u16, "u16");
    read_primitive!(read_u32, U32, u32, "u32");
    read_primitive!(read_i32, I32, i32, "i32");
    read_primitive!(read_str, Str, String, "string");
    read_primitive!(read_bytes, Bytes, Vec<u8>, "bytes");

    /// Read a sequence framing marker.
    pub fn read_len(&mut self) -> Result<usize> {
        match self.next()? {
            Field::Len(n) => Ok(*n as usize),
            other => Err(self.mismatch("length", other)),
        }
    }

    /// Read a framed sequence written by [`FieldWriter::write_seq`].
    pub fn read_seq<T: Syncable>(&mut self) -> Result<Vec<T>> {
        let len = self.read_len()?;
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(T::load(self)?);
        }
        Ok(items)
    }

    /// Read a value written by [`FieldWriter::write_option`].
    pub fn read_option<T: Syncable>(&mut self) -> Result<Option<T>> {
        if self.read_bool()? {
            Ok(Some(T::load(self)?))
        } else {
            Ok(None)
        }
    }

    /// Fields not yet consumed.
    pub fn remaining(&self) -> usize {
        self.fields.len() - self.position
    }

    /// True once every field has been read.
    pub fn is_at_end(&self) -> bool {
        self.position >= self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_in_order() {
        let mut w = FieldWriter::new();
        w.write_bool(true);
        w.write_u16(0xbeef);
        w.write_i32(-7);
        w.write_str("save");
        w.write_bytes(&[1, 2, 3]);
        let stream = w.finish();
        assert_eq!(stream.len(), 5);

        let mut r = stream.reader();
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16().unwrap(), 0xbeef);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_str().unwrap(), "save");
        assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3]);
        assert!(r.is_at_end());
    }

    #[test]
    fn test_type_mismatch_reports_position() {
        let mut w = FieldWriter::new();
        w.write_u8(1);
        w.write_u32(2);
        let stream = w.finish();

        let mut r = stream.reader();
        r.read_u8().unwrap();
        let err = r.read_i32().unwrap_err();
        assert_eq!(
            err,
            SerializeError::TypeMismatch {
                expected: "i32",
                found: "u32",
                position: 1,
            }
        );
    }

    #[test]
    fn test_eof() {
        let stream = FieldStream::default();
        assert_eq!(stream.reader().read_u8(), Err(SerializeError::UnexpectedEof));
    }

    #[test]
    fn test_length_marker_is_distinct_from_payload() {
        let mut w = FieldWriter::new();
        w.write_u32(3);
        let stream = w.finish();
        assert!(matches!(
            stream.reader().read_len(),
            Err(SerializeError::TypeMismatch { expected: "length", .. })
        ));
    }

    #[test]
    fn test_json_container() {
        let mut w = FieldWriter::new();
        w.write_len(2);
        w.write_i32(i32::MIN);
        w.write_str("x");
        let stream = w.finish();

        let json = stream.to_json().unwrap();
        let back = FieldStream::from_json(&json).unwrap();
        assert_eq!(back, stream);
        assert!(FieldStream::from_json("not json").is_err());
    }
}
