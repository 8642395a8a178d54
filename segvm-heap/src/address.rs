//! # Addresses
//!
//! The interpreter never holds native pointers. Every VM value that refers
//! to memory is an [`Address`]: a segment id plus an offset into that
//! segment. Segment id 0 is reserved, so an address with segment 0 is an
//! ordinary number and is never dereferenced.

use std::fmt;

use crate::serialize::{FieldReader, FieldWriter, SerializeError, Syncable};

/// Identifier of a segment in the heap directory.
pub type SegmentId = u16;

/// Segment id that marks an address as a plain number.
pub const NUMBER_SEGMENT: SegmentId = 0;

/// A VM value: either a plain number or a (segment, offset) reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    segment: SegmentId,
    offset: u32,
}

impl Address {
    /// The null value (number zero).
    pub const NULL: Address = Address {
        segment: NUMBER_SEGMENT,
        offset: 0,
    };

    /// Create an address.
    pub const fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Create a plain number.
    pub const fn number(value: u32) -> Self {
        Self {
            segment: NUMBER_SEGMENT,
            offset: value,
        }
    }

    /// The segment id.
    pub const fn segment(&self) -> SegmentId {
        self.segment
    }

    /// The offset within the segment.
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// True if this is a number rather than a reference.
    pub const fn is_number(&self) -> bool {
        self.segment == NUMBER_SEGMENT
    }

    /// True for the number zero.
    pub const fn is_null(&self) -> bool {
        self.segment == NUMBER_SEGMENT && self.offset == 0
    }

    /// Same segment, different offset.
    pub const fn with_offset(&self, offset: u32) -> Self {
        Self {
            segment: self.segment,
            offset,
        }
    }

    /// Move the offset by `delta`, wrapping like the VM's 32-bit arithmetic.
    pub const fn offset_by(&self, delta: i32) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset.wrapping_add_signed(delta),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Syncable for Address {
    fn save(&self, out: &mut FieldWriter) {
        out.write_u16(self.segment);
        out.write_u32(self.offset);
    }

    fn load(input: &mut FieldReader<'_>) -> Result<Self, SerializeError> {
        let segment = input.read_u16()?;
        let offset = input.read_u32()?;
        Ok(Self { segment, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_number_is_not_a_pointer() {
        assert!(Address::number(42).is_number());
        assert!(Address::NULL.is_null());
        assert!(!Address::new(1, 0).is_number());
        assert!(!Address::number(1).is_null());
    }

    #[test]
    fn test_with_offset_keeps_segment() {
        let addr = Address::new(5, 10).with_offset(2);
        assert_eq!(addr.segment(), 5);
        assert_eq!(addr.offset(), 2);
        assert_eq!(Address::new(5, 10).offset_by(-4).offset(), 6);
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new(0x12, 0x3a).to_string(), "0012:003a");
        assert_eq!(format!("{:?}", Address::NULL), "Address(0000:0000)");
    }

    #[test]
    fn test_hash_and_eq() {
        let mut set = HashSet::new();
        set.insert(Address::new(1, 2));
        set.insert(Address::new(1, 2));
        set.insert(Address::new(2, 1));
        assert_eq!(set.len(), 2);
    }
}
