//! Value-array segments: script locals and the evaluation stack.

use crate::address::{Address, SegmentId};
use crate::serialize::{self, FieldReader, FieldWriter, Syncable};

/// A script's local-variable frame.
///
/// The back-reference to the owning script exists so the collector can
/// report the root chain; the frame is destroyed together with its script.
#[derive(Debug, Clone, Default)]
pub struct LocalVariables {
    script: SegmentId,
    values: Vec<Address>,
}

impl LocalVariables {
    /// A frame of `count` zeroed values owned by script segment `script`.
    pub fn new(script: SegmentId, count: usize) -> Self {
        Self {
            script,
            values: vec![Address::NULL; count],
        }
    }

    /// Segment id of the owning script.
    pub fn script(&self) -> SegmentId {
        self.script
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for an empty frame.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The values.
    pub fn values(&self) -> &[Address] {
        &self.values
    }

    /// The values, mutably.
    pub fn values_mut(&mut self) -> &mut [Address] {
        &mut self.values
    }

    /// Grow or shrink to `count` values; new slots are zeroed.
    pub fn resize(&mut self, count: usize) {
        self.values.resize(count, Address::NULL);
    }
}

impl Syncable for LocalVariables {
    fn save(&self, out: &mut FieldWriter) {
        out.write_u16(self.script);
        out.write_seq(&self.values);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            script: input.read_u16()?,
            values: input.read_seq()?,
        })
    }
}

/// The evaluation stack.
///
/// Bounds are checked against capacity. How much of it is in use is the
/// interpreter's business.
#[derive(Debug, Clone, Default)]
pub struct DataStack {
    values: Vec<Address>,
}

impl DataStack {
    /// A stack of `capacity` zeroed values.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![Address::NULL; capacity],
        }
    }

    /// Number of values the stack can hold.
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// The values.
    pub fn values(&self) -> &[Address] {
        &self.values
    }

    /// The values, mutably.
    pub fn values_mut(&mut self) -> &mut [Address] {
        &mut self.values
    }
}

impl Syncable for DataStack {
    fn save(&self, out: &mut FieldWriter) {
        out.write_seq(&self.values);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            values: input.read_seq()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locals_resize_keeps_values() {
        let mut locals = LocalVariables::new(3, 2);
        locals.values_mut()[1] = Address::number(5);
        locals.resize(4);
        assert_eq!(locals.len(), 4);
        assert_eq!(locals.values()[1], Address::number(5));
        assert_eq!(locals.values()[3], Address::NULL);
        assert_eq!(locals.script(), 3);
    }

    #[test]
    fn test_stack_capacity() {
        let stack = DataStack::new(16);
        assert_eq!(stack.capacity(), 16);
        assert!(stack.values().iter().all(Address::is_null));
    }
}
