//! # Index Mapper
//!
//! Maps arbitrary integer keys (script byte offsets, in practice) to dense
//! small indices. Lookup hashes on the low 8 bits of the key into one of
//! 256 bucket chains. Removing a key parks its node on a hole list; the
//! next insertion of a new key takes the most recently parked node and
//! inherits its index, so indices stay dense without renumbering.

use tracing::error;

use crate::error::MemoryError;
use crate::serialize::{self, FieldReader, FieldWriter, Syncable};

/// Number of bucket chains.
pub const BUCKET_COUNT: usize = 256;

#[derive(Debug, Clone)]
struct Node {
    key: i32,
    index: u32,
    next: Option<usize>,
}

/// Bucketed map from integer keys to reusable dense indices.
#[derive(Debug, Clone)]
pub struct IndexMapper {
    nodes: Vec<Node>,
    buckets: Box<[Option<usize>; BUCKET_COUNT]>,
    holes: Option<usize>,
    counter: u32,
    len: usize,
}

#[inline]
fn bucket_of(key: i32) -> usize {
    (key as u32 & 0xff) as usize
}

impl IndexMapper {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            buckets: Box::new([None; BUCKET_COUNT]),
            holes: None,
            counter: 0,
            len: 0,
        }
    }

    fn find(&self, key: i32) -> Option<usize> {
        let mut cursor = self.buckets[bucket_of(key)];
        while let Some(n) = cursor {
            let node = &self.nodes[n];
            if node.key == key {
                return Some(n);
            }
            cursor = node.next;
        }
        None
    }

    /// Look up `key`, inserting it when missing and `add_if_missing` is set.
    ///
    /// A fresh key reuses the most recently released index if there is
    /// one, otherwise it takes the next counter value. Returns `None` for a
    /// fresh key once the counter is exhausted.
    pub fn check_key(&mut self, key: i32, add_if_missing: bool) -> Option<u32> {
        if let Some(n) = self.find(key) {
            return Some(self.nodes[n].index);
        }
        if !add_if_missing {
            return None;
        }

        let bucket = bucket_of(key);
        let head = self.buckets[bucket];
        let n = match self.holes {
            Some(hole) => {
                self.holes = self.nodes[hole].next;
                let node = &mut self.nodes[hole];
                node.key = key;
                node.next = head;
                hole
            }
            None => {
                let index = self.counter;
                self.counter = index.checked_add(1)?;
                self.nodes.push(Node {
                    key,
                    index,
                    next: head,
                });
                self.nodes.len() - 1
            }
        };
        self.buckets[bucket] = Some(n);
        self.len += 1;
        Some(self.nodes[n].index)
    }

    /// Look up `key` without inserting.
    pub fn lookup_key(&self, key: i32) -> Option<u32> {
        self.find(key).map(|n| self.nodes[n].index)
    }

    /// Remove `key` and return the index it held.
    pub fn remove_key(&mut self, key: i32) -> Option<u32> {
        let bucket = bucket_of(key);
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(n) = cursor {
            if self.nodes[n].key == key {
                let next = self.nodes[n].next;
                match prev {
                    Some(p) => self.nodes[p].next = next,
                    None => self.buckets[bucket] = next,
                }
                self.nodes[n].next = self.holes;
                self.holes = Some(n);
                self.len -= 1;
                return Some(self.nodes[n].index);
            }
            prev = cursor;
            cursor = self.nodes[n].next;
        }
        None
    }

    /// Insert a `(key, index)` pair verbatim, as during restore.
    ///
    /// Duplicate keys are rejected rather than merged.
    pub fn insert_exact(&mut self, key: i32, index: u32) -> Result<(), MemoryError> {
        if self.find(key).is_some() {
            error!(key, "duplicate key while restoring index mapper");
            return Err(MemoryError::InvalidKey { key });
        }
        let bucket = bucket_of(key);
        self.nodes.push(Node {
            key,
            index,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(self.nodes.len() - 1);
        self.counter = self.counter.max(index.saturating_add(1));
        self.len += 1;
        Ok(())
    }

    /// Drop every key, holes included, and reset the counter.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Iterate over live `(key, index)` pairs in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, u32)> + '_ {
        self.buckets.iter().flat_map(move |head| {
            let mut cursor = *head;
            std::iter::from_fn(move || {
                let n = cursor?;
                let node = &self.nodes[n];
                cursor = node.next;
                Some((node.key, node.index))
            })
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no key is mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The next index a fresh key gets when no hole is available.
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl Default for IndexMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Syncable for IndexMapper {
    fn save(&self, out: &mut FieldWriter) {
        out.write_len(self.len);
        for (key, index) in self.iter() {
            out.write_i32(key);
            out.write_u32(index);
        }
        out.write_u32(self.counter);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let mut mapper = IndexMapper::new();
        let len = input.read_len()?;
        for _ in 0..len {
            let key = input.read_i32()?;
            let index = input.read_u32()?;
            mapper.insert_exact(key, index)?;
        }
        mapper.counter = mapper.counter.max(input.read_u32()?);
        Ok(mapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{FieldStream, SerializeError};

    #[test]
    fn test_hole_reuse() {
        let mut m = IndexMapper::new();
        assert_eq!(m.check_key(5, true), Some(0));
        assert_eq!(m.check_key(9, true), Some(1));
        assert_eq!(m.remove_key(5), Some(0));
        assert_eq!(m.check_key(5, true), Some(0));
        assert_eq!(m.check_key(9, false), Some(1));
    }

    #[test]
    fn test_missing_key() {
        let mut m = IndexMapper::new();
        assert_eq!(m.check_key(3, false), None);
        assert_eq!(m.lookup_key(3), None);
        assert_eq!(m.remove_key(3), None);
        assert!(m.is_empty());
    }

    #[test]
    fn test_bucket_collisions() {
        let mut m = IndexMapper::new();
        // Same low byte, different keys.
        let keys = [0x10, 0x110, 0x210, -0xf0];
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(m.check_key(*k, true), Some(i as u32));
        }
        assert_eq!(m.remove_key(0x110), Some(1));
        assert_eq!(m.lookup_key(0x10), Some(0));
        assert_eq!(m.lookup_key(0x210), Some(2));
        assert_eq!(m.lookup_key(-0xf0), Some(3));
        assert_eq!(m.lookup_key(0x110), None);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_holes_are_lifo() {
        let mut m = IndexMapper::new();
        for k in 0..4 {
            m.check_key(k * 2, true);
        }
        m.remove_key(0);
        m.remove_key(4);
        assert_eq!(m.check_key(100, true), Some(2));
        assert_eq!(m.check_key(101, true), Some(0));
        assert_eq!(m.check_key(102, true), Some(4));
        assert_eq!(m.counter(), 5);
    }

    #[test]
    fn test_save_restore_preserves_indices() {
        let mut m = IndexMapper::new();
        for k in [12, 40, 7, 300] {
            m.check_key(k, true);
        }
        m.remove_key(40);

        let restored: IndexMapper = FieldStream::capture(&m).restore().unwrap();
        for k in [12, 7, 300, 40] {
            assert_eq!(restored.lookup_key(k), m.lookup_key(k));
        }
        assert_eq!(restored.counter(), 4);
    }

    #[test]
    fn test_restore_rejects_duplicate_key() {
        let mut w = FieldWriter::new();
        w.write_len(2);
        w.write_i32(8);
        w.write_u32(0);
        w.write_i32(8);
        w.write_u32(1);
        w.write_u32(2);
        let err = w.finish().restore::<IndexMapper>().unwrap_err();
        assert_eq!(err, SerializeError::Memory(MemoryError::InvalidKey { key: 8 }));
    }

    #[test]
    fn test_restore_with_top_index() {
        let mut w = FieldWriter::new();
        w.write_len(1);
        w.write_i32(3);
        w.write_u32(u32::MAX);
        w.write_u32(0);
        let mut m = w.finish().restore::<IndexMapper>().unwrap();
        assert_eq!(m.lookup_key(3), Some(u32::MAX));
        assert_eq!(m.counter(), u32::MAX);

        // No index left for a fresh key; holes still work.
        assert_eq!(m.check_key(4, true), None);
        assert_eq!(m.lookup_key(4), None);
        assert_eq!(m.remove_key(3), Some(u32::MAX));
        assert_eq!(m.check_key(4, true), Some(u32::MAX));
    }
}
