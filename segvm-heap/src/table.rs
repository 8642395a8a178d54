//! # Slot Table
//!
//! Dense store of same-kind records with stable indices. Freed slots go
//! onto a free list and are handed out again by later allocations; the
//! backing vector never shrinks, so an index stays meaningful until that
//! exact slot is freed.
//!
//! Every slot carries a link. A live slot links to itself; a free slot
//! links to the next free slot (or to [`END_OF_CHAIN`]). The head of the
//! free list is an `Option<u32>` index, never a pointer.

use tracing::{error, trace};

use crate::error::{MemoryError, Result};
use crate::serialize::{self, FieldReader, FieldWriter, Syncable};

/// Link value of the last slot on the free list.
pub const END_OF_CHAIN: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Slot<T> {
    link: u32,
    value: Option<T>,
}

/// Free-list-backed table of records addressed by small integers.
#[derive(Debug, Clone)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    first_free: Option<u32>,
    entries_used: u32,
}

impl<T> SlotTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            first_free: None,
            entries_used: 0,
        }
    }

    /// Store `value` in a free slot and return its index.
    pub fn allocate_with(&mut self, value: T) -> u32 {
        self.entries_used += 1;
        match self.first_free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.first_free = (slot.link != END_OF_CHAIN).then_some(slot.link);
                slot.link = index;
                slot.value = Some(value);
                trace!(index, "reused table slot");
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    link: index,
                    value: Some(value),
                });
                trace!(index, "appended table slot");
                index
            }
        }
    }

    /// Release the slot at `index` and return its value.
    ///
    /// Freeing a slot that is already free (or was never allocated) leaves
    /// the table untouched and reports [`MemoryError::DoubleFree`].
    pub fn free(&mut self, index: u32) -> Result<T> {
        if !self.is_valid(index) {
            error!(index, "attempt to free a slot that is not allocated");
            return Err(MemoryError::DoubleFree { index });
        }
        let slot = &mut self.slots[index as usize];
        slot.link = self.first_free.unwrap_or(END_OF_CHAIN);
        self.first_free = Some(index);
        self.entries_used -= 1;
        slot.value.take().ok_or(MemoryError::DoubleFree { index })
    }

    /// True if `index` names a currently allocated slot.
    pub fn is_valid(&self, index: u32) -> bool {
        self.slots
            .get(index as usize)
            .is_some_and(|slot| slot.link == index)
    }

    /// The value at `index`, if allocated.
    pub fn get(&self, index: u32) -> Option<&T> {
        if !self.is_valid(index) {
            return None;
        }
        self.slots[index as usize].value.as_ref()
    }

    /// Mutable access to the value at `index`, if allocated.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        if !self.is_valid(index) {
            return None;
        }
        self.slots[index as usize].value.as_mut()
    }

    /// Visit every allocated slot in index order.
    pub fn for_each_valid(&self, mut f: impl FnMut(u32, &T)) {
        for (index, value) in self.iter_valid() {
            f(index, value);
        }
    }

    /// Iterate over allocated slots in index order.
    pub fn iter_valid(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let index = i as u32;
            match &slot.value {
                Some(value) if slot.link == index => Some((index, value)),
                _ => None,
            }
        })
    }

    /// Number of allocated slots.
    pub fn entries_used(&self) -> u32 {
        self.entries_used
    }

    /// Size of the backing store, free slots included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot was ever allocated.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T: Default> SlotTable<T> {
    /// Allocate a slot holding `T::default()`.
    pub fn allocate(&mut self) -> u32 {
        self.allocate_with(T::default())
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The free chain is stored verbatim so restored tables hand out the same
// indices in the same order as the saved one would have.
impl<T: Syncable> Syncable for SlotTable<T> {
    fn save(&self, out: &mut FieldWriter) {
        out.write_len(self.slots.len());
        out.write_u32(self.first_free.unwrap_or(END_OF_CHAIN));
        for slot in &self.slots {
            out.write_u32(slot.link);
            out.write_option(slot.value.as_ref());
        }
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let len = input.read_len()?;
        let first_free = match input.read_u32()? {
            END_OF_CHAIN => None,
            index => Some(index),
        };
        let mut slots = Vec::with_capacity(len.min(input.remaining()));
        let mut entries_used = 0;
        for index in 0..len as u32 {
            let link = input.read_u32()?;
            let value = input.read_option::<T>()?;
            if (link == index) != value.is_some() {
                return Err(serialize::SerializeError::InvalidValue {
                    message: format!("slot {index} link disagrees with its contents"),
                });
            }
            if value.is_some() {
                entries_used += 1;
            }
            slots.push(Slot { link, value });
        }
        check_free_chain(&slots, first_free, len - entries_used as usize)?;
        Ok(Self {
            slots,
            first_free,
            entries_used,
        })
    }
}

/// Walk the free list from `head`: every link must name a free slot in
/// range, each at most once, and the walk must cover all `free` slots.
fn check_free_chain<T>(slots: &[Slot<T>], head: Option<u32>, free: usize) -> serialize::Result<()> {
    let invalid = |message: String| serialize::SerializeError::InvalidValue { message };
    let mut seen = vec![false; slots.len()];
    let mut cursor = head;
    let mut walked = 0;
    while let Some(index) = cursor {
        let slot = slots
            .get(index as usize)
            .ok_or_else(|| invalid(format!("free chain links past the end to slot {index}")))?;
        if slot.value.is_some() {
            return Err(invalid(format!("free chain reaches live slot {index}")));
        }
        if std::mem::replace(&mut seen[index as usize], true) {
            return Err(invalid(format!("free chain loops at slot {index}")));
        }
        walked += 1;
        cursor = (slot.link != END_OF_CHAIN).then_some(slot.link);
    }
    if walked != free {
        return Err(invalid(format!(
            "free chain holds {walked} of {free} free slots"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::FieldStream;

    impl Syncable for u32 {
        fn save(&self, out: &mut FieldWriter) {
            out.write_u32(*self);
        }

        fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
            input.read_u32()
        }
    }

    #[test]
    fn test_allocate_appends() {
        let mut table: SlotTable<u32> = SlotTable::new();
        assert_eq!(table.allocate_with(10), 0);
        assert_eq!(table.allocate_with(11), 1);
        assert_eq!(table.entries_used(), 2);
        assert!(table.is_valid(0));
        assert!(table.is_valid(1));
        assert!(!table.is_valid(2));
    }

    #[test]
    fn test_free_then_reuse_lifo() {
        let mut table: SlotTable<u32> = SlotTable::new();
        for i in 0..4 {
            table.allocate_with(i);
        }
        assert_eq!(table.free(1).unwrap(), 1);
        assert_eq!(table.free(3).unwrap(), 3);
        assert!(!table.is_valid(1));
        assert_eq!(table.entries_used(), 2);

        assert_eq!(table.allocate_with(30), 3);
        assert_eq!(table.allocate_with(10), 1);
        assert_eq!(table.allocate_with(40), 4);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_double_free_is_rejected_without_corruption() {
        let mut table: SlotTable<u32> = SlotTable::new();
        table.allocate_with(1);
        table.allocate_with(2);
        table.free(0).unwrap();

        assert_eq!(table.free(0), Err(MemoryError::DoubleFree { index: 0 }));
        assert_eq!(table.free(9), Err(MemoryError::DoubleFree { index: 9 }));

        // The chain still holds exactly one free slot.
        assert_eq!(table.allocate_with(5), 0);
        assert_eq!(table.allocate_with(6), 2);
        assert_eq!(table.entries_used(), 3);
    }

    #[test]
    fn test_free_keeps_neighbours() {
        let mut table: SlotTable<u32> = SlotTable::new();
        for i in 0..3 {
            table.allocate_with(i * 100);
        }
        table.free(1).unwrap();
        assert_eq!(table.get(0), Some(&0));
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(2), Some(&200));
    }

    #[test]
    fn test_iter_valid_skips_free() {
        let mut table: SlotTable<u32> = SlotTable::new();
        for i in 0..5 {
            table.allocate_with(i);
        }
        table.free(0).unwrap();
        table.free(3).unwrap();
        let live: Vec<u32> = table.iter_valid().map(|(i, _)| i).collect();
        assert_eq!(live, vec![1, 2, 4]);

        let mut visited = Vec::new();
        table.for_each_valid(|i, v| visited.push((i, *v)));
        assert_eq!(visited, vec![(1, 1), (2, 2), (4, 4)]);
    }

    #[test]
    fn test_save_restore_preserves_free_chain() {
        let mut table: SlotTable<u32> = SlotTable::new();
        for i in 0..5 {
            table.allocate_with(i);
        }
        table.free(2).unwrap();
        table.free(4).unwrap();

        let mut restored: SlotTable<u32> = FieldStream::capture(&table).restore().unwrap();
        assert_eq!(restored.entries_used(), 3);
        assert!(!restored.is_valid(2));
        assert_eq!(restored.get(3), Some(&3));
        assert_eq!(restored.allocate_with(9), 4);
        assert_eq!(restored.allocate_with(9), 2);
    }

    fn corrupt_stream(head: u32, slots: &[(u32, Option<u32>)]) -> FieldStream {
        let mut out = FieldWriter::new();
        out.write_len(slots.len());
        out.write_u32(head);
        for (link, value) in slots {
            out.write_u32(*link);
            out.write_option(value.as_ref());
        }
        out.finish()
    }

    #[test]
    fn test_load_rejects_broken_free_chain() {
        // Head names a live slot.
        let stream = corrupt_stream(0, &[(0, Some(111)), (END_OF_CHAIN, None)]);
        assert!(stream.restore::<SlotTable<u32>>().is_err());

        // A free link names a live slot.
        let stream = corrupt_stream(1, &[(0, Some(111)), (0, None)]);
        assert!(stream.restore::<SlotTable<u32>>().is_err());

        // Head past the end.
        let stream = corrupt_stream(5, &[(0, Some(1)), (END_OF_CHAIN, None)]);
        assert!(stream.restore::<SlotTable<u32>>().is_err());

        // Two free slots linking to each other.
        let stream = corrupt_stream(1, &[(2, None), (2, None), (1, None)]);
        assert!(stream.restore::<SlotTable<u32>>().is_err());

        // A free slot unreachable from the head.
        let stream = corrupt_stream(END_OF_CHAIN, &[(0, Some(1)), (END_OF_CHAIN, None)]);
        assert!(stream.restore::<SlotTable<u32>>().is_err());

        let stream = corrupt_stream(1, &[(0, Some(111)), (END_OF_CHAIN, None)]);
        let mut table: SlotTable<u32> = stream.restore().unwrap();
        assert_eq!(table.allocate_with(2), 1);
        assert_eq!(table.get(0), Some(&111));
    }
}
