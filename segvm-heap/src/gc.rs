//! # Collector Hooks
//!
//! The mark-and-sweep collector lives outside this crate. It sees the heap
//! only through [`GcHooks`], which lets it enumerate candidates, follow
//! references and free garbage without knowing any segment kind.
//!
//! A collection pass runs to completion before the interpreter resumes; no
//! allocation, free or relocation may happen between the enumeration calls
//! of one pass.
//!
//! # Example
//!
//! ```rust,ignore
//! use segvm_heap::gc::GcHooks;
//!
//! fn sweep<H: GcHooks>(heap: &mut H, reachable: &HashSet<Address>) -> Result<()> {
//!     let mut garbage = Vec::new();
//!     for id in heap.segment_ids() {
//!         heap.list_all_deallocatable(id, &mut |addr| {
//!             if !reachable.contains(&addr) {
//!                 garbage.push(addr);
//!             }
//!         })?;
//!     }
//!     for addr in garbage {
//!         heap.free_at_address(addr)?;
//!     }
//!     Ok(())
//! }
//! ```

use tracing::trace;

use crate::address::{Address, SegmentId};
use crate::error::Result;
use crate::heap::Heap;
use crate::segment::Reclaim;

/// Enumeration and teardown entry points for an external collector.
pub trait GcHooks {
    /// Ids of every live segment.
    fn segment_ids(&self) -> Vec<SegmentId>;

    /// Emit every independently destroyable address in `segment`.
    fn list_all_deallocatable(&self, segment: SegmentId, emit: &mut dyn FnMut(Address)) -> Result<()>;

    /// Emit every address reachable from `addr` in one hop. Plain numbers
    /// are never emitted.
    fn list_outgoing_references(&self, addr: Address, emit: &mut dyn FnMut(Address)) -> Result<()>;

    /// The address that governs `addr` for deallocation.
    fn find_canonic_address(&self, addr: Address) -> Result<Address>;

    /// Tear down the object at `addr`, which must be canonic.
    fn free_at_address(&mut self, addr: Address) -> Result<Reclaim>;
}

impl GcHooks for Heap {
    fn segment_ids(&self) -> Vec<SegmentId> {
        Heap::segment_ids(self).collect()
    }

    fn list_all_deallocatable(&self, segment: SegmentId, emit: &mut dyn FnMut(Address)) -> Result<()> {
        self.segment(segment)?.list_all_deallocatable(segment, emit);
        Ok(())
    }

    fn list_outgoing_references(&self, addr: Address, emit: &mut dyn FnMut(Address)) -> Result<()> {
        self.segment(addr.segment())?.list_outgoing_references(addr, emit);
        Ok(())
    }

    fn find_canonic_address(&self, addr: Address) -> Result<Address> {
        Ok(self.segment(addr.segment())?.find_canonic_address(addr))
    }

    fn free_at_address(&mut self, addr: Address) -> Result<Reclaim> {
        trace!(%addr, "collector freeing");
        self.free(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::segment::ProgramImage;

    fn outgoing(heap: &Heap, addr: Address) -> Vec<Address> {
        let mut out = Vec::new();
        GcHooks::list_outgoing_references(heap, addr, &mut |a| out.push(a)).unwrap();
        out
    }

    #[test]
    fn test_list_outgoing() {
        let mut heap = Heap::default();
        let a = heap.allocate_node(Address::number(1), Address::NULL).unwrap();
        let b = heap.allocate_node(Address::number(2), Address::NULL).unwrap();
        let list = heap.allocate_list().unwrap();
        *heap.lookup_list_mut(list).unwrap() = crate::segment::List { first: a, last: b };

        assert_eq!(outgoing(&heap, list), vec![a, b]);
    }

    #[test]
    fn test_clone_reaches_script_locals() {
        let mut heap = Heap::default();
        let script = heap.load_script(1, ProgramImage::from_bytes(vec![0; 16])).unwrap();
        let locals = heap.allocate_locals(script, 1).unwrap();
        let obj = heap.init_object(script, 4, 1, 0).unwrap();
        let clone = heap.clone_object(obj).unwrap();

        assert_eq!(outgoing(&heap, clone), vec![Address::new(locals, 0)]);
        assert_eq!(
            heap.find_canonic_address(Address::new(locals, 0)).unwrap(),
            Address::new(script, 0)
        );
    }

    #[test]
    fn test_hooks_reject_dead_segments() {
        let heap = Heap::default();
        let mut out = Vec::new();
        assert_eq!(
            GcHooks::list_all_deallocatable(&heap, 4, &mut |a| out.push(a)),
            Err(MemoryError::InvalidSegment { segment: 4 })
        );
        assert!(out.is_empty());
        assert!(GcHooks::segment_ids(&heap).is_empty());
    }
}
