//! End-to-end tests: the interpreter-facing address API, a mark-and-sweep
//! pass driven purely through `GcHooks`, and save/restore through JSON.

use std::collections::HashSet;

use segvm_heap::{
    Address, FieldStream, GcHooks, Heap, HeapConfig, IndexMapper, List, MemoryError,
    ProgramImage, Reclaim, SegmentKind,
};

/// Mark everything reachable from `roots`, then free every deallocatable
/// address that was not marked. Returns the freed addresses.
fn collect_garbage<H: GcHooks>(heap: &mut H, roots: &[Address]) -> Vec<Address> {
    let mut reachable = HashSet::new();
    let mut work = roots.to_vec();
    while let Some(addr) = work.pop() {
        if !reachable.insert(addr) {
            continue;
        }
        if let Ok(canonic) = heap.find_canonic_address(addr) {
            work.push(canonic);
        }
        // References into dead segments are simply not followed.
        let _ = heap.list_outgoing_references(addr, &mut |next| work.push(next));
    }

    let mut garbage = Vec::new();
    for id in GcHooks::segment_ids(heap) {
        heap.list_all_deallocatable(id, &mut |addr| {
            if !reachable.contains(&addr) {
                garbage.push(addr);
            }
        })
        .unwrap();
    }
    for &addr in &garbage {
        heap.free_at_address(addr).unwrap();
    }
    garbage
}

fn image(size: usize) -> ProgramImage {
    ProgramImage::from_bytes(vec![0; size])
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn node_lists_its_references_in_order() {
    let mut heap = Heap::default();
    let node = heap.allocate(SegmentKind::Nodes).unwrap();
    let (a, b, c, d) = (
        Address::new(7, 1),
        Address::new(7, 2),
        Address::new(8, 0),
        Address::new(9, 0x20),
    );
    {
        let entry = heap.lookup_node_mut(node).unwrap();
        entry.pred = a;
        entry.succ = b;
        entry.key = c;
        entry.value = d;
    }

    let mut out = Vec::new();
    heap.list_outgoing_references(node, &mut |addr| out.push(addr))
        .unwrap();
    assert_eq!(out, vec![a, b, c, d]);
}

#[test]
fn dynmem_blob_bounds_and_free() {
    let mut heap = Heap::default();
    let blob = heap.allocate_dynmem(16, "buf").unwrap();

    assert_eq!(heap.dereference(blob).unwrap().len(), 16);
    assert_eq!(
        heap.dereference(blob.with_offset(16)).unwrap_err(),
        MemoryError::OutOfRange {
            address: blob.with_offset(16),
            extent: 16,
        }
    );
    assert_eq!(heap.get_description(blob).unwrap(), "buf");

    assert_eq!(heap.free_at_address(blob).unwrap(), Reclaim::Segment);
    assert!(!heap.is_valid(blob));
    assert!(heap.get_description(blob).is_err());
}

#[test]
fn index_mapper_reuses_hole() {
    let mut mapper = IndexMapper::new();
    assert_eq!(mapper.check_key(5, true), Some(0));
    assert_eq!(mapper.check_key(9, true), Some(1));
    assert_eq!(mapper.remove_key(5), Some(0));
    assert_eq!(mapper.check_key(5, true), Some(0));
    assert_eq!(mapper.check_key(9, false), Some(1));
}

// ============================================================================
// Collector
// ============================================================================

#[test]
fn mark_and_sweep_frees_only_unreachable() {
    let mut heap = Heap::default();
    let script = heap.load_script(1, image(32)).unwrap();
    let locals = heap.allocate_locals(script, 2).unwrap();
    let obj = heap.init_object(script, 4, 2, 0x10).unwrap();
    let stack = heap.allocate_stack().unwrap();

    let kept_clone = heap.clone_object(obj).unwrap();
    let lost_clone = heap.clone_object(obj).unwrap();

    let list = heap.allocate_list().unwrap();
    let first = heap.allocate_node(Address::number(1), Address::number(10)).unwrap();
    let second = heap.allocate_node(Address::number(2), Address::number(20)).unwrap();
    heap.lookup_node_mut(first).unwrap().succ = second;
    heap.lookup_node_mut(second).unwrap().pred = first;
    *heap.lookup_list_mut(list).unwrap() = List {
        first,
        last: second,
    };

    let lost_list = heap.allocate_list().unwrap();
    let lost_hunk = heap.allocate_hunk(64, "SaveBits()").unwrap();
    let lost_blob = heap.allocate_dynmem(8, "scratch").unwrap();

    {
        let values = heap.dereference(stack).unwrap().into_values().unwrap();
        values[0] = kept_clone;
        values[1] = list;
        values[2] = Address::number(99);
    }

    let freed: HashSet<Address> = collect_garbage(&mut heap, &[stack]).into_iter().collect();
    let expected: HashSet<Address> = [lost_clone, lost_list, lost_hunk, lost_blob]
        .into_iter()
        .collect();
    assert_eq!(freed, expected);

    assert!(heap.is_object(kept_clone));
    assert!(!heap.is_object(lost_clone));
    assert!(heap.lookup_node(first).is_ok());
    assert!(heap.lookup_node(second).is_ok());
    assert!(heap.segment(lost_blob.segment()).is_err());
    assert!(heap.get_script(script).is_ok());
    assert!(heap.segment(locals).is_ok());
}

#[test]
fn collector_defers_locked_script() {
    let mut heap = Heap::default();
    let script = heap.load_script(42, image(16)).unwrap();
    let locals = heap.allocate_locals(script, 1).unwrap();
    heap.lock_script(script).unwrap();

    let freed = collect_garbage(&mut heap, &[]);
    assert_eq!(freed, vec![Address::new(script, 0)]);

    // Still present while the interpreter holds it.
    let flagged = heap.get_script(script).unwrap();
    assert!(flagged.is_marked_deleted());
    assert_eq!(heap.script_segment(42), Some(script));

    assert_eq!(heap.unlock_script(script).unwrap(), 0);
    assert!(heap.segment(script).is_err());
    assert!(heap.segment(locals).is_err());
    assert_eq!(heap.script_segment(42), None);
}

#[test]
fn collector_frees_unlocked_script_with_locals() {
    let mut heap = Heap::default();
    let script = heap.load_script(7, image(16)).unwrap();
    let locals = heap.allocate_locals(script, 3).unwrap();

    collect_garbage(&mut heap, &[]);
    assert!(heap.segment(script).is_err());
    assert!(heap.segment(locals).is_err());

    // Both ids are free again.
    let reloaded = heap.load_script(7, image(16)).unwrap();
    assert_eq!(reloaded, script);
}

// ============================================================================
// Save/restore
// ============================================================================

#[test]
fn heap_survives_json_roundtrip() {
    let mut heap = Heap::default();
    let script = heap.load_script(3, image(48)).unwrap();
    heap.allocate_locals(script, 4).unwrap();
    let obj = heap.init_object(script, 0x10, 3, 0x20).unwrap();
    heap.object_mut(obj).unwrap().set_variable(2, Address::number(77));
    let clone = heap.clone_object(obj).unwrap();

    let keep = heap.allocate_node(Address::number(1), clone).unwrap();
    let dropped = heap.allocate_node(Address::number(2), Address::NULL).unwrap();
    heap.free(dropped).unwrap();

    heap.init_sys_strings().unwrap();
    let save_dir = heap.save_dir_address().unwrap();
    heap.write_string(save_dir, "games/save").unwrap();

    let json = heap.snapshot().to_json().unwrap();
    let stream = FieldStream::from_json(&json).unwrap();
    let mut restored = Heap::restore(HeapConfig::default(), &stream).unwrap();

    assert_eq!(restored.script_segment(3), Some(script));
    assert_eq!(restored.object(clone).unwrap().variable(2), Some(Address::number(77)));
    assert_eq!(restored.lookup_node(keep).unwrap().value, clone);
    assert!(!restored.is_valid(dropped));
    assert_eq!(restored.save_dir_address(), Some(save_dir));
    assert_eq!(restored.read_string(save_dir).unwrap(), "games/save");

    // The free chain is restored too, so the next node lands where it
    // would have in the original.
    let next_original = heap.allocate_node(Address::NULL, Address::NULL).unwrap();
    let next_restored = restored.allocate_node(Address::NULL, Address::NULL).unwrap();
    assert_eq!(next_original, next_restored);
    assert_eq!(next_restored, dropped);
}

#[test]
fn restore_rejects_truncated_stream() {
    let mut heap = Heap::default();
    heap.load_script(1, image(8)).unwrap();
    let stream = heap.snapshot();

    let mut fields = stream.fields().to_vec();
    fields.pop();
    let json = serde_json::json!({ "fields": fields }).to_string();
    let truncated = FieldStream::from_json(&json).unwrap();
    assert_eq!(truncated.len(), stream.len() - 1);
    assert!(Heap::restore(HeapConfig::default(), &truncated).is_err());
}
