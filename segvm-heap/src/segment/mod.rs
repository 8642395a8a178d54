//! # Segments
//!
//! A segment is one independently allocated, typed region of the address
//! space. The set of kinds is closed, so segments are a plain enum matched
//! by kind rather than trait objects.
//!
//! ## Offsets
//!
//! | Kind | Offset means | Valid when |
//! |------|--------------|------------|
//! | Script, DynMem | byte offset | `< byte length` |
//! | SystemStrings | string slot | slot is in use |
//! | LocalVariables, DataStack | value index | `< capacity` |
//! | Clones, Lists, Nodes, Hunks | table slot | slot is allocated |
//!
//! ## Collector hooks
//!
//! Every segment answers the same questions for the external collector:
//! which addresses in it can be destroyed independently
//! ([`Segment::list_all_deallocatable`]), what a given address reaches in
//! one hop ([`Segment::list_outgoing_references`]), which address governs
//! another for deallocation ([`Segment::find_canonic_address`]), and how to
//! tear one object down ([`Segment::free_at_address`]).

mod blobs;
mod frames;
mod script;
mod tables;

use std::fmt;

use tracing::debug;

use crate::address::{Address, SegmentId};
use crate::error::{MemoryError, Result};
use crate::serialize::{self, FieldReader, FieldWriter, SerializeError, Syncable};
use crate::table::SlotTable;

pub use blobs::{DynMem, SystemString, SystemStrings, SYS_STRINGS_MAX, SYS_STRING_PARSER_BASE, SYS_STRING_SAVE_DIR};
pub use frames::{DataStack, LocalVariables};
pub use script::{Object, ProgramImage, Script};
pub use tables::{CloneObject, CloneTable, Hunk, HunkTable, List, ListTable, Node, NodeTable};

/// The kind of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentKind {
    /// A loaded program unit.
    Script = 1,
    /// A script's local-variable frame.
    Locals = 2,
    /// The evaluation stack.
    Stack = 3,
    /// Named OS-interaction string buffers.
    SysStrings = 4,
    /// A single arbitrary-size blob.
    DynMem = 5,
    /// Cloned object instances.
    Clones = 6,
    /// List headers.
    Lists = 7,
    /// List nodes.
    Nodes = 8,
    /// Opaque heap buffers.
    Hunks = 9,
}

impl SegmentKind {
    /// Every kind, in tag order.
    pub const ALL: [SegmentKind; 9] = [
        SegmentKind::Script,
        SegmentKind::Locals,
        SegmentKind::Stack,
        SegmentKind::SysStrings,
        SegmentKind::DynMem,
        SegmentKind::Clones,
        SegmentKind::Lists,
        SegmentKind::Nodes,
        SegmentKind::Hunks,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Script => "script",
            SegmentKind::Locals => "locals",
            SegmentKind::Stack => "stack",
            SegmentKind::SysStrings => "system strings",
            SegmentKind::DynMem => "dynmem",
            SegmentKind::Clones => "clones",
            SegmentKind::Lists => "lists",
            SegmentKind::Nodes => "nodes",
            SegmentKind::Hunks => "hunks",
        }
    }

    /// Get the kind from its tag.
    pub fn from_u8(v: u8) -> Option<Self> {
        SegmentKind::ALL.into_iter().find(|k| *k as u8 == v)
    }

    /// True for the slot-table-backed kinds.
    pub fn is_table(&self) -> bool {
        matches!(
            self,
            SegmentKind::Clones | SegmentKind::Lists | SegmentKind::Nodes | SegmentKind::Hunks
        )
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, bounds-checked view into a segment.
#[derive(Debug)]
pub enum SegmentRef<'a> {
    /// Bytes from the requested offset to the end of the extent.
    Raw(&'a mut [u8]),
    /// VM values from the requested index to the end of the extent.
    Values(&'a mut [Address]),
}

impl<'a> SegmentRef<'a> {
    /// Number of bytes or values in the view.
    pub fn len(&self) -> usize {
        match self {
            SegmentRef::Raw(b) => b.len(),
            SegmentRef::Values(v) => v.len(),
        }
    }

    /// True if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for byte views.
    pub fn is_raw(&self) -> bool {
        matches!(self, SegmentRef::Raw(_))
    }

    /// The byte view, if this is one.
    pub fn into_raw(self) -> Option<&'a mut [u8]> {
        match self {
            SegmentRef::Raw(b) => Some(b),
            SegmentRef::Values(_) => None,
        }
    }

    /// The value view, if this is one.
    pub fn into_values(self) -> Option<&'a mut [Address]> {
        match self {
            SegmentRef::Values(v) => Some(v),
            SegmentRef::Raw(_) => None,
        }
    }
}

/// What the heap must do after a segment tore down an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The object was released inside the segment.
    Released,
    /// The object is flagged and will be released once it is unpinned.
    Deferred,
    /// The whole segment is now garbage and must leave the directory.
    Segment,
}

/// One typed region of the address space.
#[derive(Debug, Clone)]
pub enum Segment {
    /// A loaded program unit.
    Script(Script),
    /// A script's local-variable frame.
    Locals(LocalVariables),
    /// The evaluation stack.
    Stack(DataStack),
    /// Named OS-interaction string buffers.
    SysStrings(SystemStrings),
    /// A single arbitrary-size blob.
    DynMem(DynMem),
    /// Cloned object instances.
    Clones(CloneTable),
    /// List headers.
    Lists(ListTable),
    /// List nodes.
    Nodes(NodeTable),
    /// Opaque heap buffers.
    Hunks(HunkTable),
}

impl Segment {
    /// An empty segment of the given kind.
    ///
    /// Scripts start without an image, frames and stacks with
    /// `capacity` values, blobs with `capacity` bytes.
    pub fn empty(kind: SegmentKind, owner: SegmentId, capacity: usize) -> Self {
        match kind {
            SegmentKind::Script => Segment::Script(Script::default()),
            SegmentKind::Locals => Segment::Locals(LocalVariables::new(owner, capacity)),
            SegmentKind::Stack => Segment::Stack(DataStack::new(capacity)),
            SegmentKind::SysStrings => Segment::SysStrings(SystemStrings::new()),
            SegmentKind::DynMem => Segment::DynMem(DynMem::new(capacity, "")),
            SegmentKind::Clones => Segment::Clones(SlotTable::new()),
            SegmentKind::Lists => Segment::Lists(SlotTable::new()),
            SegmentKind::Nodes => Segment::Nodes(SlotTable::new()),
            SegmentKind::Hunks => Segment::Hunks(SlotTable::new()),
        }
    }

    /// The segment's kind.
    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Script(_) => SegmentKind::Script,
            Segment::Locals(_) => SegmentKind::Locals,
            Segment::Stack(_) => SegmentKind::Stack,
            Segment::SysStrings(_) => SegmentKind::SysStrings,
            Segment::DynMem(_) => SegmentKind::DynMem,
            Segment::Clones(_) => SegmentKind::Clones,
            Segment::Lists(_) => SegmentKind::Lists,
            Segment::Nodes(_) => SegmentKind::Nodes,
            Segment::Hunks(_) => SegmentKind::Hunks,
        }
    }

    /// Range check against the segment's extent.
    pub fn is_valid_offset(&self, offset: u32) -> bool {
        match self {
            Segment::Script(s) => (offset as usize) < s.buf_size(),
            Segment::Locals(l) => (offset as usize) < l.len(),
            Segment::Stack(s) => (offset as usize) < s.capacity(),
            Segment::SysStrings(s) => s.is_valid(offset),
            Segment::DynMem(d) => (offset as usize) < d.size(),
            Segment::Clones(t) => t.is_valid(offset),
            Segment::Lists(t) => t.is_valid(offset),
            Segment::Nodes(t) => t.is_valid(offset),
            Segment::Hunks(t) => t.is_valid(offset),
        }
    }

    /// Number of bytes, values or table slots; used in range errors.
    pub fn extent(&self) -> usize {
        match self {
            Segment::Script(s) => s.buf_size(),
            Segment::Locals(l) => l.len(),
            Segment::Stack(s) => s.capacity(),
            Segment::SysStrings(_) => SYS_STRINGS_MAX,
            Segment::DynMem(d) => d.size(),
            Segment::Clones(t) => t.len(),
            Segment::Lists(t) => t.len(),
            Segment::Nodes(t) => t.len(),
            Segment::Hunks(t) => t.len(),
        }
    }

    /// Resolve `addr` (which must name this segment) to a bounded view.
    pub fn dereference(&mut self, addr: Address) -> Result<SegmentRef<'_>> {
        if !self.is_valid_offset(addr.offset()) {
            return Err(MemoryError::OutOfRange {
                address: addr,
                extent: self.extent(),
            });
        }
        let offset = addr.offset() as usize;
        let kind = self.kind();
        let out_of_range = MemoryError::OutOfRange {
            address: addr,
            extent: self.extent(),
        };
        let view = match self {
            Segment::Script(s) => SegmentRef::Raw(&mut s.buf_mut()[offset..]),
            Segment::Locals(l) => SegmentRef::Values(&mut l.values_mut()[offset..]),
            Segment::Stack(s) => SegmentRef::Values(&mut s.values_mut()[offset..]),
            Segment::DynMem(d) => SegmentRef::Raw(&mut d.buf_mut()[offset..]),
            Segment::SysStrings(s) => {
                let string = s.get_mut(addr.offset()).ok_or(out_of_range)?;
                SegmentRef::Raw(string.buf_mut())
            }
            Segment::Clones(t) => {
                let clone = t.get_mut(addr.offset()).ok_or(out_of_range)?;
                SegmentRef::Values(clone.object_mut().variables_mut())
            }
            Segment::Hunks(t) => {
                let hunk = t.get_mut(addr.offset()).ok_or(out_of_range)?;
                SegmentRef::Raw(hunk.buf_mut())
            }
            Segment::Lists(_) | Segment::Nodes(_) => {
                return Err(MemoryError::NotDereferenceable { kind })
            }
        };
        Ok(view)
    }

    /// The address that governs `addr` for deallocation.
    ///
    /// Anything inside a script maps to the script's offset 0; a locals
    /// frame maps to offset 0 of its owning script; singleton blobs map to
    /// their own offset 0; table entries govern themselves.
    pub fn find_canonic_address(&self, addr: Address) -> Address {
        match self {
            Segment::Script(_) | Segment::DynMem(_) | Segment::Stack(_) => addr.with_offset(0),
            Segment::Locals(l) => Address::new(l.script(), 0),
            Segment::SysStrings(_)
            | Segment::Clones(_)
            | Segment::Lists(_)
            | Segment::Nodes(_)
            | Segment::Hunks(_) => addr,
        }
    }

    /// Tear down the object at `addr`.
    pub fn free_at_address(&mut self, addr: Address) -> Result<Reclaim> {
        let index = addr.offset();
        match self {
            Segment::Script(s) => {
                if s.lockers() == 0 {
                    Ok(Reclaim::Segment)
                } else {
                    debug!(script = s.number(), lockers = s.lockers(), "script deletion deferred");
                    s.mark_deleted();
                    Ok(Reclaim::Deferred)
                }
            }
            Segment::DynMem(d) => {
                d.release();
                Ok(Reclaim::Segment)
            }
            Segment::Clones(t) => t.free(index).map(|_| Reclaim::Released),
            Segment::Lists(t) => t.free(index).map(|_| Reclaim::Released),
            Segment::Nodes(t) => t.free(index).map(|_| Reclaim::Released),
            Segment::Hunks(t) => t.free(index).map(|_| Reclaim::Released),
            Segment::Locals(_) | Segment::Stack(_) | Segment::SysStrings(_) => {
                Err(MemoryError::NotDeallocatable { kind: self.kind() })
            }
        }
    }

    /// Emit every independently destroyable address in this segment.
    pub fn list_all_deallocatable(&self, id: SegmentId, mut emit: impl FnMut(Address)) {
        match self {
            Segment::Script(_) => emit(Address::new(id, 0)),
            Segment::DynMem(d) if d.size() > 0 => emit(Address::new(id, 0)),
            Segment::Clones(t) => t.for_each_valid(|i, _| emit(Address::new(id, i))),
            Segment::Lists(t) => t.for_each_valid(|i, _| emit(Address::new(id, i))),
            Segment::Nodes(t) => t.for_each_valid(|i, _| emit(Address::new(id, i))),
            Segment::Hunks(t) => t.for_each_valid(|i, _| emit(Address::new(id, i))),
            _ => {}
        }
    }

    /// Emit every address reachable from `addr` in one hop.
    ///
    /// Plain numbers are never emitted; an invalid `addr` emits nothing.
    pub fn list_outgoing_references(&self, addr: Address, mut emit: impl FnMut(Address)) {
        let mut push = |a: Address| {
            if !a.is_number() {
                emit(a)
            }
        };
        match self {
            Segment::Script(s) => s.list_outgoing_references(addr, &mut push),
            Segment::Locals(l) => l.values().iter().copied().for_each(push),
            Segment::Stack(s) => s.values().iter().copied().for_each(push),
            Segment::Clones(t) => {
                if let Some(clone) = t.get(addr.offset()) {
                    clone.object().variables().iter().copied().for_each(&mut push);
                    if let Some(locals) = clone.locals() {
                        push(locals);
                    }
                }
            }
            Segment::Lists(t) => {
                if let Some(list) = t.get(addr.offset()) {
                    push(list.first);
                    push(list.last);
                }
            }
            Segment::Nodes(t) => {
                if let Some(node) = t.get(addr.offset()) {
                    push(node.pred);
                    push(node.succ);
                    push(node.key);
                    push(node.value);
                }
            }
            Segment::SysStrings(_) | Segment::DynMem(_) | Segment::Hunks(_) => {}
        }
    }

    /// One-line summary for segment-table listings.
    pub fn summary(&self) -> String {
        match self {
            Segment::Script(s) => format!("S  script.{:03} l:{}", s.number(), s.lockers()),
            Segment::Locals(l) => format!("V  locals of {:04x} ({} values)", l.script(), l.len()),
            Segment::Stack(s) => format!("D  data stack ({})", s.capacity()),
            Segment::SysStrings(s) => format!("Y  system strings ({} in use)", s.in_use()),
            Segment::DynMem(d) => format!("M  dynmem ({}): {} bytes", d.description(), d.size()),
            Segment::Clones(t) => format!("C  clones ({} allocd)", t.entries_used()),
            Segment::Lists(t) => format!("L  lists ({})", t.entries_used()),
            Segment::Nodes(t) => format!("N  nodes ({})", t.entries_used()),
            Segment::Hunks(t) => format!("H  hunk ({})", t.entries_used()),
        }
    }

    /// Per-entry dump of segment `id`: objects, live table slots, strings
    /// and non-null values, one line each.
    pub fn details(&self, id: SegmentId) -> Vec<String> {
        let at = |offset: u32| Address::new(id, offset);
        let values = |values: &[Address]| -> Vec<String> {
            values
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != Address::NULL)
                .map(|(i, v)| format!("  [{i:04x}] {v}"))
                .collect()
        };
        match self {
            Segment::Script(s) => {
                let mut out = vec![format!(
                    "  {} bytes, {} exports, {} synonyms, locals {}, {} objects{}",
                    s.buf_size(),
                    s.exports_count(),
                    s.synonyms_count(),
                    s.locals_segment()
                        .map_or_else(|| "none".to_string(), |l| format!("{l:04x}")),
                    s.object_count(),
                    if s.is_marked_deleted() { ", marked for deletion" } else { "" },
                )];
                out.extend(s.objects().map(|o| {
                    format!(
                        "  [{}] object, {} vars, methods at {:04x}",
                        at(o.offset()),
                        o.var_count(),
                        o.methods_offset()
                    )
                }));
                out
            }
            Segment::Locals(l) => values(l.values()),
            Segment::Stack(s) => values(s.values()),
            Segment::SysStrings(s) => (0..SYS_STRINGS_MAX as u32)
                .filter_map(|i| s.get(i).map(|string| (i, string)))
                .map(|(i, string)| {
                    format!(
                        "  [{i}] {} ({} bytes) = {:?}",
                        string.name(),
                        string.max_size(),
                        string.value()
                    )
                })
                .collect(),
            Segment::DynMem(d) => vec![format!("  {:?}: {} bytes", d.description(), d.size())],
            Segment::Clones(t) => t
                .iter_valid()
                .map(|(i, c)| {
                    format!("  [{}] clone of {}, {} vars", at(i), c.base(), c.object().var_count())
                })
                .collect(),
            Segment::Lists(t) => t
                .iter_valid()
                .map(|(i, l)| format!("  [{}] list {} .. {}", at(i), l.first, l.last))
                .collect(),
            Segment::Nodes(t) => t
                .iter_valid()
                .map(|(i, n)| {
                    format!(
                        "  [{}] node {} <- -> {}, {} = {}",
                        at(i),
                        n.pred,
                        n.succ,
                        n.key,
                        n.value
                    )
                })
                .collect(),
            Segment::Hunks(t) => t
                .iter_valid()
                .map(|(i, h)| format!("  [{}] hunk {:?}, {} bytes", at(i), h.tag(), h.size()))
                .collect(),
        }
    }

    /// The script, if this is one.
    pub fn as_script(&self) -> Option<&Script> {
        match self {
            Segment::Script(s) => Some(s),
            _ => None,
        }
    }

    /// The script, mutably, if this is one.
    pub fn as_script_mut(&mut self) -> Option<&mut Script> {
        match self {
            Segment::Script(s) => Some(s),
            _ => None,
        }
    }
}

impl Syncable for Segment {
    fn save(&self, out: &mut FieldWriter) {
        out.write_u8(self.kind() as u8);
        match self {
            Segment::Script(s) => s.save(out),
            Segment::Locals(l) => l.save(out),
            Segment::Stack(s) => s.save(out),
            Segment::SysStrings(s) => s.save(out),
            Segment::DynMem(d) => d.save(out),
            Segment::Clones(t) => t.save(out),
            Segment::Lists(t) => t.save(out),
            Segment::Nodes(t) => t.save(out),
            Segment::Hunks(t) => t.save(out),
        }
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let tag = input.read_u8()?;
        let kind = SegmentKind::from_u8(tag).ok_or_else(|| SerializeError::InvalidValue {
            message: format!("unknown segment kind {tag}"),
        })?;
        Ok(match kind {
            SegmentKind::Script => Segment::Script(Script::load(input)?),
            SegmentKind::Locals => Segment::Locals(LocalVariables::load(input)?),
            SegmentKind::Stack => Segment::Stack(DataStack::load(input)?),
            SegmentKind::SysStrings => Segment::SysStrings(SystemStrings::load(input)?),
            SegmentKind::DynMem => Segment::DynMem(DynMem::load(input)?),
            SegmentKind::Clones => Segment::Clones(SlotTable::load(input)?),
            SegmentKind::Lists => Segment::Lists(SlotTable::load(input)?),
            SegmentKind::Nodes => Segment::Nodes(SlotTable::load(input)?),
            SegmentKind::Hunks => Segment::Hunks(SlotTable::load(input)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_outgoing(seg: &Segment, addr: Address) -> Vec<Address> {
        let mut out = Vec::new();
        seg.list_outgoing_references(addr, |a| out.push(a));
        out
    }

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in SegmentKind::ALL {
            assert_eq!(SegmentKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(SegmentKind::from_u8(0), None);
        assert!(SegmentKind::Hunks.is_table());
        assert!(!SegmentKind::DynMem.is_table());
    }

    #[test]
    fn test_node_outgoing_order() {
        let mut nodes = NodeTable::new();
        let index = nodes.allocate_with(Node {
            pred: Address::new(2, 1),
            succ: Address::new(2, 2),
            key: Address::new(3, 0),
            value: Address::new(4, 7),
        });
        let seg = Segment::Nodes(nodes);
        assert_eq!(
            collect_outgoing(&seg, Address::new(9, index)),
            vec![
                Address::new(2, 1),
                Address::new(2, 2),
                Address::new(3, 0),
                Address::new(4, 7)
            ]
        );
    }

    #[test]
    fn test_outgoing_skips_numbers() {
        let mut lists = ListTable::new();
        let index = lists.allocate_with(List {
            first: Address::new(5, 0),
            last: Address::number(0),
        });
        let seg = Segment::Lists(lists);
        assert_eq!(collect_outgoing(&seg, Address::new(1, index)), vec![Address::new(5, 0)]);
        // Freed or never allocated slots reach nothing.
        assert!(collect_outgoing(&seg, Address::new(1, 7)).is_empty());
    }

    #[test]
    fn test_dynmem_bounds_and_free() {
        let mut seg = Segment::DynMem(DynMem::new(16, "buf"));
        let addr = Address::new(4, 0);
        assert_eq!(seg.dereference(addr).unwrap().len(), 16);
        assert_eq!(
            seg.dereference(addr.with_offset(16)).unwrap_err(),
            MemoryError::OutOfRange {
                address: addr.with_offset(16),
                extent: 16
            }
        );
        assert_eq!(seg.free_at_address(addr).unwrap(), Reclaim::Segment);
        assert!(!seg.is_valid_offset(0));
    }

    #[test]
    fn test_lists_cannot_be_dereferenced() {
        let mut lists = ListTable::new();
        lists.allocate();
        let mut seg = Segment::Lists(lists);
        assert_eq!(
            seg.dereference(Address::new(1, 0)).unwrap_err(),
            MemoryError::NotDereferenceable {
                kind: SegmentKind::Lists
            }
        );
    }

    #[test]
    fn test_canonic_addresses() {
        let locals = Segment::Locals(LocalVariables::new(7, 4));
        assert_eq!(locals.find_canonic_address(Address::new(8, 3)), Address::new(7, 0));

        let script = Segment::Script(Script::default());
        assert_eq!(script.find_canonic_address(Address::new(7, 0x40)), Address::new(7, 0));

        let nodes = Segment::Nodes(NodeTable::new());
        assert_eq!(nodes.find_canonic_address(Address::new(3, 5)), Address::new(3, 5));
    }

    #[test]
    fn test_table_deallocatable_lists_live_slots() {
        let mut hunks = HunkTable::new();
        for _ in 0..3 {
            hunks.allocate_with(Hunk::new(8, "test"));
        }
        hunks.free(1).unwrap();
        let seg = Segment::Hunks(hunks);
        let mut out = Vec::new();
        seg.list_all_deallocatable(6, |a| out.push(a));
        assert_eq!(out, vec![Address::new(6, 0), Address::new(6, 2)]);
    }

    #[test]
    fn test_details_list_live_entries() {
        let mut nodes = NodeTable::new();
        nodes.allocate_with(Node {
            key: Address::number(1),
            value: Address::new(4, 2),
            ..Node::default()
        });
        nodes.allocate();
        nodes.free(1).unwrap();
        let lines = Segment::Nodes(nodes).details(3);
        assert_eq!(
            lines,
            vec!["  [0003:0000] node 0000:0000 <- -> 0000:0000, 0000:0001 = 0004:0002"]
        );

        let mut stack = DataStack::new(8);
        stack.values_mut()[5] = Address::new(2, 9);
        assert_eq!(Segment::Stack(stack).details(1), vec!["  [0005] 0002:0009"]);

        let mut script = Script::new(3, ProgramImage::from_bytes(vec![0; 32]));
        script.init_object(0x10, 2, 0x18).unwrap();
        let lines = Segment::Script(script).details(5);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("32 bytes"));
        assert_eq!(lines[1], "  [0005:0010] object, 2 vars, methods at 0018");
    }

    #[test]
    fn test_frames_are_not_freed_per_object() {
        let mut seg = Segment::Stack(DataStack::new(8));
        assert_eq!(
            seg.free_at_address(Address::new(2, 0)),
            Err(MemoryError::NotDeallocatable {
                kind: SegmentKind::Stack
            })
        );
    }
}
