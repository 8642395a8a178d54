//! # Heap
//!
//! The segment directory. It owns every live [`Segment`], indexed by
//! [`SegmentId`], and is the only place an [`Address`] is turned into
//! bytes or values.
//!
//! # Design
//!
//! - Slot 0 of the directory is never occupied, so an address with segment
//!   id 0 is always a plain number.
//! - Ids of deallocated segments are reused, lowest first. A live segment's
//!   id never changes.
//! - Clones, lists, nodes and hunks are allocated from one shared table
//!   segment per kind, created on first use. The data stack and the system
//!   strings are likewise singletons.
//! - Scripts are also indexed by program number. A script freed while it is
//!   still locked is only flagged; it leaves the directory, together with
//!   its locals frame, once its lock count drops to zero.
//!
//! # Example
//!
//! ```rust,ignore
//! use segvm_heap::{Heap, HeapConfig, ProgramImage};
//!
//! let mut heap = Heap::new(HeapConfig::default());
//! let script = heap.load_script(12, ProgramImage::from_bytes(bytes))?;
//! heap.allocate_locals(script, 8)?;
//! let obj = heap.init_object(script, 0x24, 4, 0x80)?;
//! let clone = heap.clone_object(obj)?;
//! ```

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::address::{Address, SegmentId, NUMBER_SEGMENT};
use crate::config::HeapConfig;
use crate::error::{MemoryError, Result};
use crate::segment::{
    CloneObject, DataStack, DynMem, Hunk, List, LocalVariables, Node, Object, ProgramImage,
    Reclaim, Script, Segment, SegmentKind, SegmentRef, SystemStrings, SYS_STRING_PARSER_BASE,
    SYS_STRING_SAVE_DIR,
};
use crate::serialize::{self, FieldReader, FieldStream, FieldWriter, SerializeError, Syncable};

/// Capacity of the parser-base system string in bytes.
const PARSER_BASE_SIZE: usize = 64;

// ============================================================================
// Shared segments
// ============================================================================

/// Ids of the segments there is only one of at a time.
#[derive(Debug, Clone, Copy, Default)]
struct SharedSegments {
    clones: Option<SegmentId>,
    lists: Option<SegmentId>,
    nodes: Option<SegmentId>,
    hunks: Option<SegmentId>,
    stack: Option<SegmentId>,
    sys_strings: Option<SegmentId>,
}

impl SharedSegments {
    fn slot(&mut self, kind: SegmentKind) -> Option<&mut Option<SegmentId>> {
        match kind {
            SegmentKind::Clones => Some(&mut self.clones),
            SegmentKind::Lists => Some(&mut self.lists),
            SegmentKind::Nodes => Some(&mut self.nodes),
            SegmentKind::Hunks => Some(&mut self.hunks),
            SegmentKind::Stack => Some(&mut self.stack),
            SegmentKind::SysStrings => Some(&mut self.sys_strings),
            SegmentKind::Script | SegmentKind::Locals | SegmentKind::DynMem => None,
        }
    }

    fn get(&self, kind: SegmentKind) -> Option<SegmentId> {
        let mut shared = *self;
        shared.slot(kind).and_then(|slot| *slot)
    }

    /// Record `id` as the shared segment of its kind unless one exists.
    fn adopt(&mut self, kind: SegmentKind, id: SegmentId) {
        if let Some(slot) = self.slot(kind) {
            slot.get_or_insert(id);
        }
    }

    fn forget(&mut self, id: SegmentId) {
        for slot in [
            &mut self.clones,
            &mut self.lists,
            &mut self.nodes,
            &mut self.hunks,
            &mut self.stack,
            &mut self.sys_strings,
        ] {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }
}

fn kind_mismatch(segment: SegmentId, expected: SegmentKind, found: &Segment) -> MemoryError {
    MemoryError::KindMismatch {
        segment,
        expected,
        found: found.kind(),
    }
}

fn claim_sys_string(strings: &mut SystemStrings, index: u32, name: &str, max_size: usize) {
    if !strings.is_valid(index) {
        strings.set(index, name, max_size, "");
    }
}

/// Generate checked accessors for the entries of one table kind.
macro_rules! table_entry_accessors {
    ($variant:ident, $ty:ty, $get:ident, $get_mut:ident) => {
        #[doc = concat!("The ", stringify!($ty), " entry at `addr`.")]
        pub fn $get(&self, addr: Address) -> Result<&$ty> {
            match self.segment(addr.segment())? {
                Segment::$variant(table) => {
                    table.get(addr.offset()).ok_or(MemoryError::OutOfRange {
                        address: addr,
                        extent: table.len(),
                    })
                }
                other => Err(kind_mismatch(addr.segment(), SegmentKind::$variant, other)),
            }
        }

        #[doc = concat!("The ", stringify!($ty), " entry at `addr`, mutably.")]
        pub fn $get_mut(&mut self, addr: Address) -> Result<&mut $ty> {
            match self.segment_mut(addr.segment())? {
                Segment::$variant(table) => {
                    let extent = table.len();
                    table.get_mut(addr.offset()).ok_or(MemoryError::OutOfRange {
                        address: addr,
                        extent,
                    })
                }
                other => Err(kind_mismatch(addr.segment(), SegmentKind::$variant, other)),
            }
        }
    };
}

// ============================================================================
// Heap
// ============================================================================

/// The segment directory.
pub struct Heap {
    config: HeapConfig,
    /// Indexed by segment id. Slot 0 is always empty.
    segments: Vec<Option<Segment>>,
    /// Program number to script segment.
    scripts: HashMap<u16, SegmentId>,
    shared: SharedSegments,
}

impl Heap {
    /// Create an empty heap.
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            segments: vec![None],
            scripts: HashMap::new(),
            shared: SharedSegments::default(),
        }
    }

    /// The configuration this heap was created with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------------

    fn insert(&mut self, segment: Segment) -> Result<SegmentId> {
        let kind = segment.kind();
        let index = match self.segments.iter().skip(1).position(Option::is_none) {
            Some(pos) => pos + 1,
            None => {
                if self.segments.len() > SegmentId::MAX as usize {
                    warn!(%kind, "segment directory is full");
                    return Err(MemoryError::DirectoryFull);
                }
                self.segments.push(None);
                self.segments.len() - 1
            }
        };
        self.segments[index] = Some(segment);
        let id = index as SegmentId;
        self.shared.adopt(kind, id);
        debug!(segment = id, %kind, "segment allocated");
        Ok(id)
    }

    /// Allocate a fresh segment of `kind`, reusing the lowest free id.
    ///
    /// Stacks get the configured capacity; every other kind starts empty.
    /// The first clones, lists, nodes, hunks, stack or system-strings
    /// segment becomes the shared one for its kind. Scripts and locals
    /// frames are refused: they come from [`Heap::load_script`] and
    /// [`Heap::allocate_locals`].
    pub fn allocate_segment(&mut self, kind: SegmentKind) -> Result<(SegmentId, &mut Segment)> {
        let capacity = match kind {
            SegmentKind::Script | SegmentKind::Locals => {
                warn!(%kind, "refusing to allocate an unowned segment");
                return Err(MemoryError::OwnerRequired { kind });
            }
            SegmentKind::Stack => self.config.stack_capacity,
            _ => 0,
        };
        let id = self.insert(Segment::empty(kind, NUMBER_SEGMENT, capacity))?;
        Ok((id, self.segment_mut(id)?))
    }

    /// Remove segment `id` from the directory and return it.
    ///
    /// Deallocating a script also drops its program-number mapping and its
    /// locals frame. The caller guarantees nothing still refers to it.
    pub fn deallocate_segment(&mut self, id: SegmentId) -> Result<Segment> {
        let segment = self
            .segments
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(MemoryError::InvalidSegment { segment: id })?;
        self.shared.forget(id);

        match &segment {
            Segment::Script(script) => {
                if self.scripts.get(&script.number()) == Some(&id) {
                    self.scripts.remove(&script.number());
                }
                if let Some(locals) = script.locals_segment() {
                    if let Some(slot) = self.segments.get_mut(locals as usize) {
                        if matches!(slot, Some(Segment::Locals(_))) {
                            *slot = None;
                            debug!(segment = locals, script = id, "locals frame deallocated");
                        }
                    }
                }
            }
            Segment::Locals(locals) => {
                if let Some(Some(Segment::Script(script))) = self.segments.get_mut(locals.script() as usize) {
                    if script.locals_segment() == Some(id) {
                        script.set_locals_segment(None);
                    }
                }
            }
            _ => {}
        }

        debug!(segment = id, kind = %segment.kind(), "segment deallocated");
        Ok(segment)
    }

    /// The live segment `id`.
    pub fn segment(&self, id: SegmentId) -> Result<&Segment> {
        self.segments
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(MemoryError::InvalidSegment { segment: id })
    }

    /// The live segment `id`, mutably.
    pub fn segment_mut(&mut self, id: SegmentId) -> Result<&mut Segment> {
        self.segments
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(MemoryError::InvalidSegment { segment: id })
    }

    /// Segment `id`, which must be of kind `expected`.
    pub fn get(&self, id: SegmentId, expected: SegmentKind) -> Result<&Segment> {
        let segment = self.segment(id)?;
        if segment.kind() != expected {
            return Err(kind_mismatch(id, expected, segment));
        }
        Ok(segment)
    }

    /// Segment `id`, mutably, which must be of kind `expected`.
    pub fn get_mut(&mut self, id: SegmentId, expected: SegmentKind) -> Result<&mut Segment> {
        let segment = self.segment_mut(id)?;
        if segment.kind() != expected {
            return Err(kind_mismatch(id, expected, segment));
        }
        Ok(segment)
    }

    /// The lowest-numbered live segment of `kind`.
    pub fn find_segment_by_kind(&self, kind: SegmentKind) -> Option<SegmentId> {
        self.live_segments()
            .find(|(_, segment)| segment.kind() == kind)
            .map(|(id, _)| id)
    }

    /// Ids of every live segment, ascending.
    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.live_segments().map(|(id, _)| id)
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.live_segments().count()
    }

    fn live_segments(&self) -> impl Iterator<Item = (SegmentId, &Segment)> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter_map(|(id, segment)| segment.as_ref().map(|s| (id as SegmentId, s)))
    }

    fn shared_segment(&mut self, kind: SegmentKind) -> Result<SegmentId> {
        match self.shared.get(kind) {
            Some(id) => Ok(id),
            None => self.allocate_segment(kind).map(|(id, _)| id),
        }
    }

    // ------------------------------------------------------------------------
    // Core address API
    // ------------------------------------------------------------------------

    /// Resolve `addr` to a bounds-checked view of its segment.
    pub fn dereference(&mut self, addr: Address) -> Result<SegmentRef<'_>> {
        self.segment_mut(addr.segment())?.dereference(addr)
    }

    /// True if `addr` names a live segment and a valid offset in it.
    pub fn is_valid(&self, addr: Address) -> bool {
        self.segment(addr.segment())
            .is_ok_and(|segment| segment.is_valid_offset(addr.offset()))
    }

    /// Allocate one object of `kind`.
    ///
    /// Table kinds get a fresh default entry in the shared table. System
    /// strings resolve to the shared segment with its well-known slots
    /// claimed. Stacks and blobs get a new segment, addressed at offset 0.
    /// Scripts and locals frames fail with [`MemoryError::OwnerRequired`].
    pub fn allocate(&mut self, kind: SegmentKind) -> Result<Address> {
        match kind {
            SegmentKind::Clones => self.insert_clone(CloneObject::default()),
            SegmentKind::Lists => self.allocate_list(),
            SegmentKind::Nodes => self.allocate_node(Address::NULL, Address::NULL),
            SegmentKind::Hunks => self.allocate_hunk(0, ""),
            SegmentKind::SysStrings => self.init_sys_strings().map(|id| Address::new(id, 0)),
            _ => self.allocate_segment(kind).map(|(id, _)| Address::new(id, 0)),
        }
    }

    /// Tear down the object at `addr`.
    ///
    /// Table entries are released in place. A dynmem blob or an unlocked
    /// script leaves the directory. A locked script is flagged and leaves
    /// once [`Heap::unlock_script`] brings its lock count to zero.
    pub fn free(&mut self, addr: Address) -> Result<Reclaim> {
        let id = addr.segment();
        let reclaim = self.segment_mut(id)?.free_at_address(addr)?;
        if reclaim == Reclaim::Segment {
            self.deallocate_segment(id)?;
        }
        Ok(reclaim)
    }

    // ------------------------------------------------------------------------
    // Scripts
    // ------------------------------------------------------------------------

    /// Load program `number` from `image` and return its segment.
    ///
    /// If the program is already loaded its segment is returned unchanged,
    /// unless it was flagged for deletion: then the flag is cleared and the
    /// segment is reloaded from `image` in place.
    pub fn load_script(&mut self, number: u16, image: ProgramImage) -> Result<SegmentId> {
        if let Some(id) = self.script_segment(number) {
            let script = self.get_script_mut(id)?;
            if script.is_marked_deleted() {
                debug!(script = number, segment = id, "reviving script flagged for deletion");
                script.unmark_deleted();
                script.load_image(number, image);
            }
            return Ok(id);
        }
        let id = self.insert(Segment::Script(Script::new(number, image)))?;
        self.scripts.insert(number, id);
        Ok(id)
    }

    /// Segment of program `number`, if loaded.
    pub fn script_segment(&self, number: u16) -> Option<SegmentId> {
        self.scripts.get(&number).copied()
    }

    /// The script in segment `id`.
    pub fn get_script(&self, id: SegmentId) -> Result<&Script> {
        match self.segment(id)? {
            Segment::Script(script) => Ok(script),
            other => Err(kind_mismatch(id, SegmentKind::Script, other)),
        }
    }

    /// The script in segment `id`, mutably.
    pub fn get_script_mut(&mut self, id: SegmentId) -> Result<&mut Script> {
        match self.segment_mut(id)? {
            Segment::Script(script) => Ok(script),
            other => Err(kind_mismatch(id, SegmentKind::Script, other)),
        }
    }

    /// Pin script `id`. Returns the new lock count.
    pub fn lock_script(&mut self, id: SegmentId) -> Result<u32> {
        let script = self.get_script_mut(id)?;
        script.increment_lockers();
        Ok(script.lockers())
    }

    /// Unpin script `id`. Returns the new lock count.
    ///
    /// A script flagged for deletion is deallocated when the count reaches
    /// zero.
    pub fn unlock_script(&mut self, id: SegmentId) -> Result<u32> {
        let script = self.get_script_mut(id)?;
        script.decrement_lockers();
        let lockers = script.lockers();
        if lockers == 0 && script.is_marked_deleted() {
            debug!(script = script.number(), segment = id, "releasing script flagged for deletion");
            self.deallocate_segment(id)?;
        }
        Ok(lockers)
    }

    /// Give script `id` a locals frame of `count` values.
    ///
    /// An existing frame is resized, keeping its values.
    pub fn allocate_locals(&mut self, id: SegmentId, count: usize) -> Result<SegmentId> {
        if let Some(locals) = self.get_script(id)?.locals_segment() {
            if let Ok(Segment::Locals(frame)) = self.segment_mut(locals) {
                frame.resize(count);
                return Ok(locals);
            }
        }
        let locals = self.insert(Segment::Locals(LocalVariables::new(id, count)))?;
        self.get_script_mut(id)?.set_locals_segment(Some(locals));
        Ok(locals)
    }

    /// Register an object at `offset` in script `id`.
    pub fn init_object(
        &mut self,
        id: SegmentId,
        offset: u32,
        var_count: usize,
        methods_offset: u32,
    ) -> Result<Address> {
        self.get_script_mut(id)?
            .init_object(offset, var_count, methods_offset)?;
        Ok(Address::new(id, offset))
    }

    /// Apply relocation fixups to script `id`.
    pub fn relocate_script(&mut self, id: SegmentId, fixups: &[u32], delta: i32) -> Result<()> {
        self.get_script_mut(id)?.relocate(id, fixups, delta)
    }

    // ------------------------------------------------------------------------
    // Objects and clones
    // ------------------------------------------------------------------------

    /// The script object or clone at `addr`.
    pub fn object(&self, addr: Address) -> Result<&Object> {
        let object = match self.segment(addr.segment())? {
            Segment::Script(script) => script.object_at(addr.offset()),
            Segment::Clones(table) => table.get(addr.offset()).map(CloneObject::object),
            _ => None,
        };
        object.ok_or(MemoryError::NotAnObject { address: addr })
    }

    /// The script object or clone at `addr`, mutably.
    pub fn object_mut(&mut self, addr: Address) -> Result<&mut Object> {
        let object = match self.segment_mut(addr.segment())? {
            Segment::Script(script) => script.object_at_mut(addr.offset()),
            Segment::Clones(table) => table.get_mut(addr.offset()).map(CloneObject::object_mut),
            _ => None,
        };
        object.ok_or(MemoryError::NotAnObject { address: addr })
    }

    /// True if `addr` names a script object or a clone.
    pub fn is_object(&self, addr: Address) -> bool {
        self.object(addr).is_ok()
    }

    /// Clone the object at `base` into the shared clone table.
    ///
    /// The clone copies the variables and remembers the locals frame of the
    /// script that defines the original.
    pub fn clone_object(&mut self, base: Address) -> Result<Address> {
        let not_an_object = MemoryError::NotAnObject { address: base };
        let (object, locals) = match self.segment(base.segment())? {
            Segment::Script(script) => {
                let object = script.object_at(base.offset()).ok_or(not_an_object)?;
                let locals = script.locals_segment().map(|id| Address::new(id, 0));
                (object.clone(), locals)
            }
            Segment::Clones(table) => {
                let clone = table.get(base.offset()).ok_or(not_an_object)?;
                (clone.object().clone(), clone.locals())
            }
            _ => return Err(not_an_object),
        };
        self.insert_clone(CloneObject::new(object, base, locals))
    }

    fn insert_clone(&mut self, clone: CloneObject) -> Result<Address> {
        let id = self.shared_segment(SegmentKind::Clones)?;
        match self.segment_mut(id)? {
            Segment::Clones(table) => Ok(Address::new(id, table.allocate_with(clone))),
            other => Err(kind_mismatch(id, SegmentKind::Clones, other)),
        }
    }

    table_entry_accessors!(Clones, CloneObject, lookup_clone, lookup_clone_mut);

    // ------------------------------------------------------------------------
    // Lists, nodes, hunks
    // ------------------------------------------------------------------------

    /// Allocate an empty list header.
    pub fn allocate_list(&mut self) -> Result<Address> {
        let id = self.shared_segment(SegmentKind::Lists)?;
        match self.segment_mut(id)? {
            Segment::Lists(table) => Ok(Address::new(id, table.allocate())),
            other => Err(kind_mismatch(id, SegmentKind::Lists, other)),
        }
    }

    /// Allocate an unlinked node carrying `key` and `value`.
    pub fn allocate_node(&mut self, key: Address, value: Address) -> Result<Address> {
        let id = self.shared_segment(SegmentKind::Nodes)?;
        let node = Node {
            key,
            value,
            ..Node::default()
        };
        match self.segment_mut(id)? {
            Segment::Nodes(table) => Ok(Address::new(id, table.allocate_with(node))),
            other => Err(kind_mismatch(id, SegmentKind::Nodes, other)),
        }
    }

    /// Allocate a zeroed hunk of `size` bytes.
    pub fn allocate_hunk(&mut self, size: usize, tag: &str) -> Result<Address> {
        let id = self.shared_segment(SegmentKind::Hunks)?;
        match self.segment_mut(id)? {
            Segment::Hunks(table) => Ok(Address::new(id, table.allocate_with(Hunk::new(size, tag)))),
            other => Err(kind_mismatch(id, SegmentKind::Hunks, other)),
        }
    }

    table_entry_accessors!(Lists, List, lookup_list, lookup_list_mut);
    table_entry_accessors!(Nodes, Node, lookup_node, lookup_node_mut);
    table_entry_accessors!(Hunks, Hunk, lookup_hunk, lookup_hunk_mut);

    // ------------------------------------------------------------------------
    // Dynamic memory, stack, system strings
    // ------------------------------------------------------------------------

    /// Allocate a zeroed blob of `size` bytes in its own segment.
    pub fn allocate_dynmem(&mut self, size: usize, description: &str) -> Result<Address> {
        let limit = self.config.max_dynmem_size;
        if limit != 0 && size > limit {
            warn!(size, limit, description, "dynmem request over limit");
            return Err(MemoryError::AllocationTooLarge {
                requested: size,
                limit,
            });
        }
        let id = self.insert(Segment::DynMem(DynMem::new(size, description)))?;
        Ok(Address::new(id, 0))
    }

    /// Free the blob at `addr`, removing its segment.
    pub fn free_dynmem(&mut self, addr: Address) -> Result<()> {
        self.get(addr.segment(), SegmentKind::DynMem)?;
        self.deallocate_segment(addr.segment()).map(drop)
    }

    /// The debug tag of the blob at `addr`.
    pub fn get_description(&self, addr: Address) -> Result<&str> {
        match self.segment(addr.segment())? {
            Segment::DynMem(mem) => Ok(mem.description()),
            other => Err(kind_mismatch(addr.segment(), SegmentKind::DynMem, other)),
        }
    }

    /// The data stack, allocated with the configured capacity on first
    /// call.
    pub fn allocate_stack(&mut self) -> Result<Address> {
        if let Some(id) = self.shared.get(SegmentKind::Stack) {
            return Ok(Address::new(id, 0));
        }
        let id = self.insert(Segment::Stack(DataStack::new(self.config.stack_capacity)))?;
        Ok(Address::new(id, 0))
    }

    /// The system-strings segment, created on first call.
    ///
    /// The save-directory and parser-base strings are claimed if they are
    /// not in use yet; claimed strings keep their contents.
    pub fn init_sys_strings(&mut self) -> Result<SegmentId> {
        let id = self.shared_segment(SegmentKind::SysStrings)?;
        let save_dir_capacity = self.config.save_dir_capacity;
        match self.segment_mut(id)? {
            Segment::SysStrings(strings) => {
                claim_sys_string(strings, SYS_STRING_SAVE_DIR, "savedir", save_dir_capacity);
                claim_sys_string(strings, SYS_STRING_PARSER_BASE, "parser-base", PARSER_BASE_SIZE);
                Ok(id)
            }
            other => Err(kind_mismatch(id, SegmentKind::SysStrings, other)),
        }
    }

    /// Address of the save-directory string, once system strings exist.
    pub fn save_dir_address(&self) -> Option<Address> {
        self.shared
            .get(SegmentKind::SysStrings)
            .map(|id| Address::new(id, SYS_STRING_SAVE_DIR))
    }

    // ------------------------------------------------------------------------
    // Strings and raw memory
    // ------------------------------------------------------------------------

    fn raw_span(&mut self, addr: Address) -> Result<&mut [u8]> {
        self.dereference(addr)?
            .into_raw()
            .ok_or(MemoryError::NotAString { address: addr })
    }

    fn short_span(&self, addr: Address, needed: usize) -> MemoryError {
        MemoryError::OutOfRange {
            address: addr.offset_by(needed as i32),
            extent: self.segment(addr.segment()).map_or(0, Segment::extent),
        }
    }

    /// The NUL-terminated string at `addr`.
    pub fn read_string(&mut self, addr: Address) -> Result<String> {
        let span = self.raw_span(addr)?;
        let end = span.iter().position(|&b| b == 0).unwrap_or(span.len());
        Ok(String::from_utf8_lossy(&span[..end]).into_owned())
    }

    /// Store `value` plus a terminating NUL at `addr`.
    ///
    /// Nothing is written if it does not fit.
    pub fn write_string(&mut self, addr: Address, value: &str) -> Result<()> {
        let needed = value.len() + 1;
        let span = self.raw_span(addr)?;
        if span.len() < needed {
            return Err(self.short_span(addr, needed));
        }
        span[..value.len()].copy_from_slice(value.as_bytes());
        span[value.len()] = 0;
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dest`, which may lie in different
    /// segments.
    pub fn memcpy(&mut self, dest: Address, src: Address, len: usize) -> Result<()> {
        let source = self.raw_span(src)?.get(..len).map(<[u8]>::to_vec);
        let source = source.ok_or_else(|| self.short_span(src, len))?;
        let span = self.raw_span(dest)?;
        if span.len() < len {
            return Err(self.short_span(dest, len));
        }
        span[..len].copy_from_slice(&source);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// One line describing segment `id`.
    pub fn describe_segment(&self, id: SegmentId) -> Result<String> {
        Ok(format!("[{id:04x}] {}", self.segment(id)?.summary()))
    }

    /// The table row of segment `id` followed by a dump of its contents.
    pub fn segment_info(&self, id: SegmentId) -> Result<Vec<String>> {
        let segment = self.segment(id)?;
        let mut lines = vec![format!("[{id:04x}] {}", segment.summary())];
        lines.extend(segment.details(id));
        Ok(lines)
    }

    /// One line per live segment.
    pub fn segment_table(&self) -> Vec<String> {
        self.live_segments()
            .map(|(id, segment)| format!("[{id:04x}] {}", segment.summary()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Save/restore
    // ------------------------------------------------------------------------

    /// Capture the whole directory as a field stream.
    pub fn snapshot(&self) -> FieldStream {
        FieldStream::capture(self)
    }

    /// Rebuild a heap from a stream produced by [`Heap::snapshot`].
    pub fn restore(config: HeapConfig, stream: &FieldStream) -> serialize::Result<Self> {
        let mut heap: Heap = stream.restore()?;
        heap.config = config;
        Ok(heap)
    }

    /// Rebuild the program-number index and the shared segment ids from
    /// the directory contents.
    fn reindex(&mut self) -> serialize::Result<()> {
        self.scripts.clear();
        self.shared = SharedSegments::default();
        for (index, segment) in self.segments.iter().enumerate() {
            let Some(segment) = segment else { continue };
            let id = index as SegmentId;
            if let Segment::Script(script) = segment {
                if let Some(other) = self.scripts.insert(script.number(), id) {
                    return Err(SerializeError::InvalidValue {
                        message: format!(
                            "script {} loaded in segments {other:#06x} and {id:#06x}",
                            script.number()
                        ),
                    });
                }
            }
            self.shared.adopt(segment.kind(), id);
        }
        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("segments", &self.segment_count())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl Syncable for Heap {
    fn save(&self, out: &mut FieldWriter) {
        out.write_len(self.segments.len());
        for segment in &self.segments {
            out.write_option(segment.as_ref());
        }
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let len = input.read_len()?;
        let mut segments = Vec::with_capacity(len.min(input.remaining()));
        for _ in 0..len {
            segments.push(input.read_option::<Segment>()?);
        }
        match segments.first() {
            Some(None) => {}
            _ => {
                return Err(SerializeError::InvalidValue {
                    message: "segment 0 must be empty".into(),
                })
            }
        }
        let mut heap = Heap {
            segments,
            ..Heap::default()
        };
        heap.reindex()?;
        Ok(heap)
    }
}
