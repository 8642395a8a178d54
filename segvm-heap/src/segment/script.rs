//! Script segments: a loaded program image plus its object table.

use tracing::{debug, trace};

use crate::address::{Address, SegmentId};
use crate::error::{MemoryError, Result};
use crate::int_mapper::IndexMapper;
use crate::serialize::{self, FieldReader, FieldWriter, SerializeError, Syncable};

/// A compiled program unit as handed over by the resource loader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    /// The raw image.
    pub bytes: Vec<u8>,
    /// Byte offset of the exports table, if present.
    pub exports_offset: Option<u32>,
    /// Number of 16-bit entries in the exports table.
    pub exports_count: u16,
    /// Byte offset of the synonyms table, if present.
    pub synonyms_offset: Option<u32>,
    /// Number of entries in the synonyms table.
    pub synonyms_count: u16,
}

impl ProgramImage {
    /// An image with no export or synonym tables.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }
}

/// An object defined inside a script image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object {
    offset: u32,
    variables: Vec<Address>,
    methods_offset: u32,
}

impl Object {
    /// Create an object at `offset` with `var_count` zeroed variables.
    pub fn new(offset: u32, var_count: usize, methods_offset: u32) -> Self {
        Self {
            offset,
            variables: vec![Address::NULL; var_count],
            methods_offset,
        }
    }

    /// Byte offset of the object inside its script.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Offset of the method/class area this object dispatches through.
    pub fn methods_offset(&self) -> u32 {
        self.methods_offset
    }

    /// Number of variable slots.
    pub fn var_count(&self) -> usize {
        self.variables.len()
    }

    /// Variable slots.
    pub fn variables(&self) -> &[Address] {
        &self.variables
    }

    /// Mutable variable slots.
    pub fn variables_mut(&mut self) -> &mut [Address] {
        &mut self.variables
    }

    /// Variable `index`, if in range.
    pub fn variable(&self, index: usize) -> Option<Address> {
        self.variables.get(index).copied()
    }

    /// Store into variable `index`. Returns false if out of range.
    pub fn set_variable(&mut self, index: usize, value: Address) -> bool {
        match self.variables.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub(crate) fn relocated_to(&self, offset: u32) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

impl Syncable for Object {
    fn save(&self, out: &mut FieldWriter) {
        out.write_u32(self.offset);
        out.write_u32(self.methods_offset);
        out.write_seq(&self.variables);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            offset: input.read_u32()?,
            methods_offset: input.read_u32()?,
            variables: input.read_seq()?,
        })
    }
}

/// A loaded program unit.
///
/// Objects are keyed by byte offset through an [`IndexMapper`], so their
/// identity does not depend on where they sit in the object vector.
#[derive(Debug, Clone, Default)]
pub struct Script {
    number: u16,
    buf: Vec<u8>,
    exports_offset: Option<u32>,
    exports_count: u16,
    synonyms_offset: Option<u32>,
    synonyms_count: u16,
    object_map: IndexMapper,
    objects: Vec<Option<Object>>,
    locals_segment: Option<SegmentId>,
    lockers: u32,
    marked_deleted: bool,
    frozen: bool,
}

impl Script {
    /// Create a script from a program image.
    pub fn new(number: u16, image: ProgramImage) -> Self {
        let mut script = Self::default();
        script.load_image(number, image);
        script
    }

    /// Replace the image and drop every object. Used while loading.
    pub fn load_image(&mut self, number: u16, image: ProgramImage) {
        self.number = number;
        self.buf = image.bytes;
        self.exports_offset = image.exports_offset;
        self.exports_count = image.exports_count;
        self.synonyms_offset = image.synonyms_offset;
        self.synonyms_count = image.synonyms_count;
        self.object_map.clear();
        self.objects.clear();
        self.frozen = false;
        debug!(script = number, size = self.buf.len(), "script image loaded");
    }

    /// The program number.
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Image size in bytes.
    pub fn buf_size(&self) -> usize {
        self.buf.len()
    }

    /// The image.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Number of exports.
    pub fn exports_count(&self) -> u16 {
        self.exports_count
    }

    /// Offset of the exports table.
    pub fn exports_offset(&self) -> Option<u32> {
        self.exports_offset
    }

    /// Number of synonyms.
    pub fn synonyms_count(&self) -> u16 {
        self.synonyms_count
    }

    /// Offset of the synonyms table.
    pub fn synonyms_offset(&self) -> Option<u32> {
        self.synonyms_offset
    }

    /// Read export `index` as a little-endian 16-bit offset.
    pub fn export(&self, index: u16) -> Option<u16> {
        if index >= self.exports_count {
            return None;
        }
        let pos = self.exports_offset? as usize + index as usize * 2;
        let bytes = self.buf.get(pos..pos + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    // ------------------------------------------------------------------------
    // Object table
    // ------------------------------------------------------------------------

    /// Register an object at byte `offset`.
    ///
    /// Re-registering the same offset replaces the object in place.
    pub fn init_object(&mut self, offset: u32, var_count: usize, methods_offset: u32) -> Result<&mut Object> {
        if offset as usize >= self.buf.len() {
            return Err(MemoryError::OutOfRange {
                address: Address::new(0, offset),
                extent: self.buf.len(),
            });
        }
        let index = self
            .object_map
            .check_key(offset as i32, true)
            .ok_or(MemoryError::InvalidKey { key: offset as i32 })? as usize;
        if index >= self.objects.len() {
            self.objects.resize(index + 1, None);
        }
        trace!(script = self.number, offset, index, "object registered");
        Ok(self.objects[index].insert(Object::new(offset, var_count, methods_offset)))
    }

    /// The object at byte `offset`.
    pub fn object_at(&self, offset: u32) -> Option<&Object> {
        let index = self.object_map.lookup_key(offset as i32)? as usize;
        self.objects.get(index)?.as_ref()
    }

    /// The object at byte `offset`, mutably.
    pub fn object_at_mut(&mut self, offset: u32) -> Option<&mut Object> {
        let index = self.object_map.lookup_key(offset as i32)? as usize;
        self.objects.get_mut(index)?.as_mut()
    }

    /// Drop the object at byte `offset`.
    pub fn remove_object(&mut self, offset: u32) -> Option<Object> {
        let index = self.object_map.remove_key(offset as i32)? as usize;
        self.objects.get_mut(index)?.take()
    }

    /// Every object, in object-table order.
    pub fn objects(&self) -> impl Iterator<Item = &Object> + '_ {
        self.objects.iter().flatten()
    }

    /// Number of registered objects.
    pub fn object_count(&self) -> usize {
        self.object_map.len()
    }

    /// Dense index of the object at `offset`.
    pub fn object_index(&self, offset: u32) -> Option<u32> {
        self.object_map.lookup_key(offset as i32)
    }

    // ------------------------------------------------------------------------
    // Relocation
    // ------------------------------------------------------------------------

    /// Add `delta` to each little-endian 16-bit word named by `fixups`.
    ///
    /// Only image bytes change. The object table keeps its keys; re-key an
    /// object with [`Script::move_object`].
    pub fn relocate(&mut self, segment: SegmentId, fixups: &[u32], delta: i32) -> Result<()> {
        if self.frozen {
            return Err(MemoryError::ScriptFrozen { script: segment });
        }
        for &pos in fixups {
            let at = pos as usize;
            if at + 2 > self.buf.len() {
                return Err(MemoryError::OutOfRange {
                    address: Address::new(segment, pos),
                    extent: self.buf.len(),
                });
            }
        }
        for &pos in fixups {
            let at = pos as usize;
            let word = u16::from_le_bytes([self.buf[at], self.buf[at + 1]]);
            let patched = (word as i32).wrapping_add(delta) as u16;
            self.buf[at..at + 2].copy_from_slice(&patched.to_le_bytes());
        }
        trace!(script = self.number, fixups = fixups.len(), delta, "script relocated");
        Ok(())
    }

    /// Move the object at `from` so it is keyed by `to`.
    ///
    /// On error the object table is left untouched.
    pub fn move_object(&mut self, from: u32, to: u32) -> Result<()> {
        if self.object_at(from).is_none() {
            return Err(MemoryError::NotAnObject {
                address: Address::number(from),
            });
        }
        if from == to {
            return Ok(());
        }
        if to as usize >= self.buf.len() {
            return Err(MemoryError::OutOfRange {
                address: Address::number(to),
                extent: self.buf.len(),
            });
        }
        if self.object_map.lookup_key(to as i32).is_some() {
            return Err(MemoryError::InvalidKey { key: to as i32 });
        }
        let Some(object) = self.remove_object(from) else {
            return Err(MemoryError::NotAnObject {
                address: Address::number(from),
            });
        };
        let moved = object.relocated_to(to);
        *self.init_object(to, 0, 0)? = moved;
        Ok(())
    }

    /// Close the script to further relocation.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// True once relocation has finished.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // ------------------------------------------------------------------------
    // Locals, locking, deletion
    // ------------------------------------------------------------------------

    /// Segment of the locals frame, if one was allocated.
    pub fn locals_segment(&self) -> Option<SegmentId> {
        self.locals_segment
    }

    pub(crate) fn set_locals_segment(&mut self, id: Option<SegmentId>) {
        self.locals_segment = id;
    }

    /// Current pin count.
    pub fn lockers(&self) -> u32 {
        self.lockers
    }

    /// Pin the script while the interpreter executes it.
    pub fn increment_lockers(&mut self) {
        self.lockers += 1;
    }

    /// Unpin the script. Saturates at zero.
    pub fn decrement_lockers(&mut self) {
        self.lockers = self.lockers.saturating_sub(1);
    }

    /// Overwrite the pin count.
    pub fn set_lockers(&mut self, lockers: u32) {
        self.lockers = lockers;
    }

    /// Flag the script for deletion once unpinned.
    pub fn mark_deleted(&mut self) {
        self.marked_deleted = true;
    }

    /// Clear the deletion flag.
    pub fn unmark_deleted(&mut self) {
        self.marked_deleted = false;
    }

    /// True if deletion is pending.
    pub fn is_marked_deleted(&self) -> bool {
        self.marked_deleted
    }

    pub(crate) fn list_outgoing_references(&self, addr: Address, emit: &mut impl FnMut(Address)) {
        let segment = addr.segment();
        if let Some(object) = self.object_at(addr.offset()) {
            object.variables().iter().copied().for_each(&mut *emit);
        }
        if addr.offset() == 0 {
            if let Some(locals) = self.locals_segment {
                emit(Address::new(locals, 0));
            }
            for object in self.objects() {
                if object.offset() != 0 {
                    emit(Address::new(segment, object.offset()));
                }
            }
        }
    }
}

impl Syncable for Script {
    fn save(&self, out: &mut FieldWriter) {
        out.write_u16(self.number);
        out.write_bytes(&self.buf);
        out.write_u32(self.exports_offset.unwrap_or(u32::MAX));
        out.write_u16(self.exports_count);
        out.write_u32(self.synonyms_offset.unwrap_or(u32::MAX));
        out.write_u16(self.synonyms_count);
        self.object_map.save(out);
        out.write_len(self.objects.len());
        for object in &self.objects {
            out.write_option(object.as_ref());
        }
        out.write_u16(self.locals_segment.unwrap_or(0));
        out.write_u32(self.lockers);
        out.write_bool(self.marked_deleted);
        out.write_bool(self.frozen);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let optional = |v: u32| (v != u32::MAX).then_some(v);
        let number = input.read_u16()?;
        let buf = input.read_bytes()?;
        let exports_offset = optional(input.read_u32()?);
        let exports_count = input.read_u16()?;
        let synonyms_offset = optional(input.read_u32()?);
        let synonyms_count = input.read_u16()?;
        let object_map = IndexMapper::load(input)?;
        let len = input.read_len()?;
        let mut objects = Vec::with_capacity(len.min(input.remaining()));
        for _ in 0..len {
            objects.push(input.read_option::<Object>()?);
        }
        for (_, index) in object_map.iter() {
            if objects.get(index as usize).map_or(true, Option::is_none) {
                return Err(SerializeError::InvalidValue {
                    message: format!("script {number} maps an object to empty slot {index}"),
                });
            }
        }
        let locals_segment = match input.read_u16()? {
            0 => None,
            id => Some(id),
        };
        Ok(Self {
            number,
            buf,
            exports_offset,
            exports_count,
            synonyms_offset,
            synonyms_count,
            object_map,
            objects,
            locals_segment,
            lockers: input.read_u32()?,
            marked_deleted: input.read_bool()?,
            frozen: input.read_bool()?,
        })
    }
}
