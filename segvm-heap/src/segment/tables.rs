//! Element types of the slot-table-backed segments.

use crate::address::Address;
use crate::serialize::{self, FieldReader, FieldWriter, Syncable};
use crate::table::SlotTable;

use super::script::Object;

/// Table of cloned object instances.
pub type CloneTable = SlotTable<CloneObject>;
/// Table of list headers.
pub type ListTable = SlotTable<List>;
/// Table of list nodes.
pub type NodeTable = SlotTable<Node>;
/// Table of opaque heap buffers.
pub type HunkTable = SlotTable<Hunk>;

/// An object instance cloned from a script object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneObject {
    object: Object,
    base: Address,
    locals: Option<Address>,
}

impl CloneObject {
    /// Clone `object`, which lives at `base`, recording the locals frame
    /// of the script that defines it.
    pub fn new(object: Object, base: Address, locals: Option<Address>) -> Self {
        Self { object, base, locals }
    }

    /// The instance data.
    pub fn object(&self) -> &Object {
        &self.object
    }

    /// The instance data, mutably.
    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }

    /// Address of the script object this was cloned from.
    pub fn base(&self) -> Address {
        self.base
    }

    /// Locals frame of the defining script.
    pub fn locals(&self) -> Option<Address> {
        self.locals
    }
}

impl Syncable for CloneObject {
    fn save(&self, out: &mut FieldWriter) {
        self.object.save(out);
        self.base.save(out);
        out.write_option(self.locals.as_ref());
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            object: Object::load(input)?,
            base: Address::load(input)?,
            locals: input.read_option()?,
        })
    }
}

/// A list header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct List {
    /// First node, or null.
    pub first: Address,
    /// Last node, or null.
    pub last: Address,
}

impl Syncable for List {
    fn save(&self, out: &mut FieldWriter) {
        self.first.save(out);
        self.last.save(out);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            first: Address::load(input)?,
            last: Address::load(input)?,
        })
    }
}

/// A doubly linked list node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Node {
    /// Previous node, or null.
    pub pred: Address,
    /// Next node, or null.
    pub succ: Address,
    /// Lookup key.
    pub key: Address,
    /// Payload.
    pub value: Address,
}

impl Syncable for Node {
    fn save(&self, out: &mut FieldWriter) {
        self.pred.save(out);
        self.succ.save(out);
        self.key.save(out);
        self.value.save(out);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            pred: Address::load(input)?,
            succ: Address::load(input)?,
            key: Address::load(input)?,
            value: Address::load(input)?,
        })
    }
}

/// An opaque heap buffer with a type tag. The buffer is dropped when its
/// slot is freed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    mem: Vec<u8>,
    tag: String,
}

impl Hunk {
    /// A zero-filled buffer of `size` bytes.
    pub fn new(size: usize, tag: &str) -> Self {
        Self {
            mem: vec![0; size],
            tag: tag.to_string(),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// The type tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The buffer.
    pub fn buf(&self) -> &[u8] {
        &self.mem
    }

    /// The buffer, mutably.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

impl Syncable for Hunk {
    fn save(&self, out: &mut FieldWriter) {
        out.write_str(&self.tag);
        out.write_bytes(&self.mem);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            tag: input.read_str()?,
            mem: input.read_bytes()?,
        })
    }
}
