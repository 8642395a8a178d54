//! Raw byte segments: dynamic memory blobs and the system strings.

use crate::serialize::{self, FieldReader, FieldWriter, Syncable};

/// Maximum number of system strings.
pub const SYS_STRINGS_MAX: usize = 4;

/// Slot of the save-directory string.
pub const SYS_STRING_SAVE_DIR: u32 = 0;

/// Slot of the parser base string.
pub const SYS_STRING_PARSER_BASE: u32 = 1;

/// One arbitrary-size blob with a debug tag.
#[derive(Debug, Clone, Default)]
pub struct DynMem {
    description: String,
    buf: Vec<u8>,
}

impl DynMem {
    /// A zero-filled blob of `size` bytes.
    pub fn new(size: usize, description: &str) -> Self {
        Self {
            description: description.to_string(),
            buf: vec![0; size],
        }
    }

    /// Size in bytes; zero once released.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The debug tag.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The bytes.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// The bytes, mutably.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Drop the buffer. Every offset becomes invalid.
    pub fn release(&mut self) {
        self.buf = Vec::new();
    }
}

impl Syncable for DynMem {
    fn save(&self, out: &mut FieldWriter) {
        out.write_str(&self.description);
        out.write_bytes(&self.buf);
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        Ok(Self {
            description: input.read_str()?,
            buf: input.read_bytes()?,
        })
    }
}

/// A named, fixed-capacity mutable string buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemString {
    name: String,
    buf: Vec<u8>,
}

impl SystemString {
    /// The name; empty for an unused slot.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity in bytes.
    pub fn max_size(&self) -> usize {
        self.buf.len()
    }

    /// The buffer.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// The buffer, mutably.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Contents up to the first NUL.
    pub fn value(&self) -> String {
        let end = self.buf.iter().position(|&b| b == 0).unwrap_or(self.buf.len());
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }

    fn in_use(&self) -> bool {
        !self.name.is_empty()
    }
}

/// The small, fixed set of strings shared with the host.
#[derive(Debug, Clone, Default)]
pub struct SystemStrings {
    strings: [SystemString; SYS_STRINGS_MAX],
}

impl SystemStrings {
    /// All slots unused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim slot `index` with a zeroed buffer of `max_size` bytes.
    ///
    /// `initial` is copied in and truncated so a terminating NUL always
    /// fits. Returns false if `index` is out of range.
    pub fn set(&mut self, index: u32, name: &str, max_size: usize, initial: &str) -> bool {
        let Some(slot) = self.strings.get_mut(index as usize) else {
            return false;
        };
        let mut buf = vec![0u8; max_size];
        let len = initial.len().min(max_size.saturating_sub(1));
        buf[..len].copy_from_slice(&initial.as_bytes()[..len]);
        *slot = SystemString {
            name: name.to_string(),
            buf,
        };
        true
    }

    /// Release slot `index`.
    pub fn free(&mut self, index: u32) {
        if let Some(slot) = self.strings.get_mut(index as usize) {
            *slot = SystemString::default();
        }
    }

    /// True if slot `index` is in use.
    pub fn is_valid(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    /// Slot `index`, if in use.
    pub fn get(&self, index: u32) -> Option<&SystemString> {
        self.strings.get(index as usize).filter(|s| s.in_use())
    }

    /// Slot `index`, mutably, if in use.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut SystemString> {
        self.strings.get_mut(index as usize).filter(|s| s.in_use())
    }

    /// Number of slots in use.
    pub fn in_use(&self) -> usize {
        self.strings.iter().filter(|s| s.in_use()).count()
    }
}

impl Syncable for SystemStrings {
    fn save(&self, out: &mut FieldWriter) {
        out.write_len(SYS_STRINGS_MAX);
        for s in &self.strings {
            out.write_str(&s.name);
            out.write_bytes(&s.buf);
        }
    }

    fn load(input: &mut FieldReader<'_>) -> serialize::Result<Self> {
        let count = input.read_len()?;
        let mut strings = Self::new();
        for index in 0..count {
            let name = input.read_str()?;
            let buf = input.read_bytes()?;
            if let Some(slot) = strings.strings.get_mut(index) {
                *slot = SystemString { name, buf };
            }
        }
        Ok(strings)
    }
}
