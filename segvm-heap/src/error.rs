//! Error types for heap and segment operations.

use thiserror::Error;

use crate::address::{Address, SegmentId};
use crate::segment::SegmentKind;

/// Errors surfaced by the address space.
///
/// None of these are transient: a failed operation leaves the heap exactly
/// as it was, and the interpreter is expected to abort the current step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The segment id is not present in the directory.
    #[error("invalid segment {segment:#06x}")]
    InvalidSegment {
        /// The offending segment id.
        segment: SegmentId,
    },

    /// The segment exists but is of a different kind.
    #[error("segment {segment:#06x} is {found}, expected {expected}")]
    KindMismatch {
        /// The segment id.
        segment: SegmentId,
        /// The kind the caller asked for.
        expected: SegmentKind,
        /// The kind actually stored.
        found: SegmentKind,
    },

    /// The offset lies beyond the segment's declared extent.
    #[error("address {address} is out of range (extent {extent})")]
    OutOfRange {
        /// The address that was resolved.
        address: Address,
        /// The extent of the segment at resolution time.
        extent: usize,
    },

    /// A slot was freed twice, or was never allocated.
    #[error("double free of slot {index}")]
    DoubleFree {
        /// The slot index.
        index: u32,
    },

    /// A duplicate key was inserted while restoring an index mapper.
    #[error("duplicate key {key} in index mapper")]
    InvalidKey {
        /// The duplicated key.
        key: i32,
    },

    /// The segment kind has no byte or value view.
    #[error("{kind} segments cannot be dereferenced")]
    NotDereferenceable {
        /// The segment kind.
        kind: SegmentKind,
    },

    /// The segment kind has no per-object teardown.
    #[error("{kind} segments cannot be freed per object")]
    NotDeallocatable {
        /// The segment kind.
        kind: SegmentKind,
    },

    /// The address does not name an object or clone.
    #[error("{address} is not an object")]
    NotAnObject {
        /// The address.
        address: Address,
    },

    /// The script was already relocated.
    #[error("script segment {script:#06x} is frozen")]
    ScriptFrozen {
        /// The script's segment id.
        script: SegmentId,
    },

    /// The segment kind is created through its owner, not allocated bare.
    #[error("{kind} segments must be created through their owner")]
    OwnerRequired {
        /// The segment kind.
        kind: SegmentKind,
    },

    /// Every segment id is in use.
    #[error("segment directory is full")]
    DirectoryFull,

    /// The address does not resolve to a byte buffer.
    #[error("{address} does not hold a string")]
    NotAString {
        /// The address.
        address: Address,
    },

    /// A dynamic memory request exceeds the configured limit.
    #[error("dynmem request of {requested} bytes exceeds limit of {limit}")]
    AllocationTooLarge {
        /// Requested size in bytes.
        requested: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Result type for heap operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
