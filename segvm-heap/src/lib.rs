//! # Segmented VM Heap
//!
//! The memory substrate of a byte-code interpreter. Every piece of run-time
//! state lives in one address space and is named by an [`Address`]: a
//! segment id plus an offset, usable as an ordinary VM value.
//!
//! - **Address**: (segment, offset) value; segment 0 means "plain number"
//! - **Slot Table**: free-list-backed records with stable indices
//! - **Index Mapper**: integer keys to dense reusable indices
//! - **Segments**: scripts, locals, stack, system strings, dynmem and the
//!   clone/list/node/hunk tables
//! - **Heap**: the segment directory and sole resolver of addresses
//! - **GC Hooks**: enumeration entry points for an external collector
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          HEAP                             │
//! │                       (heap.rs)                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │
//! │  │  Scripts   │  │  Frames    │  │ Clones/Lists/Nodes │  │
//! │  │ + objects  │  │ locals/stk │  │       /Hunks       │  │
//! │  └─────┬──────┘  └────────────┘  └─────────┬──────────┘  │
//! │        │                                   │             │
//! │  ┌─────┴──────┐                     ┌──────┴───────┐     │
//! │  │IndexMapper │                     │  SlotTable   │     │
//! │  └────────────┘                     └──────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//!            ▲                                   ▲
//!       interpreter                          collector
//!   (dereference/alloc)                      (GcHooks)
//! ```
//!
//! The heap is single-threaded. A collection pass must run to completion
//! before the interpreter mutates the heap again.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod address;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod int_mapper;
pub mod log;
pub mod segment;
pub mod serialize;
pub mod table;

// Re-exports
pub use address::{Address, SegmentId, NUMBER_SEGMENT};
pub use config::{ConfigError, HeapConfig, HeapConfigBuilder, LogConfig};
pub use error::{MemoryError, Result};
pub use gc::GcHooks;
pub use heap::Heap;
pub use int_mapper::IndexMapper;
pub use segment::{
    CloneObject, DataStack, DynMem, Hunk, List, LocalVariables, Node, Object, ProgramImage,
    Reclaim, Script, Segment, SegmentKind, SegmentRef, SystemStrings,
};
pub use serialize::{FieldStream, SerializeError, Syncable};
pub use table::SlotTable;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a heap configured from `SEGVM_*` environment variables and
/// install the default log subscriber.
///
/// See [`HeapConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Heap {
    let config = HeapConfig::from_env();
    log::init_logging(&config.log);
    Heap::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_from_env() {
        let heap = init_from_env();
        assert_eq!(heap.segment_count(), 0);
    }
}
