//! Persistent-Memory Heap
//!
//! A byte-addressable, crash-consistent pool organized as zones, chunks
//! and runs, and the memory-block layer that interprets, classifies and
//! mutates the allocation units living in it.
//!
//! ## Features
//!
//! - **8-byte chunk headers** replaced with single aligned stores —
//!   atomic with respect to crash
//! - **Two block kinds**: huge chunk spans and bitmap-tracked run blocks
//! - **Three allocation-header encodings**: legacy (64 B), compact
//!   (16 B), none — multiplexed by chunk-header flags
//! - **Redo-log binding**: state changes staged as 64-bit entries on a
//!   caller-supplied operation context, or applied directly when none
//!   is given
//! - **Transient footers** for multi-chunk spans, rebuilt at every boot
//! - **Pluggable persistence and memory-state observation** via the
//!   [`PersistOps`] and [`MemoryObserver`] seams
//!
//! ## Modules
//!
//! - [`layout`] - On-media structures and addressing constants
//! - [`heap`] - Pool formatting, boot, accessors and run locks
//! - [`memblock`] - Block descriptors and their operations
//! - [`redo`] - Operation-context seam and staging buffer
//! - [`persist`] - Persistence primitives
//! - [`observer`] - Memory-state observer seam
//! - [`error`] - Error types
//!
//! ## Example Usage
//!
//! ```rust
//! use pmheap::{Heap, MemblockState, MemoryBlock, BlockLocation, ChunkType};
//!
//! // Format a small pool and carve out a free huge chunk.
//! let heap = Heap::create(8).unwrap();
//! heap.init_chunk(0, 5, ChunkType::Free, 0, 1).unwrap();
//!
//! // Allocate it: one 8-byte chunk-header store, applied immediately.
//! let m = MemoryBlock::rebuild_state(
//!     &heap,
//!     BlockLocation { zone_id: 0, chunk_id: 5, block_off: 0, size_idx: 1 },
//! );
//! m.prep_hdr(MemblockState::Allocated, None);
//! m.write_header(42, 0);
//! assert_eq!(m.get_state(), MemblockState::Allocated);
//!
//! // Any pool offset handed out can be resolved back to its block.
//! let off = heap.offset_of(m.get_user_data());
//! let resolved = MemoryBlock::from_offset(&heap, off);
//! assert_eq!(resolved.chunk_id(), 5);
//! assert_eq!(resolved.get_extra(), 42);
//! ```
//!
//! ## Pool Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Heap header (1 KiB)                         │
//! │  - signature, version, chunk size, checksum │
//! ├─────────────────────────────────────────────┤
//! │ Zone 0                                      │
//! │  ┌───────────────────────────────────────┐  │
//! │  │ Zone header + chunk headers (8 B each)│  │
//! │  ├───────────────────────────────────────┤  │
//! │  │ Chunk 0 (256 KiB)   huge or run       │  │
//! │  │ Chunk 1 ...                           │  │
//! │  └───────────────────────────────────────┘  │
//! ├─────────────────────────────────────────────┤
//! │ Zone 1+ (16 GiB stride)                     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! A run chunk subdivides further: run metadata (block size, alignment,
//! 16-word bitmap), optional alignment padding, then equal-size blocks.
//! Clear bitmap bits are free blocks; set bits are allocated.
//!
//! ## Concurrency
//!
//! The layer is synchronous and takes no locks of its own. Huge blocks
//! are serialized by the owning bucket above; run blocks by the
//! per-chunk mutex returned from [`MemoryBlock::get_lock`], which must
//! be held from `prep_hdr` until the operation context commits.

pub mod error;
pub mod heap;
pub mod layout;
pub mod memblock;
pub mod observer;
pub mod persist;
pub mod redo;

// Re-export commonly used types
pub use error::{HeapError, Result};
pub use heap::{Heap, HeapBuilder};
pub use layout::{
    ChunkHeader, ChunkType, CHUNKSIZE, CHUNK_FLAG_ALIGNED, CHUNK_FLAG_COMPACT_HEADER,
    CHUNK_FLAG_HEADER_NONE,
};
pub use memblock::{BlockLocation, HeaderType, MemblockState, MemoryBlock, MemoryBlockType};
pub use observer::{MemoryObserver, NoopObserver};
pub use persist::{PersistOps, VolatileOps, MEM_NODRAIN, MEM_NONTEMPORAL, MEM_RELAXED};
pub use redo::{EntryKind, OperationContext, RedoBuffer, RedoEntry, RedoOp};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
