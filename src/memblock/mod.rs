//! Memory-block descriptors
//!
//! A memory block is the unit every allocator operation ultimately acts
//! on: either a huge chunk span, tracked 1:1 by its chunk header, or a
//! run block, tracked by consecutive bits in the run's bitmap. The
//! descriptor built here is a cursor over the pool — it borrows the
//! heap, owns nothing, and dispatches each operation on its two tags
//! (block kind, header kind) to the right implementation.
//!
//! Descriptors come from two places: resolved from a raw pool offset
//! ([`MemoryBlock::from_offset`]), or hand-built by the allocator above
//! and completed with [`MemoryBlock::rebuild_state`].

mod header;
mod huge;
mod run;

pub(crate) use run::run_alignment_padding;

use crate::error::fatal;
use crate::heap::Heap;
use crate::layout::{
    size_idx_for, ChunkHeader, ChunkRun, ChunkType, CHUNKSIZE, CHUNK_FLAG_COMPACT_HEADER,
    CHUNK_FLAG_HEADER_NONE, RUN_METASIZE, ZONE0_OFFSET, ZONE_MAX_SIZE, Zone,
};
use crate::redo::OperationContext;
use parking_lot::Mutex;
use std::fmt;
use std::mem::size_of;

/// Block kinds. Huge blocks are whole chunk spans; run blocks are
/// bitmap-tracked sub-divisions of a run chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBlockType {
    Huge,
    Run,
}

/// Allocation-header kinds, encoded in the chunk header's flags so they
/// can be read without touching user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// 64-byte header of the original object format.
    Legacy,
    /// 16-byte packed header.
    Compact,
    /// No allocation header at all.
    None,
}

impl HeaderType {
    /// On-media size of this header kind.
    pub const fn size(self) -> usize {
        match self {
            HeaderType::Legacy => 64,
            HeaderType::Compact => 16,
            HeaderType::None => 0,
        }
    }

    /// Chunk-header flag announcing this header kind.
    pub const fn flag(self) -> u16 {
        match self {
            HeaderType::Legacy => 0,
            HeaderType::Compact => CHUNK_FLAG_COMPACT_HEADER,
            HeaderType::None => CHUNK_FLAG_HEADER_NONE,
        }
    }

    pub(crate) fn from_flags(flags: u16) -> Self {
        if flags & CHUNK_FLAG_COMPACT_HEADER != 0 {
            HeaderType::Compact
        } else if flags & CHUNK_FLAG_HEADER_NONE != 0 {
            HeaderType::None
        } else {
            HeaderType::Legacy
        }
    }
}

/// Observable allocation state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemblockState {
    Free,
    Allocated,
    /// The chunk header holds a state this block kind cannot interpret;
    /// the caller (typically a recovery walk) decides what to do.
    Unknown,
}

/// Persistent location of a block: which zone, which chunk, and for run
/// blocks which bit the block starts at. `size_idx` counts units
/// (chunks for huge, bits for run); 0 means "size not known yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockLocation {
    pub zone_id: u32,
    pub chunk_id: u32,
    pub block_off: u16,
    pub size_idx: u32,
}

/// Cursor over one memory block.
///
/// Copyable and freely duplicated; mutating operations require the
/// caller to hold the block's lock (see [`MemoryBlock::get_lock`]).
#[derive(Clone, Copy)]
pub struct MemoryBlock<'heap> {
    heap: &'heap Heap,
    loc: BlockLocation,
    block_type: MemoryBlockType,
    header_type: HeaderType,
}

impl fmt::Debug for MemoryBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("zone_id", &self.loc.zone_id)
            .field("chunk_id", &self.loc.chunk_id)
            .field("block_off", &self.loc.block_off)
            .field("size_idx", &self.loc.size_idx)
            .field("block_type", &self.block_type)
            .field("header_type", &self.header_type)
            .finish()
    }
}

impl PartialEq for MemoryBlock<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.heap, other.heap)
            && self.loc == other.loc
            && self.block_type == other.block_type
            && self.header_type == other.header_type
    }
}

impl Eq for MemoryBlock<'_> {}

impl<'heap> MemoryBlock<'heap> {
    /// Resolve a block from a pool offset, deriving its size from the
    /// allocation metadata.
    pub fn from_offset(heap: &'heap Heap, offset: u64) -> Self {
        Self::from_offset_opt(heap, offset, true)
    }

    /// Resolve a block from a pool offset.
    ///
    /// The offset must point at the user data of a live allocation (the
    /// value the allocator hands out). With `size_known`, `size_idx` is
    /// computed from the stored allocation size; otherwise it is left 0
    /// for the caller to fill in.
    pub fn from_offset_opt(heap: &'heap Heap, offset: u64, size_known: bool) -> Self {
        let sub = |off: usize, amount: usize| -> usize {
            off.checked_sub(amount)
                .unwrap_or_else(|| fatal!("offset {offset:#x} does not resolve to a block"))
        };

        let mut off = sub(offset as usize, ZONE0_OFFSET);
        let zone_id = (off / ZONE_MAX_SIZE) as u32;
        off = sub(off, zone_id as usize * ZONE_MAX_SIZE + size_of::<Zone>());

        let mut chunk_id = (off / CHUNKSIZE) as u32;
        let hdr = unsafe { *heap.chunk_hdr(zone_id, chunk_id) };
        if hdr.chunk_type == ChunkType::RunData as u16 {
            chunk_id -= hdr.size_idx;
        }
        off = sub(off, chunk_id as usize * CHUNKSIZE);

        let header_type =
            HeaderType::from_flags(unsafe { (*heap.chunk_hdr(zone_id, chunk_id)).flags });
        off = sub(off, header_type.size());

        let block_type = if off != 0 {
            MemoryBlockType::Run
        } else {
            MemoryBlockType::Huge
        };

        let mut m = MemoryBlock {
            heap,
            loc: BlockLocation {
                zone_id,
                chunk_id,
                block_off: 0,
                size_idx: 0,
            },
            block_type,
            header_type,
        };

        if detect_type(heap, zone_id, chunk_id) != block_type {
            fatal!("possible zone chunks metadata corruption");
        }

        let unit_size = m.block_size();

        if off != 0 {
            let run = m.chunk_run();
            let padding = unsafe {
                run_alignment_padding(
                    run.cast::<u8>().add(RUN_METASIZE),
                    (*m.chunk_hdr()).flags,
                    (*run).alignment,
                    header_type.size(),
                )
            };
            off = sub(off, padding);
            off = sub(off, RUN_METASIZE);
            m.loc.block_off = (off / unit_size) as u16;
            off -= m.loc.block_off as usize * unit_size;
        }

        m.loc.size_idx = if size_known {
            size_idx_for(unit_size, header::get_size(&m))
        } else {
            0
        };

        if off != 0 {
            fatal!("offset {offset:#x} does not resolve to a block");
        }

        m
    }

    /// Complete a hand-built descriptor: derive the header kind, block
    /// kind and with them the operation dispatch from the persistent
    /// location in `loc`.
    pub fn rebuild_state(heap: &'heap Heap, loc: BlockLocation) -> Self {
        let header_type =
            HeaderType::from_flags(unsafe { (*heap.chunk_hdr(loc.zone_id, loc.chunk_id)).flags });
        let block_type = detect_type(heap, loc.zone_id, loc.chunk_id);
        MemoryBlock {
            heap,
            loc,
            block_type,
            header_type,
        }
    }

    pub fn location(&self) -> BlockLocation {
        self.loc
    }

    pub fn zone_id(&self) -> u32 {
        self.loc.zone_id
    }

    pub fn chunk_id(&self) -> u32 {
        self.loc.chunk_id
    }

    pub fn block_off(&self) -> u16 {
        self.loc.block_off
    }

    pub fn size_idx(&self) -> u32 {
        self.loc.size_idx
    }

    pub fn block_type(&self) -> MemoryBlockType {
        self.block_type
    }

    pub fn header_type(&self) -> HeaderType {
        self.header_type
    }

    /// Size of one unit of this block: the chunk size for huge blocks,
    /// the run's stored block size for run blocks.
    pub fn block_size(&self) -> usize {
        match self.block_type {
            MemoryBlockType::Huge => CHUNKSIZE,
            MemoryBlockType::Run => run::block_size(self),
        }
    }

    /// First byte of the block, allocation header included.
    pub fn get_real_data(&self) -> *mut u8 {
        match self.block_type {
            MemoryBlockType::Huge => self.chunk_data(),
            MemoryBlockType::Run => run::get_real_data(self),
        }
    }

    /// First byte of the block's user data.
    pub fn get_user_data(&self) -> *mut u8 {
        unsafe { self.get_real_data().add(self.header_type.size()) }
    }

    /// Block size including header overhead.
    ///
    /// Sized descriptors multiply units; unsized ones (built during
    /// recovery before `size_idx` is known) fall back to the stored
    /// allocation size.
    pub fn get_real_size(&self) -> usize {
        if self.loc.size_idx != 0 {
            self.block_size() * self.loc.size_idx as usize
        } else {
            header::get_size(self)
        }
    }

    /// Usable size, header overhead excluded.
    pub fn get_user_size(&self) -> usize {
        self.get_real_size() - self.header_type.size()
    }

    /// Allocation state of the block.
    pub fn get_state(&self) -> MemblockState {
        match self.block_type {
            MemoryBlockType::Huge => huge::get_state(self),
            MemoryBlockType::Run => run::get_state(self),
        }
    }

    /// The mutex the caller must hold across `prep_hdr` and the commit
    /// of its operation context. Huge blocks are serialized by their
    /// owning bucket and have no lock of their own.
    pub fn get_lock(&self) -> Option<&'heap Mutex<()>> {
        match self.block_type {
            MemoryBlockType::Huge => None,
            MemoryBlockType::Run => Some(self.heap.run_lock(self.loc.chunk_id)),
        }
    }

    /// Make sure the chunk's flags announce `header_type`.
    ///
    /// Only legal on a free huge chunk; runs are created with their
    /// header flag already in place. Fail-safe atomic: the flags are
    /// published with a single 8-byte store.
    pub fn ensure_header_type(&self, header_type: HeaderType) {
        match self.block_type {
            MemoryBlockType::Huge => huge::ensure_header_type(self, header_type),
            MemoryBlockType::Run => run::ensure_header_type(self, header_type),
        }
    }

    /// Prepare the persistent state change that moves this block to
    /// `op` (`Allocated` or `Free`).
    ///
    /// With an operation context the change is appended as redo entries
    /// and takes effect when the context commits; the targeted words
    /// must not change in between, which is what the block's lock
    /// serializes. Without a context the change is applied immediately
    /// with single atomic stores and persisted.
    pub fn prep_hdr(&self, op: MemblockState, ctx: Option<&mut dyn OperationContext>) {
        match self.block_type {
            MemoryBlockType::Huge => huge::prep_operation_hdr(self, op, ctx),
            MemoryBlockType::Run => run::prep_operation_hdr(self, op, ctx),
        }
    }

    /// Write the allocation header (size from the descriptor, plus
    /// `extra` and user `flags`). Non-temporal, not drained; the commit
    /// boundary belongs to the caller.
    pub fn write_header(&self, extra: u64, flags: u16) {
        header::write(self, self.get_real_size(), extra, flags);
    }

    /// Tell the memory-state observer the block's data and header are
    /// dead bytes.
    pub fn invalidate(&self) {
        let data = self.get_user_data();
        let size = self.get_user_size();
        self.heap.observer().set_clean(data, size);
        header::invalidate(self);
    }

    /// Refresh observer state of the header after a heap restart.
    pub fn reinit_header(&self) {
        header::reinit(self);
    }

    /// The header's extra field (0 when the header kind has none).
    pub fn get_extra(&self) -> u64 {
        header::get_extra(self)
    }

    /// The header's user flags (0 when the header kind has none).
    pub fn get_flags(&self) -> u16 {
        header::get_flags(self)
    }

    pub(crate) fn heap(&self) -> &'heap Heap {
        self.heap
    }

    pub(crate) fn chunk_hdr(&self) -> *mut ChunkHeader {
        self.heap.chunk_hdr(self.loc.zone_id, self.loc.chunk_id)
    }

    pub(crate) fn chunk_data(&self) -> *mut u8 {
        self.heap.chunk_data(self.loc.zone_id, self.loc.chunk_id)
    }

    pub(crate) fn chunk_run(&self) -> *mut ChunkRun {
        self.heap.chunk_run(self.loc.zone_id, self.loc.chunk_id)
    }
}

/// Classify a block by its chunk header's type.
pub(crate) fn detect_type(heap: &Heap, zone_id: u32, chunk_id: u32) -> MemoryBlockType {
    let hdr = unsafe { *heap.chunk_hdr(zone_id, chunk_id) };
    match ChunkType::from_u16(hdr.chunk_type) {
        Some(ChunkType::Run) | Some(ChunkType::RunData) => MemoryBlockType::Run,
        Some(ChunkType::Free) | Some(ChunkType::Used) | Some(ChunkType::Footer) => {
            MemoryBlockType::Huge
        }
        None => fatal!("possible zone chunks metadata corruption"),
    }
}
