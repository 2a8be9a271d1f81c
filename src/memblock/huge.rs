//! Huge-block operations
//!
//! A huge block is a span of whole chunks; its entire state lives in
//! the head chunk header, so every state change is one 8-byte store.
//! Multi-chunk spans additionally carry a footer in the last header
//! slot — transient, rebuilt on boot, and only ever written after the
//! head's persistent state is safely out, because the footer slot may
//! still be the live head of the next chunk.

use super::{HeaderType, MemblockState, MemoryBlock};
use crate::error::fatal;
use crate::layout::{ChunkHeader, ChunkType};
use crate::persist::atomic_store_u64;
use crate::redo::{EntryKind, OperationContext, RedoOp};

pub(super) fn get_state(m: &MemoryBlock<'_>) -> MemblockState {
    let hdr = unsafe { *m.chunk_hdr() };
    if hdr.chunk_type == ChunkType::Used as u16 {
        return MemblockState::Allocated;
    }
    if hdr.chunk_type == ChunkType::Free as u16 {
        return MemblockState::Free;
    }
    MemblockState::Unknown
}

/// Add the chunk-header flag for `header_type` if it is not in place
/// yet. Only legal on a free chunk, under its bucket lock.
pub(super) fn ensure_header_type(m: &MemoryBlock<'_>, header_type: HeaderType) {
    let hdr_ptr = m.chunk_hdr();
    let hdr = unsafe { *hdr_ptr };
    if hdr.chunk_type != ChunkType::Free as u16 {
        fatal!(
            "header type change on a chunk that is not free (chunk {})",
            m.chunk_id()
        );
    }

    let flag = header_type.flag();
    if hdr.flags & flag == 0 && flag != 0 {
        let observer = m.heap().observer();
        observer.tx_add(hdr_ptr.cast(), 8);
        let value = ChunkHeader::new(ChunkType::Free, hdr.flags | flag, hdr.size_idx).to_u64();
        unsafe {
            atomic_store_u64(hdr_ptr.cast(), value);
            m.heap().p_ops().persist(hdr_ptr.cast(), 8);
        }
        observer.tx_remove(hdr_ptr.cast(), 8);
    }
}

/// Prepare the chunk-header value that moves the block to `op`.
///
/// Routed through the operation context when one is given, applied
/// directly (store + persist) otherwise. Spans longer than one chunk
/// get their transient footer scheduled after the head.
pub(super) fn prep_operation_hdr(
    m: &MemoryBlock<'_>,
    op: MemblockState,
    ctx: Option<&mut dyn OperationContext>,
) {
    let hdr_ptr = m.chunk_hdr();
    let hdr = unsafe { *hdr_ptr };

    let chunk_type = if op == MemblockState::Allocated {
        ChunkType::Used
    } else {
        ChunkType::Free
    };
    let value = ChunkHeader::new(chunk_type, hdr.flags, m.size_idx()).to_u64();

    let ctx = match ctx {
        None => {
            unsafe {
                atomic_store_u64(hdr_ptr.cast(), value);
                m.heap().p_ops().persist(hdr_ptr.cast(), 8);
            }
            None
        }
        Some(ctx) => {
            ctx.add_entry(hdr_ptr.cast(), value, RedoOp::Set);
            Some(ctx)
        }
    };

    if m.size_idx() == 1 {
        return;
    }

    let observer = m.heap().observer();
    unsafe {
        // header slots between head and footer are dead until the span
        // is split again
        observer.mark_noaccess(hdr_ptr.add(1).cast(), (m.size_idx() as usize - 1) * 8);

        let footer = hdr_ptr.add(m.size_idx() as usize - 1);
        observer.mark_undefined(footer.cast(), 8);
        let footer_value = ChunkHeader::new(ChunkType::Footer, 0, m.size_idx()).to_u64();

        // the footer is recreated at boot; it must not be replayed from
        // the redo log over what may then be a valid head
        match ctx {
            None => {
                atomic_store_u64(footer.cast(), footer_value);
                observer.set_clean(footer.cast(), 8);
            }
            Some(ctx) => {
                ctx.add_typed_entry(footer.cast(), footer_value, RedoOp::Set, EntryKind::Transient);
            }
        }
    }
}
