//! Run-block operations
//!
//! A run block is `size_idx` consecutive bits of its run's bitmap, with
//! clear meaning free and set meaning allocated — the reverse of the
//! usual scheme. A block never crosses a bitmap word, so every state
//! change is a single masked 64-bit update, either staged on the
//! operation context or applied directly under the run's lock.

use super::{HeaderType, MemblockState, MemoryBlock};
use crate::error::fatal;
use crate::layout::{align_up, ChunkType, BITS_PER_VALUE, CHUNK_FLAG_ALIGNED, RUN_METASIZE};
use crate::persist::{atomic_load_u64, atomic_store_u64};
use crate::redo::{OperationContext, RedoOp};

pub(super) fn block_size(m: &MemoryBlock<'_>) -> usize {
    let block_size = unsafe { (*m.chunk_run()).block_size };
    if block_size == 0 {
        fatal!("uninitialized run at chunk {}", m.chunk_id());
    }
    block_size as usize
}

/// Bytes between the run's data area and its first block.
///
/// Aligned runs place the *user data* of each allocation on a multiple
/// of the run's alignment; since allocations carry headers, the first
/// block starts `header_size` before such a boundary. The gap this
/// leaves after the run metadata is padding, never an allocation.
pub(crate) fn run_alignment_padding(
    data: *mut u8,
    flags: u16,
    alignment: u64,
    header_size: usize,
) -> usize {
    if flags & CHUNK_FLAG_ALIGNED == 0 {
        return 0;
    }
    if alignment == 0 {
        fatal!("aligned run with zero alignment");
    }
    let base = data as usize + header_size;
    align_up(base, alignment as usize) - header_size - data as usize
}

pub(super) fn get_real_data(m: &MemoryBlock<'_>) -> *mut u8 {
    let run = m.chunk_run();
    let unit_size = block_size(m);
    unsafe {
        let data = run.cast::<u8>().add(RUN_METASIZE);
        let padding = run_alignment_padding(
            data,
            (*m.chunk_hdr()).flags,
            (*run).alignment,
            m.header_type().size(),
        );
        data.add(padding + unit_size * m.block_off() as usize)
    }
}

fn bitmap_word(m: &MemoryBlock<'_>, bpos: usize) -> *mut u64 {
    unsafe {
        std::ptr::addr_of_mut!((*m.chunk_run()).bitmap)
            .cast::<u64>()
            .add(bpos)
    }
}

/// Word index and mask covering `[block_off, block_off + size_idx)`.
fn bitmap_position(m: &MemoryBlock<'_>) -> (usize, u64) {
    let size_idx = m.size_idx() as usize;
    if size_idx > BITS_PER_VALUE {
        fatal!("run block spans {size_idx} bits, limit is {BITS_PER_VALUE}");
    }

    let bpos = m.block_off() as usize / BITS_PER_VALUE;
    let bit = m.block_off() as usize % BITS_PER_VALUE;

    let bmask = if size_idx == BITS_PER_VALUE {
        if bit != 0 {
            fatal!("full-word run block must start on a word boundary");
        }
        u64::MAX
    } else {
        if bit + size_idx > BITS_PER_VALUE {
            fatal!("run block crosses a bitmap word boundary");
        }
        ((1u64 << size_idx) - 1) << bit
    };

    (bpos, bmask)
}

pub(super) fn get_state(m: &MemoryBlock<'_>) -> MemblockState {
    debug_assert_eq!(
        unsafe { (*m.chunk_hdr()).chunk_type },
        ChunkType::Run as u16
    );

    let (bpos, bmask) = bitmap_position(m);
    let word = unsafe { atomic_load_u64(bitmap_word(m, bpos)) };

    // any set bit means the range cannot be handed out: clear = free
    if word & bmask != 0 {
        MemblockState::Allocated
    } else {
        MemblockState::Free
    }
}

/// Runs are created with their header flag already in place; there is
/// nothing to upgrade.
pub(super) fn ensure_header_type(m: &MemoryBlock<'_>, header_type: HeaderType) {
    debug_assert_eq!(
        unsafe { (*m.chunk_hdr()).chunk_type },
        ChunkType::Run as u16
    );
    debug_assert_eq!(
        unsafe { (*m.chunk_hdr()).flags } & header_type.flag(),
        header_type.flag()
    );
}

/// Prepare the masked bitmap update that moves the block to `op`.
///
/// The targeted word must not change between this call and the commit
/// of the operation context; the run lock serializes that window.
pub(super) fn prep_operation_hdr(
    m: &MemoryBlock<'_>,
    op: MemblockState,
    ctx: Option<&mut dyn OperationContext>,
) {
    let (bpos, bmask) = bitmap_position(m);
    let word = bitmap_word(m, bpos);

    let (value, redo_op) = match op {
        MemblockState::Allocated => (bmask, RedoOp::Or),
        MemblockState::Free => (!bmask, RedoOp::And),
        MemblockState::Unknown => {
            fatal!("run blocks can only be moved to allocated or free")
        }
    };

    match ctx {
        Some(ctx) => ctx.add_entry(word, value, redo_op),
        None => unsafe {
            let current = atomic_load_u64(word);
            let next = match redo_op {
                RedoOp::Or => current | value,
                RedoOp::And => current & value,
                RedoOp::Set => unreachable!(),
            };
            atomic_store_u64(word, next);
            m.heap().p_ops().persist(word.cast(), 8);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BlockLocation, MemoryBlock};
    use super::*;
    use crate::heap::Heap;
    use crate::redo::{EntryKind, RedoBuffer, RedoEntry};

    fn run_block(heap: &Heap, chunk_id: u32, block_off: u16, size_idx: u32) -> MemoryBlock<'_> {
        MemoryBlock::rebuild_state(
            heap,
            BlockLocation {
                zone_id: 0,
                chunk_id,
                block_off,
                size_idx,
            },
        )
    }

    fn run_heap(block_size: u64) -> Heap {
        let heap = Heap::create(4).unwrap();
        heap.init_run(0, 0, 1, block_size, 0, HeaderType::None)
            .unwrap();
        heap
    }

    #[test]
    fn test_prep_hdr_masks() {
        let heap = run_heap(256);
        let m = run_block(&heap, 0, 10, 4);

        let mut ctx = RedoBuffer::new();
        m.prep_hdr(MemblockState::Allocated, Some(&mut ctx));
        m.prep_hdr(MemblockState::Free, Some(&mut ctx));

        let word = bitmap_word(&m, 0);
        assert_eq!(
            ctx.entries(),
            &[
                RedoEntry {
                    addr: word,
                    value: 0xf << 10,
                    op: RedoOp::Or,
                    kind: EntryKind::Persistent,
                },
                RedoEntry {
                    addr: word,
                    value: !(0xf << 10),
                    op: RedoOp::And,
                    kind: EntryKind::Persistent,
                },
            ]
        );
    }

    #[test]
    fn test_prep_hdr_selects_bitmap_word() {
        let heap = run_heap(256);
        let m = run_block(&heap, 0, 64 + 3, 2);

        let mut ctx = RedoBuffer::new();
        m.prep_hdr(MemblockState::Allocated, Some(&mut ctx));
        assert_eq!(ctx.entries()[0].addr, bitmap_word(&m, 1));
        assert_eq!(ctx.entries()[0].value, 0x3 << 3);
    }

    #[test]
    fn test_full_word_block() {
        let heap = run_heap(256);
        let m = run_block(&heap, 0, 0, 64);

        let mut ctx = RedoBuffer::new();
        m.prep_hdr(MemblockState::Allocated, Some(&mut ctx));
        ctx.process(heap.p_ops());

        unsafe {
            assert_eq!((*heap.chunk_run(0, 0)).bitmap[0], u64::MAX);
        }
        assert_eq!(m.get_state(), MemblockState::Allocated);

        m.prep_hdr(MemblockState::Free, Some(&mut ctx));
        ctx.process(heap.p_ops());
        assert_eq!(m.get_state(), MemblockState::Free);
    }

    #[test]
    #[should_panic(expected = "word boundary")]
    fn test_full_word_block_must_be_word_aligned() {
        let heap = run_heap(256);
        run_block(&heap, 0, 1, 64).prep_hdr(MemblockState::Allocated, None);
    }

    #[test]
    #[should_panic(expected = "crosses a bitmap word")]
    fn test_block_may_not_cross_words() {
        let heap = run_heap(256);
        run_block(&heap, 0, 60, 8).prep_hdr(MemblockState::Allocated, None);
    }

    #[test]
    #[should_panic(expected = "limit is 64")]
    fn test_block_span_is_capped() {
        let heap = run_heap(256);
        run_block(&heap, 0, 0, 65).prep_hdr(MemblockState::Allocated, None);
    }

    #[test]
    #[should_panic(expected = "allocated or free")]
    fn test_prep_hdr_rejects_unknown() {
        let heap = run_heap(256);
        run_block(&heap, 0, 0, 1).prep_hdr(MemblockState::Unknown, None);
    }

    #[test]
    fn test_direct_prep_round_trips_bitmap() {
        let heap = run_heap(512);
        let m = run_block(&heap, 0, 7, 3);

        let before = unsafe { (*heap.chunk_run(0, 0)).bitmap[0] };
        m.prep_hdr(MemblockState::Allocated, None);
        assert_eq!(m.get_state(), MemblockState::Allocated);
        unsafe {
            assert_eq!((*heap.chunk_run(0, 0)).bitmap[0], before | (0x7 << 7));
        }

        m.prep_hdr(MemblockState::Free, None);
        assert_eq!(m.get_state(), MemblockState::Free);
        assert_eq!(unsafe { (*heap.chunk_run(0, 0)).bitmap[0] }, before);
    }

    #[test]
    fn test_neighbour_bits_are_untouched() {
        let heap = run_heap(512);
        run_block(&heap, 0, 0, 2).prep_hdr(MemblockState::Allocated, None);
        run_block(&heap, 0, 5, 1).prep_hdr(MemblockState::Allocated, None);

        run_block(&heap, 0, 2, 3).prep_hdr(MemblockState::Allocated, None);
        run_block(&heap, 0, 2, 3).prep_hdr(MemblockState::Free, None);

        unsafe {
            assert_eq!((*heap.chunk_run(0, 0)).bitmap[0], 0b100011);
        }
    }

    #[test]
    fn test_mixed_range_reads_allocated() {
        let heap = run_heap(512);
        run_block(&heap, 0, 1, 1).prep_hdr(MemblockState::Allocated, None);

        // [0, 4) covers one set and three clear bits
        assert_eq!(
            run_block(&heap, 0, 0, 4).get_state(),
            MemblockState::Allocated
        );
        assert_eq!(run_block(&heap, 0, 2, 2).get_state(), MemblockState::Free);
    }

    #[test]
    fn test_alignment_padding_arithmetic() {
        // compact header (16 B) in front of 64-aligned user data
        let data = 24 as *mut u8;
        for (alignment, want) in [(64u64, 24usize), (128, 88), (4096, 4056)] {
            let padding = run_alignment_padding(data, CHUNK_FLAG_ALIGNED, alignment, 16);
            assert_eq!(padding, want, "alignment {alignment}");
            assert_eq!((data as usize + padding + 16) % alignment as usize, 0);
        }

        // unaligned runs have no padding
        assert_eq!(run_alignment_padding(data, 0, 64, 16), 0);
    }

    #[test]
    fn test_aligned_run_user_data_is_aligned() {
        let heap = Heap::create(4).unwrap();
        for alignment in [64u64, 128, 4096] {
            heap.init_run(0, 0, 1, 4096, alignment, HeaderType::Compact)
                .unwrap();
            for block_off in [0u16, 1, 5] {
                let m = run_block(&heap, 0, block_off, 1);
                assert_eq!(
                    m.get_user_data() as usize % alignment as usize,
                    0,
                    "alignment {alignment} block {block_off}"
                );
            }
        }
    }

    #[test]
    fn test_lock_is_the_heap_run_lock() {
        let heap = run_heap(256);
        let m = run_block(&heap, 0, 0, 1);
        assert!(std::ptr::eq(
            m.get_lock().unwrap(),
            heap.run_lock(m.chunk_id())
        ));
    }

    #[test]
    #[should_panic(expected = "uninitialized run")]
    fn test_zero_block_size_is_fatal() {
        let heap = Heap::create(2).unwrap();
        // forge a run head over an unformatted chunk
        unsafe {
            crate::persist::atomic_store_u64(
                heap.chunk_hdr(0, 0).cast(),
                crate::layout::ChunkHeader::new(ChunkType::Run, 0, 1).to_u64(),
            );
        }
        let _ = run_block(&heap, 0, 0, 1).get_real_data();
    }
}
