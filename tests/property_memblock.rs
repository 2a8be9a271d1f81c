//! Property-based tests for block-layer invariants
//!
//! Uses proptest to verify the bitmap and sizing laws hold across many
//! random block placements.

use pmheap::{BlockLocation, ChunkType, Heap, HeaderType, MemblockState, MemoryBlock};
use proptest::prelude::*;

fn run_heap(block_size: u64, header_type: HeaderType) -> Heap {
    let heap = Heap::create(4).unwrap();
    heap.init_run(0, 0, 1, block_size, 0, header_type).unwrap();
    heap
}

fn block(heap: &Heap, chunk_id: u32, block_off: u16, size_idx: u32) -> MemoryBlock<'_> {
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

/// Clamp a random (offset, span) pair so the span stays inside one
/// bitmap word, which is what the layer itself enforces.
fn clamp_span(block_off: u16, size_idx: u32) -> (u16, u32) {
    let bit = block_off as u32 % 64;
    (block_off, size_idx.min(64 - bit).max(1))
}

proptest! {
    #[test]
    fn prop_alloc_then_free_restores_bitmap(
        raw_off in 0u16..896,
        raw_size in 1u32..=64,
        occupied in prop::collection::vec((0u16..896, 1u32..=8), 0..6)
    ) {
        let heap = run_heap(256, HeaderType::None);

        // scatter some unrelated allocations first
        for (off, size) in occupied {
            let (off, size) = clamp_span(off, size);
            block(&heap, 0, off, size).prep_hdr(MemblockState::Allocated, None);
        }
        let before: Vec<u64> = bitmap(&heap);

        let (off, size) = clamp_span(raw_off, raw_size);
        let m = block(&heap, 0, off, size);
        m.prep_hdr(MemblockState::Allocated, None);

        // every bit of the span is set, every other bit is unchanged
        let after = bitmap(&heap);
        let word = off as usize / 64;
        let mask = span_mask(off, size);
        prop_assert_eq!(after[word] & mask, mask);
        for (i, (&now, &was)) in after.iter().zip(before.iter()).enumerate() {
            if i == word {
                prop_assert_eq!(now & !mask, was & !mask);
            } else {
                prop_assert_eq!(now, was);
            }
        }
        prop_assert_eq!(m.get_state(), MemblockState::Allocated);

        m.prep_hdr(MemblockState::Free, None);
        let restored = bitmap(&heap);
        let expect: Vec<u64> = before
            .iter()
            .enumerate()
            .map(|(i, &w)| if i == word { w & !mask } else { w })
            .collect();
        prop_assert_eq!(restored, expect);
        prop_assert_eq!(m.get_state(), MemblockState::Free);
    }

    #[test]
    fn prop_user_size_law(
        size_idx in 1u32..=4,
        header_kind in 0usize..3,
    ) {
        let header_type = [HeaderType::Legacy, HeaderType::Compact, HeaderType::None][header_kind];
        let heap = Heap::create(8).unwrap();
        heap.init_chunk(0, 0, ChunkType::Used, header_type.flag(), size_idx).unwrap();

        let m = block(&heap, 0, 0, size_idx);
        prop_assert_eq!(m.header_type(), header_type);
        prop_assert_eq!(
            m.get_user_size() + m.header_type().size(),
            m.get_real_size()
        );
    }

    #[test]
    fn prop_offsets_round_trip(
        raw_off in 0u16..500,
        header_kind in 0usize..3,
    ) {
        let header_type = [HeaderType::Legacy, HeaderType::Compact, HeaderType::None][header_kind];
        let heap = run_heap(512, header_type);

        let m = block(&heap, 0, raw_off, 1);
        m.write_header(0, 0);

        let off = heap.offset_of(m.get_user_data());
        let resolved = MemoryBlock::from_offset(&heap, off);

        prop_assert_eq!(resolved.zone_id(), 0);
        prop_assert_eq!(resolved.chunk_id(), 0);
        prop_assert_eq!(resolved.block_off(), raw_off);
        prop_assert_eq!(resolved.header_type(), header_type);
        prop_assert_eq!(resolved.size_idx(), 1);
    }
}

fn bitmap(heap: &Heap) -> Vec<u64> {
    let image = heap.snapshot();
    let run_off = 1024 + 64 + 8 * pmheap::layout::MAX_CHUNK + 16;
    (0..16)
        .map(|i| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&image[run_off + i * 8..run_off + i * 8 + 8]);
            u64::from_le_bytes(word)
        })
        .collect()
}

fn span_mask(block_off: u16, size_idx: u32) -> u64 {
    let bit = block_off as u32 % 64;
    if size_idx == 64 {
        u64::MAX
    } else {
        ((1u64 << size_idx) - 1) << bit
    }
}
