//! Allocation-header codec
//!
//! Three encodings of the same capability: the 64-byte legacy header,
//! the 16-byte compact header, and no header at all (size and extra are
//! implied by the block's unit size). Which one a block uses is read
//! from its chunk header's flags, never from user data.
//!
//! Writes here are relaxed non-temporal copies and do not drain; the
//! commit boundary belongs to the operation that called them.

use super::{HeaderType, MemoryBlock};
use crate::layout::{
    AllocationHeaderCompact, AllocationHeaderLegacy, ALLOC_HDR_SIZE_MASK, ALLOC_HDR_SIZE_SHIFT,
    CACHELINE_SIZE,
};
use crate::persist::{MEM_NODRAIN, MEM_NONTEMPORAL, MEM_RELAXED};

/// Offset and length of the legacy header's unused tail, kept as a red
/// zone for the memory-state observer.
const LEGACY_RED_ZONE_OFF: usize = 24;
const LEGACY_RED_ZONE_LEN: usize = 40;

/// Stored allocation size of the block.
pub(super) fn get_size(m: &MemoryBlock<'_>) -> usize {
    match m.header_type() {
        HeaderType::Legacy => unsafe {
            (*m.get_real_data().cast::<AllocationHeaderLegacy>()).size as usize
        },
        HeaderType::Compact => unsafe {
            ((*m.get_real_data().cast::<AllocationHeaderCompact>()).size & ALLOC_HDR_SIZE_MASK)
                as usize
        },
        HeaderType::None => m.block_size(),
    }
}

/// Stored extra field; header kinds without one report 0.
pub(super) fn get_extra(m: &MemoryBlock<'_>) -> u64 {
    match m.header_type() {
        HeaderType::Legacy => unsafe {
            (*m.get_real_data().cast::<AllocationHeaderLegacy>()).type_num
        },
        HeaderType::Compact => unsafe {
            (*m.get_real_data().cast::<AllocationHeaderCompact>()).extra
        },
        HeaderType::None => 0,
    }
}

/// Stored user flags; header kinds without them report 0.
pub(super) fn get_flags(m: &MemoryBlock<'_>) -> u16 {
    match m.header_type() {
        HeaderType::Legacy => unsafe {
            ((*m.get_real_data().cast::<AllocationHeaderLegacy>()).root_size
                >> ALLOC_HDR_SIZE_SHIFT) as u16
        },
        HeaderType::Compact => unsafe {
            ((*m.get_real_data().cast::<AllocationHeaderCompact>()).size >> ALLOC_HDR_SIZE_SHIFT)
                as u16
        },
        HeaderType::None => 0,
    }
}

/// Write the block's allocation header.
pub(super) fn write(m: &MemoryBlock<'_>, size: usize, extra: u64, flags: u16) {
    match m.header_type() {
        HeaderType::Legacy => write_legacy(m, size, extra, flags),
        HeaderType::Compact => write_compact(m, size, extra, flags),
        HeaderType::None => {}
    }
}

fn write_legacy(m: &MemoryBlock<'_>, size: usize, extra: u64, flags: u16) {
    let hdr = AllocationHeaderLegacy {
        size: size as u64,
        type_num: extra,
        root_size: (flags as u64) << ALLOC_HDR_SIZE_SHIFT,
        unused: [0; LEGACY_RED_ZONE_LEN],
    };

    let hdrp = m.get_real_data();
    let observer = m.heap().observer();
    observer.mark_undefined(hdrp, AllocationHeaderLegacy::SIZE);
    observer.tx_add(hdrp, AllocationHeaderLegacy::SIZE);
    unsafe {
        m.heap().p_ops().memcpy(
            hdrp,
            (&hdr as *const AllocationHeaderLegacy).cast(),
            AllocationHeaderLegacy::SIZE,
            MEM_NONTEMPORAL | MEM_NODRAIN | MEM_RELAXED,
        );
    }
    observer.tx_remove(hdrp, AllocationHeaderLegacy::SIZE);

    // the unused tail of the legacy header doubles as a red zone
    unsafe {
        observer.mark_noaccess(hdrp.add(LEGACY_RED_ZONE_OFF), LEGACY_RED_ZONE_LEN);
    }
}

fn write_compact(m: &MemoryBlock<'_>, size: usize, extra: u64, flags: u16) {
    let mut padded = [0u8; CACHELINE_SIZE];
    padded[..8].copy_from_slice(
        &(size as u64 | ((flags as u64) << ALLOC_HDR_SIZE_SHIFT)).to_le_bytes(),
    );
    padded[8..16].copy_from_slice(&extra.to_le_bytes());

    let hdrp = m.get_real_data();
    let observer = m.heap().observer();
    observer.mark_undefined(hdrp, AllocationHeaderCompact::SIZE);

    // Writing the full cache line (when the block can absorb it) lets
    // the copy avoid a read-modify-write on a partial line. Only the 16
    // header bytes are logically modified.
    let mut write_len = AllocationHeaderCompact::SIZE;
    if hdrp as usize % CACHELINE_SIZE == 0 && size >= CACHELINE_SIZE {
        write_len = CACHELINE_SIZE;
    }

    observer.tx_add(hdrp, write_len);
    unsafe {
        m.heap().p_ops().memcpy(
            hdrp,
            padded.as_ptr(),
            write_len,
            MEM_NONTEMPORAL | MEM_NODRAIN | MEM_RELAXED,
        );
        if write_len > AllocationHeaderCompact::SIZE {
            observer.mark_undefined(
                hdrp.add(AllocationHeaderCompact::SIZE),
                write_len - AllocationHeaderCompact::SIZE,
            );
        }
    }
    observer.tx_remove(hdrp, write_len);
}

/// Tell the observer the header bytes are in sync with media.
pub(super) fn invalidate(m: &MemoryBlock<'_>) {
    match m.header_type() {
        HeaderType::Legacy => m
            .heap()
            .observer()
            .set_clean(m.get_real_data(), AllocationHeaderLegacy::SIZE),
        HeaderType::Compact => m
            .heap()
            .observer()
            .set_clean(m.get_real_data(), AllocationHeaderCompact::SIZE),
        HeaderType::None => {}
    }
}

/// Refresh observer state of the header after a heap restart.
pub(super) fn reinit(m: &MemoryBlock<'_>) {
    match m.header_type() {
        HeaderType::Legacy => {
            let hdrp = m.get_real_data();
            let observer = m.heap().observer();
            observer.mark_defined(hdrp, AllocationHeaderLegacy::SIZE);
            unsafe {
                observer.mark_noaccess(hdrp.add(LEGACY_RED_ZONE_OFF), LEGACY_RED_ZONE_LEN);
            }
        }
        HeaderType::Compact => m
            .heap()
            .observer()
            .mark_defined(m.get_real_data(), AllocationHeaderCompact::SIZE),
        HeaderType::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BlockLocation, MemoryBlock};
    use super::*;
    use crate::heap::Heap;
    use crate::layout::{ChunkType, CHUNK_FLAG_COMPACT_HEADER, CHUNK_FLAG_HEADER_NONE};

    fn huge_block(heap: &Heap, chunk_id: u32, size_idx: u32) -> MemoryBlock<'_> {
        MemoryBlock::rebuild_state(
            heap,
            BlockLocation {
                zone_id: 0,
                chunk_id,
                block_off: 0,
                size_idx,
            },
        )
    }

    #[test]
    fn test_legacy_round_trip() {
        let heap = Heap::create(4).unwrap();
        heap.init_chunk(0, 0, ChunkType::Used, 0, 2).unwrap();

        let m = huge_block(&heap, 0, 2);
        assert_eq!(m.header_type(), HeaderType::Legacy);

        m.write_header(0xfeed, 0x0021);
        assert_eq!(get_size(&m), m.get_real_size());
        assert_eq!(m.get_extra(), 0xfeed);
        assert_eq!(m.get_flags(), 0x0021);
    }

    #[test]
    fn test_compact_round_trip_and_packing() {
        let heap = Heap::create(4).unwrap();
        heap.init_chunk(0, 1, ChunkType::Used, CHUNK_FLAG_COMPACT_HEADER, 1)
            .unwrap();

        let m = huge_block(&heap, 1, 1);
        assert_eq!(m.header_type(), HeaderType::Compact);

        m.write_header(0xdead_beef, 0x0042);
        assert_eq!(m.get_extra(), 0xdead_beef);
        assert_eq!(m.get_flags(), 0x0042);
        assert_eq!(get_size(&m), m.get_real_size());

        // packed media image: size | flags << 48, then extra
        unsafe {
            let hdr = &*m.get_real_data().cast::<AllocationHeaderCompact>();
            assert_eq!(
                hdr.size,
                m.get_real_size() as u64 | (0x0042u64 << ALLOC_HDR_SIZE_SHIFT)
            );
            assert_eq!(hdr.extra, 0xdead_beef);
        }
    }

    #[test]
    fn test_none_header_reads_unit_size() {
        let heap = Heap::create(4).unwrap();
        heap.init_chunk(0, 2, ChunkType::Used, CHUNK_FLAG_HEADER_NONE, 1)
            .unwrap();

        let m = huge_block(&heap, 2, 1);
        assert_eq!(m.header_type(), HeaderType::None);

        // a write is a no-op and the getters report implied values
        m.write_header(0x1234, 0x7);
        assert_eq!(m.get_extra(), 0);
        assert_eq!(m.get_flags(), 0);
        assert_eq!(get_size(&m), m.block_size());
        assert_eq!(m.get_user_data(), m.get_real_data());
    }

    #[test]
    fn test_compact_flags_do_not_leak_into_size() {
        let heap = Heap::create(4).unwrap();
        heap.init_run(0, 3, 1, 4096, 0, HeaderType::Compact).unwrap();

        let m = MemoryBlock::rebuild_state(
            &heap,
            BlockLocation {
                zone_id: 0,
                chunk_id: 3,
                block_off: 2,
                size_idx: 1,
            },
        );
        m.write_header(1, 0xffff);
        assert_eq!(get_size(&m), 4096);
        assert_eq!(m.get_flags(), 0xffff);
    }

    #[test]
    fn test_invalidate_and_reinit_do_not_clobber() {
        let heap = Heap::create(4).unwrap();
        heap.init_chunk(0, 0, ChunkType::Used, 0, 1).unwrap();

        let m = huge_block(&heap, 0, 1);
        m.write_header(0xabc, 0x1);
        m.invalidate();
        m.reinit_header();
        assert_eq!(m.get_extra(), 0xabc);
        assert_eq!(m.get_flags(), 0x1);
    }
}
