//! Pool-backed heap runtime
//!
//! Owns (or borrows) the pool mapping and provides everything the block
//! layer needs around it: zone/chunk addressing, the run-lock table,
//! persistence and observer plumbing, pool formatting and boot. The
//! transactional allocator sitting above composes these pieces; this
//! module never decides *what* to allocate, only where the bytes and
//! locks live.

use crate::error::{fatal, HeapError, Result};
use crate::layout::{
    max_zone, ChunkHeader, ChunkRun, ChunkType, HeapHeader, Zone, CHUNKSIZE, CHUNK_FLAG_ALIGNED,
    HEAP_HEADER_SIZE, HEAP_MAJOR, HEAP_MINOR, HEAP_SIGNATURE, MAX_BITMAP_VALUES, MAX_CHUNK,
    RUN_BITMAP_SIZE, RUN_METASIZE, ZONE0_OFFSET, ZONE_HEADER_MAGIC, ZONE_MAX_SIZE, ZONE_MIN_SIZE,
};
use crate::memblock::HeaderType;
use crate::observer::{MemoryObserver, NoopObserver};
use crate::persist::{atomic_store_u64, PersistOps, VolatileOps};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::mem::size_of;
use std::ptr::NonNull;

/// Alignment of the pool mapping.
const POOL_ALIGNMENT: usize = 4096;

/// Size of the per-heap run-lock table; locks are shared by chunk id
/// modulo this.
const MAX_RUN_LOCKS: usize = 1024;

struct PoolMem {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

impl Drop for PoolMem {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                let layout =
                    std::alloc::Layout::from_size_align_unchecked(self.len, POOL_ALIGNMENT);
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

/// The heap runtime over one pool.
pub struct Heap {
    mem: PoolMem,
    p_ops: Box<dyn PersistOps>,
    observer: Box<dyn MemoryObserver>,
    run_locks: Box<[Mutex<()>]>,
    zones: u32,
}

// All pool mutation goes through relaxed atomics on 8-byte-aligned words
// or through regions serialized by the run locks / the owning bucket, so
// sharing the raw base pointer across threads is sound.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

/// Builder for freshly formatted, memory-backed pools.
///
/// Pools created here live on DRAM the crate allocates itself; real
/// persistent mappings enter through [`Heap::open_image`] or
/// [`Heap::open_raw`].
pub struct HeapBuilder {
    chunks: u32,
    p_ops: Box<dyn PersistOps>,
    observer: Box<dyn MemoryObserver>,
}

impl HeapBuilder {
    pub fn new() -> Self {
        HeapBuilder {
            chunks: 8,
            p_ops: Box::new(VolatileOps),
            observer: Box::new(NoopObserver),
        }
    }

    /// Number of chunks backing zone 0.
    pub fn chunks(mut self, chunks: u32) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn persist_ops(mut self, p_ops: Box<dyn PersistOps>) -> Self {
        self.p_ops = p_ops;
        self
    }

    pub fn observer(mut self, observer: Box<dyn MemoryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Allocate and format the pool.
    pub fn build(self) -> Result<Heap> {
        if self.chunks == 0 || self.chunks as usize > MAX_CHUNK {
            return Err(HeapError::InvalidChunkSpan {
                chunk_id: 0,
                size_idx: self.chunks,
            });
        }

        let size = HEAP_HEADER_SIZE + size_of::<Zone>() + self.chunks as usize * CHUNKSIZE;
        let layout = std::alloc::Layout::from_size_align(size, POOL_ALIGNMENT)
            .expect("pool layout is always valid");
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };

        let heap = Heap {
            mem: PoolMem {
                ptr,
                len: size,
                owned: true,
            },
            p_ops: self.p_ops,
            observer: self.observer,
            run_locks: new_run_locks(),
            zones: 1,
        };
        heap.format(self.chunks);
        Ok(heap)
    }
}

impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn new_run_locks() -> Box<[Mutex<()>]> {
    (0..MAX_RUN_LOCKS)
        .map(|_| Mutex::new(()))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

/// Truncated SHA-256 over the header bytes, checksum field excluded.
fn header_checksum(header_bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(&header_bytes[..HEAP_HEADER_SIZE - size_of::<u64>()]);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

impl Heap {
    /// Create a freshly formatted pool with `chunks` chunks in zone 0,
    /// backed by DRAM with no-op persistence.
    pub fn create(chunks: u32) -> Result<Heap> {
        HeapBuilder::new().chunks(chunks).build()
    }

    /// Open a pool from a borrowed mapping.
    ///
    /// Validates the heap header and boots every zone (type check plus
    /// footer rebuild). The mapping is not freed on drop.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the returned heap, aligned to 4096, and not accessed
    /// through any other path while the heap is live.
    pub unsafe fn open_raw(
        ptr: *mut u8,
        len: usize,
        p_ops: Box<dyn PersistOps>,
        observer: Box<dyn MemoryObserver>,
    ) -> Result<Heap> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(HeapError::PoolTooSmall { got: 0, need: len });
        };
        let heap = Heap {
            mem: PoolMem {
                ptr,
                len,
                owned: false,
            },
            p_ops,
            observer,
            run_locks: new_run_locks(),
            zones: 0,
        };
        heap.validate_and_boot()
    }

    /// Open a pool from a byte image, e.g. one read back from a file.
    ///
    /// The image is copied into a pool-aligned allocation owned by the
    /// heap, then validated and booted like any other pool.
    pub fn open_image(image: &[u8]) -> Result<Heap> {
        let need = HEAP_HEADER_SIZE + ZONE_MIN_SIZE;
        if image.len() < need {
            return Err(HeapError::PoolTooSmall {
                got: image.len(),
                need,
            });
        }
        let layout = std::alloc::Layout::from_size_align(image.len(), POOL_ALIGNMENT)
            .expect("pool layout is always valid");
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        unsafe {
            std::ptr::copy_nonoverlapping(image.as_ptr(), ptr.as_ptr(), image.len());
        }
        let heap = Heap {
            mem: PoolMem {
                ptr,
                len: image.len(),
                owned: true,
            },
            p_ops: Box::new(VolatileOps),
            observer: Box::new(NoopObserver),
            run_locks: new_run_locks(),
            zones: 0,
        };
        heap.validate_and_boot()
    }

    /// Copy of the current pool bytes, suitable for writing to a file.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.mem.len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base(), image.as_mut_ptr(), self.mem.len);
        }
        image
    }

    fn format(&self, chunks: u32) {
        let base = self.base();
        unsafe {
            let mut header = HeapHeader {
                signature: HEAP_SIGNATURE,
                major: HEAP_MAJOR,
                minor: HEAP_MINOR,
                unused: 0,
                chunksize: CHUNKSIZE as u64,
                chunks_per_zone: MAX_CHUNK as u64,
                reserved: [0; 960],
                checksum: 0,
            };
            let header_bytes = std::slice::from_raw_parts(
                (&header as *const HeapHeader).cast::<u8>(),
                HEAP_HEADER_SIZE,
            );
            header.checksum = header_checksum(header_bytes);
            std::ptr::write(base.cast::<HeapHeader>(), header);

            let zone = self.zone_ptr(0);
            (*zone).header.magic = ZONE_HEADER_MAGIC;
            (*zone).header.size_idx = chunks;

            // one free span covering the whole zone, footer rebuilt at
            // every boot anyway
            atomic_store_u64(
                self.chunk_hdr(0, 0).cast(),
                ChunkHeader::new(ChunkType::Free, 0, chunks).to_u64(),
            );
            if chunks > 1 {
                self.write_chunk_footer(0, 0, chunks);
            }

            self.p_ops.persist(base, self.mem.len);
        }
        self.p_ops.drain();
        tracing::info!(chunks, size = self.mem.len, "formatted pool");
    }

    fn validate_and_boot(mut self) -> Result<Heap> {
        let need = HEAP_HEADER_SIZE + ZONE_MIN_SIZE;
        if self.mem.len < need {
            return Err(HeapError::PoolTooSmall {
                got: self.mem.len,
                need,
            });
        }

        let header = unsafe { &*self.base().cast::<HeapHeader>() };
        if header.signature != HEAP_SIGNATURE {
            return Err(HeapError::InvalidSignature);
        }
        if header.major != HEAP_MAJOR {
            return Err(HeapError::UnsupportedVersion {
                major: header.major,
                minor: header.minor,
            });
        }
        if header.chunksize != CHUNKSIZE as u64 {
            return Err(HeapError::InvalidChunkSize(header.chunksize));
        }
        if header.checksum != 0 {
            let header_bytes =
                unsafe { std::slice::from_raw_parts(self.base(), HEAP_HEADER_SIZE) };
            if header.checksum != header_checksum(header_bytes) {
                return Err(HeapError::ChecksumMismatch);
            }
        } else {
            tracing::warn!("pool header carries no checksum, skipping verification");
        }

        self.zones = max_zone(self.mem.len - HEAP_HEADER_SIZE);
        for zone_id in 0..self.zones {
            self.boot_zone(zone_id)?;
        }
        Ok(self)
    }

    /// Walk one zone's chunk headers: validate the types and rebuild
    /// the transient footers, which are never trusted from media.
    fn boot_zone(&self, zone_id: u32) -> Result<()> {
        let zone = self.zone_ptr(zone_id);
        let magic = unsafe { (*zone).header.magic };
        if magic == 0 {
            // zone was never formatted
            return Ok(());
        }
        if magic != ZONE_HEADER_MAGIC {
            return Err(HeapError::InvalidZoneMagic(magic));
        }

        let nchunks = unsafe { (*zone).header.size_idx };
        let mut chunk_id = 0u32;
        while chunk_id < nchunks {
            let hdr = unsafe { *self.chunk_hdr(zone_id, chunk_id) };
            if hdr.size_idx == 0 || chunk_id.saturating_add(hdr.size_idx) > nchunks {
                fatal!("possible zone chunks metadata corruption");
            }
            match ChunkType::from_u16(hdr.chunk_type) {
                Some(ChunkType::Free) | Some(ChunkType::Used) => {
                    if hdr.size_idx > 1 {
                        self.write_chunk_footer(zone_id, chunk_id, hdr.size_idx);
                    }
                }
                Some(ChunkType::Run) => {
                    let run = self.chunk_run(zone_id, chunk_id);
                    if unsafe { (*run).block_size } == 0 {
                        fatal!("uninitialized run at zone {zone_id} chunk {chunk_id}");
                    }
                }
                // footers and run data are skipped over by their head's
                // span; hitting one here means the spans are broken
                _ => fatal!("possible zone chunks metadata corruption"),
            }
            chunk_id += hdr.size_idx;
        }
        Ok(())
    }

    /// Rewrite the footer of a multi-chunk span and retire the header
    /// slots in between. The footer is transient: stored, marked clean,
    /// never persisted here.
    pub(crate) fn write_chunk_footer(&self, zone_id: u32, chunk_id: u32, size_idx: u32) {
        let head = self.chunk_hdr(zone_id, chunk_id);
        unsafe {
            let footer = head.add(size_idx as usize - 1);
            self.observer
                .mark_noaccess(head.add(1).cast(), (size_idx as usize - 1) * 8);
            self.observer.mark_undefined(footer.cast(), 8);
            atomic_store_u64(
                footer.cast(),
                ChunkHeader::new(ChunkType::Footer, 0, size_idx).to_u64(),
            );
            self.observer.set_clean(footer.cast(), 8);
        }
    }

    /// Carve a huge chunk span out of a zone: writes the head header
    /// (and transient footer) directly, bypassing any operation context.
    /// `chunk_type` must be `Free` or `Used`.
    pub fn init_chunk(
        &self,
        zone_id: u32,
        chunk_id: u32,
        chunk_type: ChunkType,
        flags: u16,
        size_idx: u32,
    ) -> Result<()> {
        if !matches!(chunk_type, ChunkType::Free | ChunkType::Used) {
            fatal!("huge chunk state must be free or used, got {chunk_type:?}");
        }
        if size_idx == 0 || chunk_id.saturating_add(size_idx) > self.zone_size_idx(zone_id) {
            return Err(HeapError::InvalidChunkSpan { chunk_id, size_idx });
        }

        let hdr = self.chunk_hdr(zone_id, chunk_id);
        unsafe {
            atomic_store_u64(
                hdr.cast(),
                ChunkHeader::new(chunk_type, flags, size_idx).to_u64(),
            );
            self.p_ops.persist(hdr.cast(), 8);
        }
        if size_idx > 1 {
            self.write_chunk_footer(zone_id, chunk_id, size_idx);
        }
        Ok(())
    }

    /// Format a run over `size_idx` chunks: run metadata, primed bitmap,
    /// back-referencing data headers, and finally the run head header.
    ///
    /// The bitmap is primed all-set, then the usable block prefix is
    /// cleared; trailing bits that map past the run's capacity stay set
    /// so they can never be handed out.
    pub fn init_run(
        &self,
        zone_id: u32,
        chunk_id: u32,
        size_idx: u32,
        block_size: u64,
        alignment: u64,
        header_type: HeaderType,
    ) -> Result<()> {
        if size_idx == 0 || chunk_id.saturating_add(size_idx) > self.zone_size_idx(zone_id) {
            return Err(HeapError::InvalidChunkSpan { chunk_id, size_idx });
        }
        let usable = size_idx as usize * CHUNKSIZE - RUN_METASIZE;
        if block_size == 0 || block_size % 8 != 0 || block_size as usize > usable {
            return Err(HeapError::InvalidBlockSize(block_size));
        }
        if alignment != 0 && (!alignment.is_power_of_two() || block_size % alignment != 0) {
            return Err(HeapError::InvalidAlignment(alignment));
        }

        let mut flags = header_type.flag();
        if alignment != 0 {
            flags |= CHUNK_FLAG_ALIGNED;
        }

        let run = self.chunk_run(zone_id, chunk_id);
        unsafe {
            self.observer.tx_add(run.cast(), RUN_METASIZE);
            (*run).block_size = block_size;
            (*run).alignment = alignment;

            let data = run.cast::<u8>().add(RUN_METASIZE);
            let padding = crate::memblock::run_alignment_padding(
                data,
                flags,
                alignment,
                header_type.size(),
            );
            let nblocks =
                ((usable - padding) / block_size as usize).min(RUN_BITMAP_SIZE);

            let bitmap = std::ptr::addr_of_mut!((*run).bitmap).cast::<u64>();
            for word in 0..MAX_BITMAP_VALUES {
                std::ptr::write(bitmap.add(word), u64::MAX);
            }
            let full_words = nblocks / 64;
            for word in 0..full_words {
                std::ptr::write(bitmap.add(word), 0);
            }
            let tail_bits = nblocks % 64;
            if tail_bits != 0 {
                std::ptr::write(bitmap.add(full_words), !((1u64 << tail_bits) - 1));
            }
            self.observer.tx_remove(run.cast(), RUN_METASIZE);
            self.p_ops.persist(run.cast(), RUN_METASIZE);

            // data chunks back-reference the head by distance
            for i in 1..size_idx {
                let data_hdr = self.chunk_hdr(zone_id, chunk_id + i);
                self.observer.mark_undefined(data_hdr.cast(), 8);
                atomic_store_u64(
                    data_hdr.cast(),
                    ChunkHeader::new(ChunkType::RunData, 0, i).to_u64(),
                );
            }
            if size_idx > 1 {
                self.p_ops.persist(
                    self.chunk_hdr(zone_id, chunk_id + 1).cast(),
                    (size_idx as usize - 1) * 8,
                );
            }

            // the head is published last so a torn format never looks
            // like a valid run
            let head = self.chunk_hdr(zone_id, chunk_id);
            atomic_store_u64(
                head.cast(),
                ChunkHeader::new(ChunkType::Run, flags, size_idx).to_u64(),
            );
            self.p_ops.persist(head.cast(), 8);
        }
        self.p_ops.drain();
        Ok(())
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.mem.ptr.as_ptr()
    }

    pub fn pool_size(&self) -> usize {
        self.mem.len
    }

    pub fn zones(&self) -> u32 {
        self.zones
    }

    /// Number of chunks backing a zone, from its on-media header.
    pub fn zone_size_idx(&self, zone_id: u32) -> u32 {
        unsafe { (*self.zone_ptr(zone_id)).header.size_idx }
    }

    pub(crate) fn zone_ptr(&self, zone_id: u32) -> *mut Zone {
        if zone_id >= self.zones {
            fatal!("zone id {zone_id} out of bounds ({} zones)", self.zones);
        }
        unsafe {
            self.base()
                .add(ZONE0_OFFSET + zone_id as usize * ZONE_MAX_SIZE)
                .cast()
        }
    }

    /// Chunk header slot of `(zone_id, chunk_id)`.
    pub(crate) fn chunk_hdr(&self, zone_id: u32, chunk_id: u32) -> *mut ChunkHeader {
        if chunk_id as usize >= MAX_CHUNK {
            fatal!("chunk id {chunk_id} out of bounds");
        }
        unsafe {
            std::ptr::addr_of_mut!((*self.zone_ptr(zone_id)).chunk_headers)
                .cast::<ChunkHeader>()
                .add(chunk_id as usize)
        }
    }

    /// First data byte of `(zone_id, chunk_id)`.
    pub(crate) fn chunk_data(&self, zone_id: u32, chunk_id: u32) -> *mut u8 {
        if chunk_id as usize >= MAX_CHUNK {
            fatal!("chunk id {chunk_id} out of bounds");
        }
        unsafe {
            self.zone_ptr(zone_id)
                .cast::<u8>()
                .add(size_of::<Zone>() + chunk_id as usize * CHUNKSIZE)
        }
    }

    /// Run metadata of the run headed at `(zone_id, chunk_id)`.
    pub(crate) fn chunk_run(&self, zone_id: u32, chunk_id: u32) -> *mut ChunkRun {
        self.chunk_data(zone_id, chunk_id).cast()
    }

    /// The runtime mutex serializing run-bitmap updates for `chunk_id`.
    pub fn run_lock(&self, chunk_id: u32) -> &Mutex<()> {
        &self.run_locks[chunk_id as usize % MAX_RUN_LOCKS]
    }

    /// Pool offset of a pointer into the pool.
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        (ptr as usize - self.base() as usize) as u64
    }

    /// Pointer at a pool offset.
    pub fn ptr_at(&self, offset: u64) -> *mut u8 {
        if offset as usize >= self.mem.len {
            fatal!("offset {offset:#x} out of pool bounds");
        }
        unsafe { self.base().add(offset as usize) }
    }

    pub fn p_ops(&self) -> &dyn PersistOps {
        &*self.p_ops
    }

    pub(crate) fn observer(&self) -> &dyn MemoryObserver {
        &*self.observer
    }
}
