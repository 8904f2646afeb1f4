//! The buddy physical frame allocator and its C-style singleton surface.

use crate::addr::{
    LEVELS, MAX_ALLOC_SIZE, PAGE_SIZE, PHYS_ADDR_INVALID, PageId, PhysMap, buddy_page,
    max_buddy_level_for_alignment, min_buddy_level, min_buddy_level_no_overflow, pa_to_page_id, page_id_to_pa,
    root_page, size_to_page_count,
};
use crate::bitmap::BuddyBitmap;
use crate::list::{FreeEntry, FreeList};
use crate::metadata::{Metadata, PageMetadata, PageType};
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{Mutex, RawSpinLock, SyncOnceCell};

/// Parameters describing the RAM region to hand to [`init`], plus the
/// kernel's own already-occupied footprint within it.
pub struct PfaInitArgs {
    /// Base of the managed RAM region.
    pub ram_base: PhysicalAddress,
    /// Size in bytes of the managed RAM region.
    pub ram_size: u64,
    /// Base of the kernel's text (code) segment.
    pub kernel_text_base: PhysicalAddress,
    /// Size in bytes of the kernel's text segment.
    pub kernel_text_size: u64,
    /// Base of the kernel's data segment.
    pub kernel_data_base: PhysicalAddress,
    /// Size in bytes of the kernel's data segment.
    pub kernel_data_size: u64,
    /// First physical address past whatever the boot collaborator has
    /// already carved out (page tables, boot stack, ...). The allocator
    /// places itself, its bitmaps, and its metadata store starting here.
    pub bootstrap_pa_reserved: PhysicalAddress,
}

/// Failure modes for [`init`].
#[derive(Debug, thiserror::Error)]
pub enum PfaInitError {
    #[error("physical frame allocator already initialized")]
    AlreadyInitialized,
    #[error("ram region is too small to host the allocator's own bookkeeping")]
    RegionTooSmall,
}

struct PfaState {
    page_base: PageId,
    free_lists: [FreeList; LEVELS as usize],
    bitmap: BuddyBitmap,
    metadata: Metadata,
    phys_map: &'static dyn PhysMap,
}

// SAFETY: every pointer `PfaState` holds (list nodes, bitmap words,
// metadata bytes) lives in physical RAM reachable through `phys_map`, not
// in any per-thread state; all access is already serialized by the
// enclosing `Mutex`'s raw lock.
unsafe impl Send for PfaState {}

impl PfaState {
    /// # Safety
    /// `page` must be the start of a level-`level` block with no other
    /// live references, and must not already be tracked as free.
    unsafe fn push_free(&mut self, page: PageId, level: u32) {
        let pa = page_id_to_pa(page);
        let kva = self.phys_map.pa_to_kva(pa);
        let entry = kva.cast::<FreeEntry>();
        // SAFETY: `page` is a block the caller is handing to the free
        // list; writing a fresh node over its first bytes is the
        // allocator's usual way of reusing free memory for bookkeeping.
        unsafe {
            core::ptr::write(entry.as_ptr(), FreeEntry::new());
            self.free_lists[level as usize].push_front(entry);
            self.bitmap.set_bit(page, self.page_base, level, true);
        }
    }

    fn entry_ptr(&self, page: PageId) -> NonNull<FreeEntry> {
        self.phys_map.pa_to_kva(page_id_to_pa(page)).cast()
    }

    fn in_managed_region(&self, page: PageId, page_count: u32) -> bool {
        page >= self.page_base && (page - self.page_base) < page_count
    }

    /// Marks `[page, page + count)` free, splitting the range into the
    /// largest aligned blocks it can without attempting to merge with
    /// neighbors.
    ///
    /// # Safety
    /// `[page, page + count)` must currently hold no free bitmap bits and
    /// must not overlap any block already on a free list.
    unsafe fn insert_range_freed(&mut self, page: PageId, count: u32) {
        let limit = page + count;
        let mut p = page;
        while p < limit {
            let remaining_bytes = u64::from(limit - p) * PAGE_SIZE;
            let level = max_buddy_level_for_alignment(p).min(min_buddy_level_no_overflow(remaining_bytes));
            // SAFETY: forwarded from this function's contract.
            unsafe { self.push_free(p, level) };
            p += 1 << level;
        }
    }

    /// Frees `[page, page + count)` one page at a time, merging each
    /// freed page with an already-free buddy as far up the levels as
    /// possible.
    ///
    /// # Safety
    /// Every page in `[page, page + count)` must currently be allocated
    /// (not tracked by any free list or bitmap bit).
    unsafe fn free_range_merging(&mut self, page: PageId, count: u32, page_count: u32) {
        for offset in 0..count {
            let mut p = page + offset;
            let mut level = 0u32;
            loop {
                let buddy = buddy_page(p, level);
                let buddy_free = level < LEVELS - 1
                    && self.in_managed_region(buddy, page_count)
                    && self.bitmap.get_bit(buddy, self.page_base, level);
                if !buddy_free {
                    // SAFETY: `p` is the current block, freshly freed or
                    // merged from freshly freed halves.
                    unsafe { self.push_free(p, level) };
                    break;
                }
                let buddy_entry = self.entry_ptr(buddy);
                // SAFETY: the bitmap says `buddy` is free, so it is
                // linked into `free_lists[level]`.
                unsafe {
                    self.free_lists[level as usize].remove(buddy_entry);
                    self.bitmap.set_bit(buddy, self.page_base, level, false);
                }
                p = root_page(p, level);
                level += 1;
            }
        }
    }
}

/// The buddy physical frame allocator.
///
/// Constructed in place over a caller-supplied region of memory (see
/// [`init`]); the lock, free lists, bitmaps, and metadata store all live
/// inside that region rather than in the allocator process's own static
/// data, so the allocator can describe (and account for) its own memory.
pub struct Pfa {
    state: Mutex<PfaState, RawSpinLock>,
    page_base: PageId,
    page_count: u32,
}

// SAFETY: `Mutex<PfaState, RawSpinLock>` is already `Sync` given
// `PfaState: Send`; `page_base`/`page_count` are plain copies.
unsafe impl Sync for Pfa {}

impl Pfa {
    fn lock(&self) -> kernel_sync::MutexGuard<'_, PfaState, RawSpinLock> {
        self.state.lock()
    }

    /// Allocates a physically contiguous, power-of-two-sized block of at
    /// least `size` bytes and tags it as `meta` in the metadata store.
    ///
    /// Returns [`PHYS_ADDR_INVALID`] if `size` is zero, exceeds
    /// [`MAX_ALLOC_SIZE`], or no free block large enough remains.
    #[must_use]
    pub fn alloc_contig(&self, size: u64, meta: PageType) -> PhysicalAddress {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return PHYS_ADDR_INVALID;
        }
        let want_level = min_buddy_level(size);
        let mut guard = self.lock();

        let Some(level) = (want_level..LEVELS).find(|&level| !guard.free_lists[level as usize].is_empty()) else {
            return PHYS_ADDR_INVALID;
        };

        // SAFETY: `level`'s free list was just observed non-empty under
        // the lock we still hold.
        let entry = unsafe { guard.free_lists[level as usize].pop_front() }.expect("checked non-empty above");
        let page = pa_to_page_id(guard.state_phys_map_kva_to_pa(entry));
        // SAFETY: `page` was just unlinked from the free list at `level`.
        unsafe { guard.bitmap.set_bit(page, guard.page_base, level, false) };

        let page_count = size_to_page_count(size) as u32;
        let block_pages = 1u32 << level;
        if block_pages > page_count {
            // SAFETY: the tail pages were part of the block we just took
            // off the free list and are not referenced by anything else.
            unsafe { guard.insert_range_freed(page + page_count, block_pages - page_count) };
        }

        // SAFETY: `[page, page + page_count)` is the portion of the block
        // we are handing back to the caller.
        unsafe {
            guard
                .metadata
                .apply_range(page, guard.page_base, page_count, PageMetadata::for_type(meta));
        }
        page_id_to_pa(page)
    }

    /// Returns a previously allocated block to the free pool, merging it
    /// with free neighbors where possible.
    ///
    /// `size` must match the `size` passed to the `alloc_contig` call that
    /// produced `pa`.
    pub fn free_contig(&self, pa: PhysicalAddress, size: u64) {
        let page = pa_to_page_id(pa);
        let count = size_to_page_count(size) as u32;
        let mut guard = self.lock();
        let page_count = self.page_count;
        // SAFETY: the caller guarantees `[page, page + count)` was
        // returned by a matching `alloc_contig` and is not freed twice.
        unsafe { guard.free_range_merging(page, count, page_count) };
    }

    /// Reads the metadata tag of a single managed page.
    #[must_use]
    pub fn mds_get_metadata(&self, page: PageId) -> PageType {
        let guard = self.lock();
        // SAFETY: callers are expected to pass pages within the managed
        // region; out-of-range reads are a caller bug, not a safety hole
        // the allocator can paper over without knowing the region size.
        unsafe { guard.metadata.get(page, guard.page_base) }.page_type()
    }

    /// Asserts that every page in `[page, page + count)` is tagged
    /// `expected`, panicking on the first mismatch.
    pub fn mds_require_range_type(&self, page: PageId, count: u32, expected: PageType) {
        let guard = self.lock();
        for offset in 0..count {
            let p = page + offset;
            // SAFETY: see `mds_get_metadata`.
            let actual = unsafe { guard.metadata.get(p, guard.page_base) }.page_type();
            assert!(
                actual == expected,
                "page {p} has metadata type {actual:?}, expected {expected:?}"
            );
        }
    }

    /// Free-list length at `level`, for diagnostics and tests.
    #[must_use]
    pub fn free_count(&self, level: u32) -> usize {
        self.lock().free_lists[level as usize].len()
    }

    /// Free-list length at every level, mirroring the original's debug-only
    /// `pmap_pfa_get_state`.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn free_counts(&self) -> [usize; LEVELS as usize] {
        let guard = self.lock();
        core::array::from_fn(|level| guard.free_lists[level].len())
    }

    /// Logs the free-list occupancy of every level, mirroring the
    /// original's debug-only `pmap_pfa_dump_state`.
    #[cfg(debug_assertions)]
    pub fn dump_state(&self) {
        let counts = self.free_counts();
        for (level, count) in counts.iter().enumerate() {
            log::debug!("pfa: level {level} free blocks = {count}");
        }
    }
}

impl PfaState {
    fn state_phys_map_kva_to_pa(&self, kva: NonNull<FreeEntry>) -> PhysicalAddress {
        self.phys_map.kva_to_pa(kva.cast())
    }
}

struct PfaHandle(NonNull<Pfa>);

// SAFETY: the pointee is `Sync` (see `impl Sync for Pfa` above) and lives
// for the remainder of the process, so sharing the pointer across threads
// is no different from sharing a `&'static Pfa`.
unsafe impl Send for PfaHandle {}
unsafe impl Sync for PfaHandle {}

static PFA: SyncOnceCell<PfaHandle> = SyncOnceCell::new();

/// Initializes the global physical frame allocator over `args.ram_base
/// .. args.ram_base + args.ram_size`, reserving space for its own
/// bookkeeping starting at `args.bootstrap_pa_reserved`.
///
/// Panics are avoided in favor of [`PfaInitError`]; the one thing this
/// function cannot recover from is being called twice, which is a boot
/// sequencing bug and returns [`PfaInitError::AlreadyInitialized`].
///
/// # Safety
/// `phys_map` must correctly translate every address in
/// `[args.bootstrap_pa_reserved, args.ram_base + args.ram_size)`, and no
/// other code may be concurrently writing to that range.
pub unsafe fn init(phys_map: &'static dyn PhysMap, args: PfaInitArgs) -> Result<&'static Pfa, PfaInitError> {
    if PFA.get().is_some() {
        return Err(PfaInitError::AlreadyInitialized);
    }

    let page_base = pa_to_page_id(args.ram_base);
    let page_count = size_to_page_count(args.ram_size) as u32;

    let pfa_bytes = size_of::<Pfa>();
    let bitmap_bytes = BuddyBitmap::required_bytes_all_levels(page_count);
    let mds_bytes = Metadata::required_bytes(page_count);
    let reserved_bytes = (pfa_bytes + bitmap_bytes + mds_bytes) as u64;
    let reserved_pages = size_to_page_count(reserved_bytes);
    let new_reserved = args.bootstrap_pa_reserved + reserved_pages * PAGE_SIZE;

    if new_reserved.as_u64() >= args.ram_base.as_u64() + args.ram_size {
        return Err(PfaInitError::RegionTooSmall);
    }

    let pfa_kva = phys_map.pa_to_kva(args.bootstrap_pa_reserved);
    // SAFETY: the bitmap and metadata regions were sized to fit directly
    // after the `Pfa` struct itself within the reserved span just
    // validated above.
    let bitmap_kva = unsafe { NonNull::new_unchecked(pfa_kva.as_ptr().add(pfa_bytes)) };
    let mds_kva = unsafe { NonNull::new_unchecked(bitmap_kva.as_ptr().add(bitmap_bytes)) };

    // SAFETY: both regions are disjoint, sized by the same formulas used
    // to validate `new_reserved` above, and exclusively owned here.
    let bitmap = unsafe { BuddyBitmap::from_raw_parts(bitmap_kva, page_count) };
    unsafe { bitmap.zero_all() };
    let metadata = unsafe { Metadata::from_raw_parts(mds_kva, page_count) };

    let state = PfaState {
        page_base,
        free_lists: core::array::from_fn(|_| FreeList::new()),
        bitmap,
        metadata,
        phys_map,
    };

    let pfa_ptr = pfa_kva.as_ptr().cast::<Pfa>();
    // SAFETY: `pfa_ptr` points to `pfa_bytes` of fresh, exclusively-owned
    // memory validated above; this is the allocator's own home.
    unsafe {
        core::ptr::write(
            pfa_ptr,
            Pfa {
                state: Mutex::from_raw(RawSpinLock::new(), state),
                page_base,
                page_count,
            },
        );
    }
    // SAFETY: the value was just written in place and nothing else
    // references this memory yet.
    let pfa_ref: &'static Pfa = unsafe { &*pfa_ptr };

    {
        let mut guard = pfa_ref.lock();
        let first_free = pa_to_page_id(new_reserved);
        let region_end = page_base + page_count;
        // SAFETY: `[first_free, region_end)` has not been handed out to
        // anyone; everything before it is either the allocator's own
        // bookkeeping or the kernel image tagged below.
        unsafe { guard.insert_range_freed(first_free, region_end - first_free) };

        // SAFETY: these ranges describe memory the boot collaborator
        // already reserved for the kernel image and this allocator; they
        // are within the managed region and were excluded from the free
        // sweep above.
        unsafe {
            guard
                .metadata
                .apply_range(page_base, page_base, first_free - page_base, PageMetadata::for_type(PageType::KernelData));
            let data_page = pa_to_page_id(args.kernel_data_base);
            let data_count = size_to_page_count(args.kernel_data_size) as u32;
            guard
                .metadata
                .apply_range(data_page, page_base, data_count, PageMetadata::for_type(PageType::KernelData));
            let text_page = pa_to_page_id(args.kernel_text_base);
            let text_count = size_to_page_count(args.kernel_text_size) as u32;
            guard
                .metadata
                .apply_range(text_page, page_base, text_count, PageMetadata::for_type(PageType::KernelText));
        }
    }

    PFA.get_or_init(|| PfaHandle(NonNull::from(pfa_ref)));
    log::info!("pfa: managing {page_count} pages from {:?}", args.ram_base);
    Ok(pfa_ref)
}

/// Returns the global physical frame allocator.
///
/// # Panics
/// Panics if [`init`] has not yet completed.
#[must_use]
pub fn pfa() -> &'static Pfa {
    let handle = PFA.get().expect("physical frame allocator not initialized");
    // SAFETY: the pointee was written once by `init` and lives for the
    // remainder of the process.
    unsafe { handle.0.as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

    /// An identity-ish physmap over a single `Vec<u8>` standing in for RAM,
    /// used only so tests can exercise the allocator under `std`.
    struct FakeRam {
        base: PhysicalAddress,
        storage: *mut u8,
    }

    unsafe impl Sync for FakeRam {}

    impl PhysMap for FakeRam {
        fn pa_to_kva(&self, pa: PhysicalAddress) -> NonNull<u8> {
            let offset = pa.as_u64() - self.base.as_u64();
            NonNull::new(unsafe { self.storage.add(offset as usize) }).unwrap()
        }

        fn kva_to_pa(&self, kva: NonNull<u8>) -> PhysicalAddress {
            let offset = unsafe { kva.as_ptr().offset_from(self.storage) };
            PhysicalAddress::new(self.base.as_u64() + offset as u64)
        }
    }

    fn init_test_pfa(page_count: u32) -> &'static Pfa {
        let ram_base = PhysicalAddress::new(0x1000_0000);
        let ram_size = u64::from(page_count) * PAGE_SIZE;
        let storage = vec![0u8; ram_size as usize].into_boxed_slice();
        let storage_ptr = Box::leak(storage).as_mut_ptr();
        let ram: &'static FakeRam = Box::leak(Box::new(FakeRam {
            base: ram_base,
            storage: storage_ptr,
        }));

        let args = PfaInitArgs {
            ram_base,
            ram_size,
            kernel_text_base: ram_base,
            kernel_text_size: PAGE_SIZE,
            kernel_data_base: ram_base + PAGE_SIZE,
            kernel_data_size: PAGE_SIZE,
            bootstrap_pa_reserved: ram_base + 2 * PAGE_SIZE,
        };

        // Each test gets its own process-local singleton slot would be
        // ideal, but the crate only exposes one global cell; tests that
        // need independent instances use `init_standalone` instead.
        unsafe { init_standalone(ram, args) }
    }

    /// Builds a `Pfa` without touching the process-wide singleton, for
    /// tests that need several independent instances.
    unsafe fn init_standalone(phys_map: &'static dyn PhysMap, args: PfaInitArgs) -> &'static Pfa {
        let page_base = pa_to_page_id(args.ram_base);
        let page_count = size_to_page_count(args.ram_size) as u32;
        let bitmap_bytes = BuddyBitmap::required_bytes_all_levels(page_count);
        let mds_bytes = Metadata::required_bytes(page_count);
        let reserved_bytes = (size_of::<Pfa>() + bitmap_bytes + mds_bytes) as u64;
        let reserved_pages = size_to_page_count(reserved_bytes);
        let new_reserved = args.bootstrap_pa_reserved + reserved_pages * PAGE_SIZE;
        assert!(
            new_reserved.as_u64() < args.ram_base.as_u64() + args.ram_size,
            "test region too small"
        );

        let pfa_kva = phys_map.pa_to_kva(args.bootstrap_pa_reserved);
        let bitmap_kva = unsafe { NonNull::new_unchecked(pfa_kva.as_ptr().add(size_of::<Pfa>())) };
        let mds_kva = unsafe { NonNull::new_unchecked(bitmap_kva.as_ptr().add(bitmap_bytes)) };

        let bitmap = unsafe { BuddyBitmap::from_raw_parts(bitmap_kva, page_count) };
        unsafe { bitmap.zero_all() };
        let metadata = unsafe { Metadata::from_raw_parts(mds_kva, page_count) };

        let state = PfaState {
            page_base,
            free_lists: core::array::from_fn(|_| FreeList::new()),
            bitmap,
            metadata,
            phys_map,
        };

        let pfa_ptr = pfa_kva.as_ptr().cast::<Pfa>();
        unsafe {
            core::ptr::write(
                pfa_ptr,
                Pfa {
                    state: Mutex::from_raw(RawSpinLock::new(), state),
                    page_base,
                    page_count,
                },
            );
        }
        let pfa_ref: &'static Pfa = unsafe { &*pfa_ptr };
        {
            let mut guard = pfa_ref.lock();
            let first_free = pa_to_page_id(new_reserved);
            let region_end = page_base + page_count;
            unsafe { guard.insert_range_freed(first_free, region_end - first_free) };
            unsafe {
                guard.metadata.apply_range(
                    page_base,
                    page_base,
                    first_free - page_base,
                    PageMetadata::for_type(PageType::KernelData),
                );
                let data_page = pa_to_page_id(args.kernel_data_base);
                let data_count = size_to_page_count(args.kernel_data_size) as u32;
                guard
                    .metadata
                    .apply_range(data_page, page_base, data_count, PageMetadata::for_type(PageType::KernelData));
                let text_page = pa_to_page_id(args.kernel_text_base);
                let text_count = size_to_page_count(args.kernel_text_size) as u32;
                guard
                    .metadata
                    .apply_range(text_page, page_base, text_count, PageMetadata::for_type(PageType::KernelText));
            }
        }
        pfa_ref
    }

    #[test]
    fn simple_sweep_alloc_and_free_round_trips() {
        let pfa = init_test_pfa(256);
        let pa = pfa.alloc_contig(PAGE_SIZE, PageType::KernelData);
        assert_ne!(pa, PHYS_ADDR_INVALID);
        assert_eq!(pfa.mds_get_metadata(pa_to_page_id(pa)), PageType::KernelData);
        pfa.free_contig(pa, PAGE_SIZE);
    }

    #[test]
    fn alloc_rounds_up_to_next_power_of_two_block() {
        let pfa = init_test_pfa(256);
        // 3 pages requires a 4-page (level 2) block; the leftover page is
        // freed back immediately.
        let before = pfa.free_count(0);
        let pa = pfa.alloc_contig(PAGE_SIZE * 3, PageType::KernelData);
        assert_ne!(pa, PHYS_ADDR_INVALID);
        assert_eq!(pfa.free_count(0), before + 1);
    }

    #[test]
    fn freeing_merges_back_into_larger_blocks() {
        let pfa = init_test_pfa(256);
        let level2_before = pfa.free_count(2);
        let pa = pfa.alloc_contig(PAGE_SIZE << 2, PageType::KernelData);
        assert_eq!(pfa.free_count(2), level2_before - 1);
        pfa.free_contig(pa, PAGE_SIZE << 2);
        assert_eq!(pfa.free_count(2), level2_before);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pfa = init_test_pfa(256);
        assert_eq!(pfa.alloc_contig(MAX_ALLOC_SIZE + 1, PageType::KernelData), PHYS_ADDR_INVALID);
    }

    #[test]
    fn exhausting_the_pool_returns_invalid() {
        let pfa = init_test_pfa(16);
        let mut allocations = vec::Vec::new();
        loop {
            let pa = pfa.alloc_contig(PAGE_SIZE, PageType::KernelData);
            if pa == PHYS_ADDR_INVALID {
                break;
            }
            allocations.push(pa);
        }
        // The pool's bootstrap bookkeeping leaves some free pages, so the
        // sweep above must have actually handed some out before failing.
        assert!(!allocations.is_empty());
        assert_eq!(pfa.alloc_contig(PAGE_SIZE, PageType::KernelData), PHYS_ADDR_INVALID);

        for pa in allocations {
            pfa.free_contig(pa, PAGE_SIZE);
        }

        // Freeing everything back restores the pool to a usable state.
        assert_ne!(pfa.alloc_contig(PAGE_SIZE, PageType::KernelData), PHYS_ADDR_INVALID);
    }

    #[test]
    #[should_panic(expected = "expected")]
    fn mds_require_range_type_panics_on_mismatch() {
        let pfa = init_test_pfa(256);
        let pa = pfa.alloc_contig(PAGE_SIZE, PageType::KernelText);
        pfa.mds_require_range_type(pa_to_page_id(pa), 1, PageType::KernelData);
    }
}
