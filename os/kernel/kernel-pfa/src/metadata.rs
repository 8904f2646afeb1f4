//! The metadata store (MDS): one packed byte per managed page recording
//! what that page currently holds. Free pages carry no metadata — freedom
//! is tracked exclusively by [`BuddyBitmap`](crate::bitmap::BuddyBitmap).

use crate::addr::PageId;
use bitfield_struct::bitfield;
use core::ptr::NonNull;

/// What a non-free page is currently used for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum PageType {
    KernelData = 0,
    KernelText = 1,
    PageTable = 2,
}

impl PageType {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::KernelText,
            2 => Self::PageTable,
            _ => Self::KernelData,
        }
    }
}

/// Bit-exact per-page metadata: a 2-bit page type plus 6 reserved bits
/// that must stay zero.
#[bitfield(u8)]
pub struct PageMetadata {
    #[bits(2)]
    page_type_bits: u8,
    #[bits(6)]
    __reserved: u8,
}

impl PageMetadata {
    #[must_use]
    pub const fn for_type(ty: PageType) -> Self {
        Self::new().with_page_type_bits(ty as u8)
    }

    #[must_use]
    pub const fn page_type(self) -> PageType {
        PageType::from_bits(self.page_type_bits())
    }
}

/// The dense, one-byte-per-page metadata array.
pub struct Metadata {
    base: NonNull<u8>,
    #[allow(dead_code)]
    page_count: u32,
}

impl Metadata {
    /// Bytes needed to back `page_count` pages.
    #[must_use]
    pub const fn required_bytes(page_count: u32) -> usize {
        page_count as usize
    }

    /// Builds the metadata store in place over `base`.
    ///
    /// # Safety
    /// `base` must point to at least `required_bytes(page_count)` bytes,
    /// valid and exclusively owned for the store's lifetime.
    #[must_use]
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, page_count: u32) -> Self {
        Self { base, page_count }
    }

    /// Tags `count` pages starting at `page` (absolute page id, rebased by
    /// `page_base`) with `meta`.
    ///
    /// # Safety
    /// `[page, page + count)` must lie within the region this store was
    /// sized for, and the caller must hold the allocator's lock.
    pub unsafe fn apply_range(&self, page: PageId, page_base: PageId, count: u32, meta: PageMetadata) {
        let idx = (page - page_base) as usize;
        // SAFETY: caller guarantees the range fits within the backing array.
        unsafe { core::ptr::write_bytes(self.base.as_ptr().add(idx), meta.into_bits(), count as usize) };
    }

    /// Reads the metadata tag for a single page.
    ///
    /// # Safety
    /// `page` must lie within the region this store was sized for.
    #[must_use]
    pub unsafe fn get(&self, page: PageId, page_base: PageId) -> PageMetadata {
        let idx = (page - page_base) as usize;
        // SAFETY: caller guarantees `page` is within the backing array.
        PageMetadata::from_bits(unsafe { *self.base.as_ptr().add(idx) })
    }
}
