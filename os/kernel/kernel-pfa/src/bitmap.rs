//! Per-level free-state bitmaps.
//!
//! Each buddy level owns a flat array of `u64` words tracking which blocks
//! at that level are currently free. The bitmap is a redundant source of
//! truth alongside the free lists: every insertion/removal from a
//! [`FreeList`](crate::list::FreeList) is paired with a bit flip here, in
//! the same order, under the same lock.

use crate::addr::{LEVELS, PageId};
use core::ptr::NonNull;

struct LevelBitmap {
    words: NonNull<u64>,
    word_count: u32,
}

/// The `LEVELS` flat bit arrays backing the buddy allocator's free state.
pub struct BuddyBitmap {
    levels: [LevelBitmap; LEVELS as usize],
}

impl BuddyBitmap {
    /// Words needed to track every possible level-`level` block across
    /// `page_count` pages.
    #[must_use]
    pub const fn required_words(page_count: u32, level: u32) -> u32 {
        let per_word = 64u32 << level;
        let words = page_count.div_ceil(per_word);
        if words < 1 { 1 } else { words }
    }

    /// Total bytes needed for all `LEVELS` bitmaps combined.
    #[must_use]
    pub const fn required_bytes_all_levels(page_count: u32) -> usize {
        let mut total = 0usize;
        let mut level = 0u32;
        while level < LEVELS {
            total += Self::required_words(page_count, level) as usize * size_of::<u64>();
            level += 1;
        }
        total
    }

    /// Builds the bitmap in place over `base`, which must already hold
    /// [`Self::required_bytes_all_levels(page_count)`] bytes of writable
    /// memory.
    ///
    /// # Safety
    /// `base` must point to at least `required_bytes_all_levels(page_count)`
    /// bytes, valid and exclusively owned for the bitmap's lifetime.
    #[must_use]
    pub unsafe fn from_raw_parts(base: NonNull<u8>, page_count: u32) -> Self {
        let mut cursor = base;
        let levels = core::array::from_fn(|level| {
            let word_count = Self::required_words(page_count, level as u32);
            let words = cursor.cast::<u64>();
            // SAFETY: each level's region is disjoint and sized by the same
            // `required_words` formula the caller used to size `base`.
            cursor = unsafe { NonNull::new_unchecked(cursor.as_ptr().add(word_count as usize * 8)) };
            LevelBitmap { words, word_count }
        });
        Self { levels }
    }

    /// Zeroes every tracked bit across all levels (everything allocated).
    ///
    /// # Safety
    /// The caller must hold exclusive access to the backing memory.
    pub unsafe fn zero_all(&self) {
        for level in &self.levels {
            unsafe { core::ptr::write_bytes(level.words.as_ptr(), 0, level.word_count as usize) };
        }
    }

    fn word_and_bit(page: PageId, page_base: PageId, level: u32) -> (u32, u32) {
        let d = page - page_base;
        (d >> (6 + level), (d >> level) & 63)
    }

    /// Whether `page`'s level-`level` block is free. Positions outside the
    /// backing array (a buddy that straddles the managed region's edge)
    /// read as "not free" rather than panicking.
    #[must_use]
    pub fn get_bit(&self, page: PageId, page_base: PageId, level: u32) -> bool {
        if page < page_base {
            return false;
        }
        let (word_idx, bit_idx) = Self::word_and_bit(page, page_base, level);
        let lvl = &self.levels[level as usize];
        if word_idx >= lvl.word_count {
            return false;
        }
        // SAFETY: `word_idx` was just bounds-checked against `word_count`.
        unsafe { (*lvl.words.as_ptr().add(word_idx as usize) >> bit_idx) & 1 == 1 }
    }

    /// Sets or clears `page`'s level-`level` free bit.
    ///
    /// # Safety
    /// `page` must lie within the managed region this bitmap was sized
    /// for, and the caller must hold the allocator's lock.
    pub unsafe fn set_bit(&self, page: PageId, page_base: PageId, level: u32, value: bool) {
        let (word_idx, bit_idx) = Self::word_and_bit(page, page_base, level);
        let lvl = &self.levels[level as usize];
        debug_assert!(word_idx < lvl.word_count, "bit index out of range for level");
        // SAFETY: caller guarantees `page` is within the managed region.
        unsafe {
            let word_ptr = lvl.words.as_ptr().add(word_idx as usize);
            let mask = 1u64 << bit_idx;
            if value {
                *word_ptr |= mask;
            } else {
                *word_ptr &= !mask;
            }
        }
    }
}
