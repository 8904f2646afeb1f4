//! # Physical Frame Allocator
//!
//! A buddy allocator over physical page frames, paired with a sidecar
//! metadata store (MDS) that remembers what each non-free page currently
//! holds.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                      Pfa                       │
//! │  ┌───────────────┐  ┌───────────┐ ┌─────────┐ │
//! │  │ free lists[L] │  │  bitmap   │ │   MDS   │ │
//! │  │ (intrusive)   │  │ (per L)   │ │ (1B/pg) │ │
//! │  └───────────────┘  └───────────┘ └─────────┘ │
//! │             guarded by one RawSpinLock          │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A block of `2^L` pages (`L` in `0..LEVELS`) is tracked in exactly two
//! redundant places: the level-`L` free list (an intrusive doubly-linked
//! list threaded through the block's own first bytes) and the level-`L`
//! free-state bitmap. Both are updated together, in the same order, under
//! the allocator's lock — see [`pfa::Pfa::alloc_contig`] and
//! [`pfa::Pfa::free_contig`].
//!
//! Address translation between physical addresses and the kernel's
//! physmap view is injected through the [`addr::PhysMap`] trait rather
//! than assumed to be a fixed offset, since the physmap base is chosen at
//! boot time by whatever component first brings up virtual memory. This
//! is also what lets the allocator run its own test suite under `std`
//! against a fake backing buffer.
//!
//! ## Non-goals
//!
//! This crate only manages physical page frames. It does not allocate or
//! manage virtual address space, walk or install page table mappings, or
//! provide a general-purpose heap; those are a virtual memory manager's
//! job, built on top of the physical addresses this crate hands out.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod addr;
mod bitmap;
mod list;
mod metadata;
mod pfa;

pub use addr::{LEVELS, MAX_ALLOC_SIZE, PAGE_SIZE, PHYS_ADDR_INVALID, PageId, PhysMap, pa_to_page_id, page_id_to_pa};
pub use metadata::{PageMetadata, PageType};
pub use pfa::{Pfa, PfaInitArgs, PfaInitError, init, pfa};
