//! Host memory services.
//!
//! The linker never talks to the platform directly. Everything it needs
//! from the kernel side lives behind [`HostMemory`]: page allocation, the
//! executable alias ("mirror") of an allocation, permission changes, and
//! cache maintenance. On the target this is backed by the platform's
//! code-page syscalls; in tests a mock host stands in.
//!
//! Terminology used throughout the crate:
//! * **origin** — the writable host pointer returned by the allocator. All
//!   stores during loading and relocation go through this alias.
//! * **base** — the address of the executable alias in the target address
//!   space. All addresses handed to callers, and all values written by
//!   relocations, are computed in base space.

use crate::error::{map_error, Error, Result};
use bitflags::bitflags;
use core::alloc::Layout;
use core::ptr::NonNull;

/// Size of a memory page.
pub const PAGE_SIZE: usize = 0x1000;

bitflags! {
    /// Memory protection for a mapped range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        /// Pages can be read.
        const PROT_READ = 0b1;
        /// Pages can be written.
        const PROT_WRITE = 0b10;
        /// Pages can be executed.
        const PROT_EXEC = 0b100;
    }
}

/// Platform memory primitives the linker is built on.
///
/// An implementation keeps two views of every allocation alive between
/// [`commit_pages`](HostMemory::commit_pages) and
/// [`release_pages`](HostMemory::release_pages): the writable origin and
/// the executable base. Hosts without a split address space may return the
/// origin address as the base.
pub trait HostMemory {
    /// Allocates `pages` zeroed, writable pages and returns the origin
    /// pointer.
    fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>>;

    /// Publishes the allocation into the target address space and returns
    /// its base address.
    ///
    /// # Safety
    /// `origin` must come from [`alloc_pages`](HostMemory::alloc_pages) on
    /// this host with the same `pages` count.
    unsafe fn commit_pages(&self, origin: NonNull<u8>, pages: usize) -> Result<usize>;

    /// Changes the protection of `len` bytes at `base`.
    ///
    /// # Safety
    /// `base..base + len` must lie inside a committed allocation.
    unsafe fn protect(&self, base: usize, len: usize, prot: ProtFlags) -> Result<()>;

    /// Withdraws the allocation from the target address space, making the
    /// origin writable again.
    ///
    /// # Safety
    /// `origin` and `base` must name the same committed allocation.
    unsafe fn release_pages(&self, origin: NonNull<u8>, base: usize, pages: usize) -> Result<()>;

    /// Returns the pages behind `origin` to the allocator.
    ///
    /// # Safety
    /// `origin` must be released (or never committed) and is dead after
    /// this call.
    unsafe fn free_pages(&self, origin: NonNull<u8>, pages: usize) -> Result<()>;

    /// Makes prior data-side stores visible to instruction fetch.
    fn flush_data_cache(&self) {}

    /// Discards stale instructions cached before loading.
    fn invalidate_instruction_cache(&self) {}
}

/// A [`HostMemory`] backed by the process heap.
///
/// There is no second address space: the base of an allocation is its
/// origin address, and protection changes are accepted without effect.
/// Useful on hosts with a flat RWX-capable space and in tests.
#[derive(Debug, Default)]
pub struct HeapHost;

impl HeapHost {
    pub fn new() -> Self {
        HeapHost
    }

    fn layout(pages: usize) -> Result<Layout> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(Error::NoMemory)?;
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| Error::NoMemory)
    }
}

impl HostMemory for HeapHost {
    fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(pages)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::NoMemory)
    }

    unsafe fn commit_pages(&self, origin: NonNull<u8>, _pages: usize) -> Result<usize> {
        Ok(origin.as_ptr() as usize)
    }

    unsafe fn protect(&self, _base: usize, _len: usize, prot: ProtFlags) -> Result<()> {
        if prot.is_empty() {
            return Err(map_error("empty protection"));
        }
        Ok(())
    }

    unsafe fn release_pages(&self, _origin: NonNull<u8>, _base: usize, _pages: usize) -> Result<()> {
        Ok(())
    }

    unsafe fn free_pages(&self, origin: NonNull<u8>, pages: usize) -> Result<()> {
        let layout = Self::layout(pages)?;
        std::alloc::dealloc(origin.as_ptr(), layout);
        Ok(())
    }
}
