//! Segment sizing, copying, and protection.
//!
//! An object's load segments are packed into one allocation at their
//! relative virtual addresses. Sizing sums each `PT_LOAD`'s memory size
//! rounded to its alignment, then rounds the total up to a whole number of
//! pages. File bytes are copied through the writable origin alias; the
//! trailing zero fill comes for free from the zeroed allocation.

use crate::elf32::Phdr32;
use crate::error::{invalid_object, map_error, Result};
use crate::host::{HostMemory, ProtFlags, PAGE_SIZE};
use crate::reader::ElfReader;
use core::ptr::NonNull;
use elf::abi::{PF_R, PF_W, PF_X, PT_LOAD};

/// Rounds `value` up to a multiple of `align`. Alignments of 0 and 1 leave
/// the value untouched.
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// Total allocation size for an object's load segments, in bytes.
pub(crate) fn image_size(phdrs: &[Phdr32]) -> Result<usize> {
    let mut size = 0usize;
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        size += align_up(ph.p_memsz as usize, ph.p_align as usize);
    }
    if size == 0 {
        return Err(invalid_object("no load segments"));
    }
    Ok(align_up(size, PAGE_SIZE))
}

/// Maps a segment's `p_flags` to a protection the host will accept.
///
/// Only the combinations a well-formed object produces are allowed;
/// anything else, writable-and-executable included, is refused before a
/// single page changes permission.
pub(crate) fn perms_for(p_flags: u32) -> Result<ProtFlags> {
    let perms = match p_flags & (PF_R | PF_W | PF_X) {
        PF_R => ProtFlags::PROT_READ,
        PF_W => ProtFlags::PROT_WRITE,
        PF_X => ProtFlags::PROT_EXEC,
        f if f == PF_R | PF_W => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        f if f == PF_R | PF_X => ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
        _ => return Err(map_error("unsupported segment permissions")),
    };
    Ok(perms)
}

/// Copies each load segment's file bytes to `origin + p_vaddr`.
///
/// # Safety
/// `origin` must point to at least `size` writable bytes.
pub(crate) unsafe fn copy_segments(
    reader: &mut dyn ElfReader,
    phdrs: &[Phdr32],
    origin: NonNull<u8>,
    size: usize,
) -> Result<()> {
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let vaddr = ph.p_vaddr as usize;
        let filesz = ph.p_filesz as usize;
        if filesz == 0 {
            continue;
        }
        let end = vaddr
            .checked_add(filesz)
            .filter(|&end| end <= size)
            .ok_or_else(|| invalid_object("load segment outside allocation"))?;
        let dst = core::slice::from_raw_parts_mut(origin.as_ptr().add(vaddr), end - vaddr);
        reader.read(dst, ph.p_offset as usize)?;
    }
    Ok(())
}

/// Applies each load segment's final protection at its base-space address.
///
/// # Safety
/// `base` must name a committed allocation covering every load segment.
pub(crate) unsafe fn protect_segments<H: HostMemory>(
    host: &H,
    base: usize,
    phdrs: &[Phdr32],
) -> Result<()> {
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let perms = perms_for(ph.p_flags)?;
        let len = align_up(ph.p_memsz as usize, PAGE_SIZE);
        host.protect(base + ph.p_vaddr as usize, len, perms)?;
    }
    Ok(())
}
