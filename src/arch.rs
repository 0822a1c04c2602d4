//! Target architecture constants.
//!
//! Only 32-bit little-endian ARM objects are accepted. The relocation
//! constants below are the four record types the relocator applies; anything
//! else in an object's relocation tables is a hard error.

use elf::abi::*;

/// Machine type accepted in the ELF header.
pub const EM_ARCH: u16 = EM_ARM;
/// ELF class accepted in the identification bytes.
pub const E_CLASS: u8 = ELFCLASS32;

/// Base-displacement relocation: `*r_offset += base` (or `base + addend`).
pub const REL_RELATIVE: u32 = R_ARM_RELATIVE;
/// Direct 32-bit symbol reference with implicit addend.
pub const REL_SYMBOLIC: u32 = R_ARM_ABS32;
/// GOT entry holding a symbol address.
pub const REL_GOT: u32 = R_ARM_GLOB_DAT;
/// PLT slot holding a symbol address. Resolved eagerly.
pub const REL_JUMP_SLOT: u32 = R_ARM_JUMP_SLOT;

/// Names a relocation type for diagnostics.
pub(crate) fn rel_type_to_str(ty: u32) -> &'static str {
    match ty {
        R_ARM_RELATIVE => "R_ARM_RELATIVE",
        R_ARM_ABS32 => "R_ARM_ABS32",
        R_ARM_GLOB_DAT => "R_ARM_GLOB_DAT",
        R_ARM_JUMP_SLOT => "R_ARM_JUMP_SLOT",
        _ => "UNKNOWN",
    }
}
