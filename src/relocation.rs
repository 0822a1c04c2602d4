//! The relocation engine.
//!
//! Relocations run eagerly, after an object's segments are copied but
//! before permissions are dropped. All stores go through the writable
//! origin alias of the image; every value written is an address in base
//! space, so the executable alias sees a fully linked image the moment it
//! becomes reachable.
//!
//! Symbol references resolve in a fixed order: the caller-supplied
//! resolver, the program resolver, global objects in registration order,
//! the object's own exports (excluding the referencing entry), and finally
//! a depth-first walk of the dependency graph. An unresolved weak
//! reference is not an error; the slot is simply left alone.

use crate::arch::{rel_type_to_str, REL_GOT, REL_JUMP_SLOT, REL_RELATIVE, REL_SYMBOLIC};
use crate::elf32::ElfInfo;
use crate::error::{relocate_error, Result};
use crate::registry::{ObjHandle, Registry};
use crate::symbol::lookup_load_order;
use elf::abi::STB_WEAK;

/// A caller-supplied symbol resolver, consulted before anything else.
pub type SymResolver<'a> = dyn Fn(&str) -> Option<usize> + 'a;

pub(crate) struct Relocator<'a> {
    handle: &'a ObjHandle,
    registry: &'a Registry,
    resolver: Option<&'a SymResolver<'a>>,
    program_resolver: Option<fn(&str) -> Option<usize>>,
}

struct Resolution {
    addr: u32,
    weak: bool,
}

impl<'a> Relocator<'a> {
    pub fn new(
        handle: &'a ObjHandle,
        registry: &'a Registry,
        resolver: Option<&'a SymResolver<'a>>,
        program_resolver: Option<fn(&str) -> Option<usize>>,
    ) -> Self {
        Relocator {
            handle,
            registry,
            resolver,
            program_resolver,
        }
    }

    /// Applies every relocation in `info` to the handle's image.
    pub fn relocate(&self, info: &ElfInfo) -> Result<()> {
        for rel in &info.rel {
            self.apply(info, rel.r_offset, rel.r_type(), rel.r_sym(), 0)?;
        }
        for rela in &info.rela {
            self.apply(info, rela.r_offset, rela.r_type(), rela.r_sym(), rela.r_addend)?;
        }
        Ok(())
    }

    fn apply(&self, info: &ElfInfo, offset: u32, ty: u32, sym_idx: usize, addend: i32) -> Result<()> {
        log::trace!(
            "reloc {} at {:#x} (sym {}, addend {:#x})",
            rel_type_to_str(ty),
            offset,
            sym_idx,
            addend
        );
        match ty {
            REL_RELATIVE => {
                let image = self.handle.image();
                let base = image.base as u32;
                let value = if addend != 0 {
                    base.wrapping_add_signed(addend)
                } else {
                    image.read_word(offset as usize)?.wrapping_add(base)
                };
                image.write_word(offset as usize, value)
            }
            REL_SYMBOLIC | REL_GOT | REL_JUMP_SLOT => {
                // No image guard may be held here: resolution re-enters the
                // image lock through the dependency walk.
                let resolution = self.resolve(info, sym_idx)?;
                if resolution.addr == 0 {
                    if resolution.weak {
                        return Ok(());
                    }
                    let name = self
                        .sym_name(info, sym_idx)
                        .unwrap_or("<unnamed>")
                        .to_string();
                    return Err(relocate_error(format!("unresolved symbol \"{name}\"")));
                }
                self.handle
                    .image()
                    .write_word(offset as usize, resolution.addr.wrapping_add_signed(addend))
            }
            other => Err(relocate_error(format!(
                "unsupported relocation type {other}"
            ))),
        }
    }

    fn sym_name<'i>(&self, info: &'i ElfInfo, sym_idx: usize) -> Option<&'i str> {
        let table = info.symbols.as_ref()?;
        table.sym_name(table.sym(sym_idx)?)
    }

    fn resolve(&self, info: &ElfInfo, sym_idx: usize) -> Result<Resolution> {
        if sym_idx == 0 {
            return Ok(Resolution {
                addr: 0,
                weak: false,
            });
        }
        let table = info
            .symbols
            .as_ref()
            .ok_or_else(|| relocate_error("symbol reference without a symbol table"))?;
        let sym = table
            .sym(sym_idx)
            .ok_or_else(|| relocate_error("symbol index outside symbol table"))?;
        let weak = sym.st_bind() == STB_WEAK;
        let name = table
            .sym_name(sym)
            .ok_or_else(|| relocate_error("symbol name outside string table"))?;

        if let Some(resolver) = self.resolver {
            if let Some(addr) = resolver(name) {
                return Ok(Resolution {
                    addr: addr as u32,
                    weak,
                });
            }
        }
        if let Some(resolver) = self.program_resolver {
            if let Some(addr) = resolver(name) {
                return Ok(Resolution {
                    addr: addr as u32,
                    weak,
                });
            }
        }
        if let Some(addr) = self.search_globals(name) {
            return Ok(Resolution {
                addr: addr as u32,
                weak,
            });
        }
        // The object's own exports. The referencing entry itself must not
        // satisfy the reference.
        if let Some((_, own)) = table.lookup_excluding(name, sym_idx) {
            let base = self.handle.image().base;
            return Ok(Resolution {
                addr: (base + own.st_value as usize) as u32,
                weak,
            });
        }
        let deps = self.handle.image().deps.clone();
        if let Some(addr) = deps.iter().find_map(|dep| lookup_load_order(dep, name)) {
            return Ok(Resolution {
                addr: addr as u32,
                weak,
            });
        }
        Ok(Resolution { addr: 0, weak })
    }

    /// Scans objects opened global, in registration order. Objects still
    /// mid-load have no symbol table yet, so they fall out naturally.
    fn search_globals(&self, name: &str) -> Option<usize> {
        let global = crate::api::OpenFlags::GLOBAL.bits();
        self.registry
            .snapshot()
            .iter()
            .filter(|h| !h.ptr_eq(self.handle) && h.flags() & global != 0)
            .find_map(|h| {
                let image = h.image();
                let sym = image.symbols.as_ref()?.lookup(name)?.1;
                Some(image.base + sym.st_value as usize)
            })
    }
}
