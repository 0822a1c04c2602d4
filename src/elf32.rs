//! Structural parsing of 32-bit ELF shared objects.
//!
//! The parser walks an [`ElfReader`] stream and extracts everything the
//! loader needs: the validated header, the program headers, dependency
//! names, the hashed symbol table, the relocation tables, and the
//! init/fini arrays. All virtual addresses found in `PT_DYNAMIC` are
//! translated to file offsets through the containing `PT_LOAD` segment
//! before being dereferenced.

use crate::error::{invalid_object, Error, Result};
use crate::reader::ElfReader;
use crate::symbol::SymbolTable;
use core::mem::size_of;
use core::ptr;
use elf::abi::*;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ehdr32 {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Phdr32 {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dyn32 {
    pub d_tag: i32,
    pub d_val: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sym32 {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Sym32 {
    #[inline]
    pub(crate) fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }

    #[inline]
    pub(crate) fn is_undef(&self) -> bool {
        self.st_shndx == SHN_UNDEF
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rel32 {
    pub r_offset: u32,
    pub r_info: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rela32 {
    pub r_offset: u32,
    pub r_info: u32,
    pub r_addend: i32,
}

impl Rel32 {
    #[inline]
    pub(crate) fn r_type(&self) -> u32 {
        self.r_info & 0xff
    }

    #[inline]
    pub(crate) fn r_sym(&self) -> usize {
        (self.r_info >> 8) as usize
    }
}

impl Rela32 {
    #[inline]
    pub(crate) fn r_type(&self) -> u32 {
        self.r_info & 0xff
    }

    #[inline]
    pub(crate) fn r_sym(&self) -> usize {
        (self.r_info >> 8) as usize
    }
}

/// Everything the loader needs from an object, decoupled from the stream
/// it was read from.
pub(crate) struct ElfInfo {
    pub phdrs: Vec<Phdr32>,
    /// Dependency names from `DT_NEEDED`, in table order.
    pub needed: Vec<String>,
    /// Hashed symbol table, absent when the object exports nothing.
    pub symbols: Option<SymbolTable>,
    /// Implicit-addend relocations, `DT_JMPREL` included.
    pub rel: Vec<Rel32>,
    /// Explicit-addend relocations, `DT_JMPREL` included.
    pub rela: Vec<Rela32>,
    /// Init array as (virtual address, entry count).
    pub init_array: Option<(u32, usize)>,
    /// Fini array as (virtual address, entry count).
    pub fini_array: Option<(u32, usize)>,
}

fn read_pod<T: Copy>(reader: &mut dyn ElfReader, offset: usize) -> Result<T> {
    let mut buf = vec![0u8; size_of::<T>()];
    reader.read(&mut buf, offset)?;
    Ok(unsafe { ptr::read_unaligned(buf.as_ptr() as *const T) })
}

fn read_pod_vec<T: Copy>(reader: &mut dyn ElfReader, offset: usize, count: usize) -> Result<Vec<T>> {
    let size = count.checked_mul(size_of::<T>()).ok_or(Error::ReadFailed)?;
    let mut buf = vec![0u8; size];
    reader.read(&mut buf, offset)?;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(unsafe { ptr::read_unaligned(buf.as_ptr().add(i * size_of::<T>()) as *const T) });
    }
    Ok(out)
}

/// Translates a runtime virtual address to a file offset through the
/// `PT_LOAD` segment that contains it.
fn vaddr_to_off(phdrs: &[Phdr32], vaddr: u32) -> Result<usize> {
    phdrs
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .find(|ph| vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr.wrapping_add(ph.p_filesz))
        .map(|ph| (ph.p_offset + (vaddr - ph.p_vaddr)) as usize)
        .ok_or_else(|| invalid_object("virtual address outside any load segment"))
}

/// Reads the NUL-terminated string at `offset` in a string table.
fn cstr_at(strtab: &[u8], offset: usize) -> Result<&str> {
    let tail = strtab
        .get(offset..)
        .ok_or_else(|| invalid_object("string offset outside string table"))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| invalid_object("unterminated string in string table"))?;
    core::str::from_utf8(&tail[..end]).map_err(|_| invalid_object("non-UTF-8 string in string table"))
}

fn validate_ehdr(ehdr: &Ehdr32) -> Result<()> {
    if ehdr.e_ident[..4] != ELFMAGIC {
        return Err(invalid_object("bad magic number"));
    }
    if ehdr.e_ident[EI_CLASS] != crate::arch::E_CLASS {
        return Err(Error::WrongClass);
    }
    if ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(invalid_object("not little-endian"));
    }
    if ehdr.e_ident[EI_VERSION] != EV_CURRENT || ehdr.e_version != u32::from(EV_CURRENT) {
        return Err(invalid_object("unsupported ELF version"));
    }
    if ehdr.e_type != ET_DYN {
        return Err(Error::NotSharedObject);
    }
    if ehdr.e_machine != crate::arch::EM_ARCH {
        return Err(Error::UnsupportedArch);
    }
    Ok(())
}

/// Parses an object from the stream.
///
/// Structural problems map to [`Error::InvalidObject`] with a message
/// naming the defect; class/type/machine mismatches get their dedicated
/// variants so callers can tell "wrong file" apart from "corrupt file".
pub(crate) fn parse(reader: &mut dyn ElfReader) -> Result<ElfInfo> {
    let ehdr: Ehdr32 = read_pod(reader, 0)?;
    validate_ehdr(&ehdr)?;
    if ehdr.e_phnum != 0 && ehdr.e_phentsize as usize != size_of::<Phdr32>() {
        return Err(invalid_object("bad program header entry size"));
    }
    let phdrs: Vec<Phdr32> = read_pod_vec(reader, ehdr.e_phoff as usize, ehdr.e_phnum as usize)?;
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.p_memsz < ph.p_filesz {
            return Err(invalid_object("load segment memory size below file size"));
        }
    }

    let mut info = ElfInfo {
        phdrs,
        needed: Vec::new(),
        symbols: None,
        rel: Vec::new(),
        rela: Vec::new(),
        init_array: None,
        fini_array: None,
    };

    let Some(dynamic) = info.phdrs.iter().find(|ph| ph.p_type == PT_DYNAMIC).copied() else {
        // Static image: nothing to link, nothing to export.
        return Ok(info);
    };

    let dyn_count = dynamic.p_filesz as usize / size_of::<Dyn32>();
    let dyns: Vec<Dyn32> = read_pod_vec(reader, dynamic.p_offset as usize, dyn_count)?;

    let mut needed_offsets = Vec::new();
    let mut hash_va = None;
    let mut symtab_va = None;
    let mut strtab_va = None;
    let mut strsz = None;
    let mut rel_va = None;
    let mut relsz = 0u32;
    let mut rela_va = None;
    let mut relasz = 0u32;
    let mut jmprel_va = None;
    let mut pltrelsz = 0u32;
    let mut pltrel = None;
    let mut init_va = None;
    let mut init_sz = 0u32;
    let mut fini_va = None;
    let mut fini_sz = 0u32;

    for d in &dyns {
        match i64::from(d.d_tag) {
            DT_NULL => break,
            DT_NEEDED => needed_offsets.push(d.d_val as usize),
            DT_HASH => hash_va = Some(d.d_val),
            DT_SYMTAB => symtab_va = Some(d.d_val),
            DT_STRTAB => strtab_va = Some(d.d_val),
            DT_STRSZ => strsz = Some(d.d_val),
            DT_REL => rel_va = Some(d.d_val),
            DT_RELSZ => relsz = d.d_val,
            DT_RELA => rela_va = Some(d.d_val),
            DT_RELASZ => relasz = d.d_val,
            DT_JMPREL => jmprel_va = Some(d.d_val),
            DT_PLTRELSZ => pltrelsz = d.d_val,
            DT_PLTREL => pltrel = Some(i64::from(d.d_val)),
            DT_INIT_ARRAY => init_va = Some(d.d_val),
            DT_INIT_ARRAYSZ => init_sz = d.d_val,
            DT_FINI_ARRAY => fini_va = Some(d.d_val),
            DT_FINI_ARRAYSZ => fini_sz = d.d_val,
            _ => {}
        }
    }

    // The string table backs both DT_NEEDED and the symbol table.
    let strtab: Option<Vec<u8>> = match (strtab_va, strsz) {
        (Some(va), Some(sz)) => {
            let off = vaddr_to_off(&info.phdrs, va)?;
            let mut buf = vec![0u8; sz as usize];
            reader.read(&mut buf, off)?;
            Some(buf)
        }
        _ => None,
    };

    if !needed_offsets.is_empty() {
        let strtab = strtab
            .as_deref()
            .ok_or_else(|| invalid_object("DT_NEEDED without a string table"))?;
        for off in needed_offsets {
            info.needed.push(cstr_at(strtab, off)?.to_string());
        }
    }

    if let Some(hash_va) = hash_va {
        let (Some(symtab_va), Some(strtab)) = (symtab_va, strtab) else {
            return Err(invalid_object("hash table without symbol or string table"));
        };
        let hash_off = vaddr_to_off(&info.phdrs, hash_va)?;
        let header: [u32; 2] = read_pod(reader, hash_off)?;
        let (nbucket, nchain) = (header[0] as usize, header[1] as usize);
        let buckets: Vec<u32> = read_pod_vec(reader, hash_off + 8, nbucket)?;
        let chains: Vec<u32> = read_pod_vec(reader, hash_off + 8 + 4 * nbucket, nchain)?;
        let symtab_off = vaddr_to_off(&info.phdrs, symtab_va)?;
        let syms: Vec<Sym32> = read_pod_vec(reader, symtab_off, nchain)?;
        info.symbols = Some(SymbolTable::new(buckets, chains, syms, strtab));
    }

    if let Some(va) = rel_va {
        let off = vaddr_to_off(&info.phdrs, va)?;
        info.rel = read_pod_vec(reader, off, relsz as usize / size_of::<Rel32>())?;
    }
    if let Some(va) = rela_va {
        let off = vaddr_to_off(&info.phdrs, va)?;
        info.rela = read_pod_vec(reader, off, relasz as usize / size_of::<Rela32>())?;
    }
    if let Some(va) = jmprel_va {
        let off = vaddr_to_off(&info.phdrs, va)?;
        // PLT slots resolve eagerly, so they just join the ordinary tables.
        if pltrel == Some(DT_RELA) {
            let mut extra: Vec<Rela32> =
                read_pod_vec(reader, off, pltrelsz as usize / size_of::<Rela32>())?;
            info.rela.append(&mut extra);
        } else {
            let mut extra: Vec<Rel32> =
                read_pod_vec(reader, off, pltrelsz as usize / size_of::<Rel32>())?;
            info.rel.append(&mut extra);
        }
    }

    if let (Some(va), true) = (init_va, init_sz >= 4) {
        info.init_array = Some((va, init_sz as usize / 4));
    }
    if let (Some(va), true) = (fini_va, fini_sz >= 4) {
        info.fini_array = Some((va, fini_sz as usize / 4));
    }

    Ok(info)
}
