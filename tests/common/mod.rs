//! Shared test harness: a builder for synthetic 32-bit ARM shared objects
//! and a mock host that stands in for the platform's code-page services.
#![allow(dead_code)]

use rtld32::{FnHandler, HostMemory, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const PAGE: usize = 0x1000;

/// User data placed by [`ElfBuilder::add_data`] starts at this virtual
/// address; headers live below it.
pub const DATA_VADDR: u32 = 0x100;

const EM_ARM: u16 = 40;
const ET_DYN: u16 = 3;

const R_ARM_ABS32: u32 = 2;
pub const REL_ABS32: u32 = R_ARM_ABS32;
pub const REL_GLOB_DAT: u32 = 21;
pub const REL_JUMP_SLOT: u32 = 22;
pub const REL_RELATIVE: u32 = 23;

struct SymSpec {
    name: String,
    value: u32,
    size: u32,
    info: u8,
    shndx: u16,
}

/// Builds well-formed (or deliberately malformed) ELF32 shared objects in
/// memory. Layout: headers at 0, user data at [`DATA_VADDR`], metadata
/// sections after the data, one `PT_LOAD` covering the whole file.
pub struct ElfBuilder {
    data: Vec<u8>,
    symbols: Vec<SymSpec>,
    needed: Vec<String>,
    rel: Vec<(u32, u32, u32)>,
    rela: Vec<(u32, u32, u32, i32)>,
    plt_rel: Vec<(u32, u32, u32)>,
    init: Vec<u32>,
    fini: Vec<u32>,
    raw_fini: Option<(u32, u32)>,
    machine: u16,
    class: u8,
    etype: u16,
    seg_flags: u32,
}

impl ElfBuilder {
    pub fn new() -> Self {
        ElfBuilder {
            data: Vec::new(),
            symbols: Vec::new(),
            needed: Vec::new(),
            rel: Vec::new(),
            rela: Vec::new(),
            plt_rel: Vec::new(),
            init: Vec::new(),
            fini: Vec::new(),
            raw_fini: None,
            machine: EM_ARM,
            class: 1,
            etype: ET_DYN,
            // PF_R | PF_W
            seg_flags: 0x6,
        }
    }

    /// Appends `bytes` to the data region, returning their virtual address.
    pub fn add_data(&mut self, bytes: &[u8]) -> u32 {
        let vaddr = DATA_VADDR + self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        vaddr
    }

    /// Appends a little-endian word to the data region.
    pub fn add_word(&mut self, word: u32) -> u32 {
        self.add_data(&word.to_le_bytes())
    }

    /// Adds a defined global symbol, returning its table index.
    pub fn add_symbol(&mut self, name: &str, value: u32, size: u32) -> u32 {
        self.push_sym(name, value, size, 0x12, 1)
    }

    /// Adds an undefined global reference, returning its table index.
    pub fn add_undef(&mut self, name: &str) -> u32 {
        self.push_sym(name, 0, 0, 0x12, 0)
    }

    /// Adds an undefined weak reference, returning its table index.
    pub fn add_weak_undef(&mut self, name: &str) -> u32 {
        self.push_sym(name, 0, 0, 0x22, 0)
    }

    fn push_sym(&mut self, name: &str, value: u32, size: u32, info: u8, shndx: u16) -> u32 {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            value,
            size,
            info,
            shndx,
        });
        self.symbols.len() as u32
    }

    pub fn add_needed(&mut self, name: &str) -> &mut Self {
        self.needed.push(name.to_string());
        self
    }

    pub fn add_rel(&mut self, offset: u32, sym: u32, ty: u32) -> &mut Self {
        self.rel.push((offset, sym, ty));
        self
    }

    pub fn add_rela(&mut self, offset: u32, sym: u32, ty: u32, addend: i32) -> &mut Self {
        self.rela.push((offset, sym, ty, addend));
        self
    }

    /// Adds a `DT_JMPREL` entry (implicit-addend format).
    pub fn add_plt_rel(&mut self, offset: u32, sym: u32, ty: u32) -> &mut Self {
        self.plt_rel.push((offset, sym, ty));
        self
    }

    /// Sets the init array. Entries are function virtual addresses; the
    /// builder emits a base-displacement relocation for each non-sentinel
    /// entry so they hold base-space addresses after linking.
    pub fn set_init(&mut self, entries: &[u32]) -> &mut Self {
        self.init = entries.to_vec();
        self
    }

    pub fn set_fini(&mut self, entries: &[u32]) -> &mut Self {
        self.fini = entries.to_vec();
        self
    }

    /// Emits `DT_FINI_ARRAY`/`DT_FINI_ARRAYSZ` with the given raw values,
    /// bypassing layout. For malformed-array tests.
    pub fn set_raw_fini(&mut self, vaddr: u32, size: u32) -> &mut Self {
        self.raw_fini = Some((vaddr, size));
        self
    }

    pub fn set_machine(&mut self, machine: u16) -> &mut Self {
        self.machine = machine;
        self
    }

    pub fn set_class(&mut self, class: u8) -> &mut Self {
        self.class = class;
        self
    }

    pub fn set_type(&mut self, etype: u16) -> &mut Self {
        self.etype = etype;
        self
    }

    pub fn set_seg_flags(&mut self, flags: u32) -> &mut Self {
        self.seg_flags = flags;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let align4 = |v: u32| (v + 3) & !3;

        let nchain = 1 + self.symbols.len() as u32;

        // String table: one NUL, then symbol names, then dependency names.
        let mut strtab = vec![0u8];
        let mut sym_name_offs = Vec::new();
        for sym in &self.symbols {
            sym_name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
        let mut needed_offs = Vec::new();
        for name in &self.needed {
            needed_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        let mut cursor = align4(DATA_VADDR + self.data.len() as u32);
        let hash_va = cursor;
        cursor += 8 + 4 + 4 * nchain; // nbucket=1
        let symtab_va = cursor;
        cursor += 16 * nchain;
        let strtab_va = cursor;
        cursor = align4(cursor + strtab.len() as u32);
        let init_va = (!self.init.is_empty()).then_some(cursor);
        cursor += 4 * self.init.len() as u32;
        let fini_va = (!self.fini.is_empty()).then_some(cursor);
        cursor += 4 * self.fini.len() as u32;

        // Base-displacement relocations for the init/fini entries, so the
        // arrays carry base-space addresses after linking.
        let mut rel = self.rel.clone();
        for (arr_va, entries) in [(init_va, &self.init), (fini_va, &self.fini)] {
            if let Some(arr_va) = arr_va {
                for (i, &entry) in entries.iter().enumerate() {
                    if entry != 0 && entry != u32::MAX {
                        rel.push((arr_va + 4 * i as u32, 0, REL_RELATIVE));
                    }
                }
            }
        }

        let rel_va = (!rel.is_empty()).then_some(cursor);
        cursor += 8 * rel.len() as u32;
        let rela_va = (!self.rela.is_empty()).then_some(cursor);
        cursor += 12 * self.rela.len() as u32;
        let plt_va = (!self.plt_rel.is_empty()).then_some(cursor);
        cursor += 8 * self.plt_rel.len() as u32;
        let dyn_va = cursor;

        let mut dynamic: Vec<(i32, u32)> = Vec::new();
        for off in &needed_offs {
            dynamic.push((1, *off)); // DT_NEEDED
        }
        dynamic.push((4, hash_va)); // DT_HASH
        dynamic.push((6, symtab_va)); // DT_SYMTAB
        dynamic.push((5, strtab_va)); // DT_STRTAB
        dynamic.push((10, strtab.len() as u32)); // DT_STRSZ
        if let Some(va) = rel_va {
            dynamic.push((17, va)); // DT_REL
            dynamic.push((18, 8 * rel.len() as u32)); // DT_RELSZ
        }
        if let Some(va) = rela_va {
            dynamic.push((7, va)); // DT_RELA
            dynamic.push((8, 12 * self.rela.len() as u32)); // DT_RELASZ
        }
        if let Some(va) = plt_va {
            dynamic.push((23, va)); // DT_JMPREL
            dynamic.push((2, 8 * self.plt_rel.len() as u32)); // DT_PLTRELSZ
            dynamic.push((20, 17)); // DT_PLTREL = DT_REL
        }
        if let Some(va) = init_va {
            dynamic.push((25, va)); // DT_INIT_ARRAY
            dynamic.push((27, 4 * self.init.len() as u32)); // DT_INIT_ARRAYSZ
        }
        if let Some((va, sz)) = self.raw_fini {
            dynamic.push((26, va)); // DT_FINI_ARRAY
            dynamic.push((28, sz)); // DT_FINI_ARRAYSZ
        } else if let Some(va) = fini_va {
            dynamic.push((26, va)); // DT_FINI_ARRAY
            dynamic.push((28, 4 * self.fini.len() as u32)); // DT_FINI_ARRAYSZ
        }
        dynamic.push((0, 0)); // DT_NULL

        let total = dyn_va + 8 * dynamic.len() as u32;

        let mut buf = vec![0u8; total as usize];
        let w16 = |buf: &mut [u8], off: u32, v: u16| {
            buf[off as usize..off as usize + 2].copy_from_slice(&v.to_le_bytes())
        };
        let w32 = |buf: &mut [u8], off: u32, v: u32| {
            buf[off as usize..off as usize + 4].copy_from_slice(&v.to_le_bytes())
        };

        // ELF header.
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = self.class;
        buf[5] = 1; // little-endian
        buf[6] = 1; // EV_CURRENT
        w16(&mut buf, 16, self.etype);
        w16(&mut buf, 18, self.machine);
        w32(&mut buf, 20, 1);
        w32(&mut buf, 28, 52); // e_phoff
        w16(&mut buf, 40, 52); // e_ehsize
        w16(&mut buf, 42, 32); // e_phentsize
        w16(&mut buf, 44, 2); // e_phnum

        // PT_LOAD covering the whole file, then PT_DYNAMIC.
        let phdr = |buf: &mut [u8], at: u32, ty: u32, off: u32, filesz: u32, flags: u32| {
            w32(buf, at, ty);
            w32(buf, at + 4, off); // p_offset
            w32(buf, at + 8, off); // p_vaddr
            w32(buf, at + 16, filesz);
            w32(buf, at + 20, filesz); // p_memsz
            w32(buf, at + 24, flags);
            w32(buf, at + 28, 4); // p_align
        };
        phdr(&mut buf, 52, 1, 0, total, self.seg_flags);
        phdr(&mut buf, 84, 2, dyn_va, 8 * dynamic.len() as u32, 0x4);

        buf[DATA_VADDR as usize..DATA_VADDR as usize + self.data.len()]
            .copy_from_slice(&self.data);

        // SysV hash: one bucket, all symbols on one chain.
        w32(&mut buf, hash_va, 1);
        w32(&mut buf, hash_va + 4, nchain);
        w32(&mut buf, hash_va + 8, if nchain > 1 { 1 } else { 0 });
        for i in 1..nchain {
            let next = if i + 1 < nchain { i + 1 } else { 0 };
            w32(&mut buf, hash_va + 12 + 4 * i, next);
        }

        for (i, sym) in self.symbols.iter().enumerate() {
            let at = symtab_va + 16 * (1 + i as u32);
            w32(&mut buf, at, sym_name_offs[i]);
            w32(&mut buf, at + 4, sym.value);
            w32(&mut buf, at + 8, sym.size);
            buf[at as usize + 12] = sym.info;
            w16(&mut buf, at + 14, sym.shndx);
        }

        buf[strtab_va as usize..strtab_va as usize + strtab.len()].copy_from_slice(&strtab);

        for (arr_va, entries) in [(init_va, &self.init), (fini_va, &self.fini)] {
            if let Some(arr_va) = arr_va {
                for (i, &entry) in entries.iter().enumerate() {
                    w32(&mut buf, arr_va + 4 * i as u32, entry);
                }
            }
        }

        if let Some(va) = rel_va {
            for (i, &(offset, sym, ty)) in rel.iter().enumerate() {
                w32(&mut buf, va + 8 * i as u32, offset);
                w32(&mut buf, va + 8 * i as u32 + 4, (sym << 8) | ty);
            }
        }
        if let Some(va) = rela_va {
            for (i, &(offset, sym, ty, addend)) in self.rela.iter().enumerate() {
                w32(&mut buf, va + 12 * i as u32, offset);
                w32(&mut buf, va + 12 * i as u32 + 4, (sym << 8) | ty);
                w32(&mut buf, va + 12 * i as u32 + 8, addend as u32);
            }
        }
        if let Some(va) = plt_va {
            for (i, &(offset, sym, ty)) in self.plt_rel.iter().enumerate() {
                w32(&mut buf, va + 8 * i as u32, offset);
                w32(&mut buf, va + 8 * i as u32 + 4, (sym << 8) | ty);
            }
        }

        for (i, &(tag, val)) in dynamic.iter().enumerate() {
            w32(&mut buf, dyn_va + 8 * i as u32, tag as u32);
            w32(&mut buf, dyn_va + 8 * i as u32 + 4, val);
        }

        buf
    }
}

struct MockAlloc {
    buf: Box<[u8]>,
    pages: usize,
    base: usize,
    committed: bool,
    released: bool,
    freed: bool,
}

#[derive(Default)]
struct MockState {
    allocs: Mutex<Vec<MockAlloc>>,
    protects: Mutex<Vec<(usize, usize, ProtFlags)>>,
    fail_alloc: AtomicBool,
}

/// A [`HostMemory`] with a synthetic split address space: each committed
/// allocation gets a base address far away from any host pointer, and
/// every call is recorded for assertions.
#[derive(Clone, Default)]
pub struct MockHost(Arc<MockState>);

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.0.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Number of allocations not yet freed.
    pub fn live_allocs(&self) -> usize {
        self.0.allocs.lock().unwrap().iter().filter(|a| !a.freed).count()
    }

    /// Reads the word at a base-space address, through the origin buffer.
    pub fn read_word(&self, addr: usize) -> u32 {
        let allocs = self.0.allocs.lock().unwrap();
        let alloc = allocs
            .iter()
            .find(|a| a.committed && addr >= a.base && addr + 4 <= a.base + a.buf.len())
            .expect("address not in any committed allocation");
        let off = addr - alloc.base;
        u32::from_le_bytes(alloc.buf[off..off + 4].try_into().unwrap())
    }

    pub fn protect_log(&self) -> Vec<(usize, usize, ProtFlags)> {
        self.0.protects.lock().unwrap().clone()
    }
}

impl HostMemory for MockHost {
    fn alloc_pages(&self, pages: usize) -> rtld32::Result<NonNull<u8>> {
        if self.0.fail_alloc.load(Ordering::SeqCst) {
            return Err(rtld32::Error::NoMemory);
        }
        let mut allocs = self.0.allocs.lock().unwrap();
        let idx = allocs.len();
        let mut buf = vec![0u8; pages * PAGE].into_boxed_slice();
        let origin = NonNull::new(buf.as_mut_ptr()).unwrap();
        allocs.push(MockAlloc {
            buf,
            pages,
            base: 0x1000_0000 + idx * 0x10_0000,
            committed: false,
            released: false,
            freed: false,
        });
        Ok(origin)
    }

    unsafe fn commit_pages(&self, origin: NonNull<u8>, pages: usize) -> rtld32::Result<usize> {
        let mut allocs = self.0.allocs.lock().unwrap();
        let alloc = allocs
            .iter_mut()
            .find(|a| a.buf.as_ptr() == origin.as_ptr())
            .expect("commit of unknown allocation");
        assert_eq!(alloc.pages, pages);
        alloc.committed = true;
        Ok(alloc.base)
    }

    unsafe fn protect(&self, base: usize, len: usize, prot: ProtFlags) -> rtld32::Result<()> {
        self.0.protects.lock().unwrap().push((base, len, prot));
        Ok(())
    }

    unsafe fn release_pages(
        &self,
        origin: NonNull<u8>,
        base: usize,
        _pages: usize,
    ) -> rtld32::Result<()> {
        let mut allocs = self.0.allocs.lock().unwrap();
        let alloc = allocs
            .iter_mut()
            .find(|a| a.buf.as_ptr() == origin.as_ptr())
            .expect("release of unknown allocation");
        assert_eq!(alloc.base, base);
        alloc.released = true;
        Ok(())
    }

    unsafe fn free_pages(&self, origin: NonNull<u8>, _pages: usize) -> rtld32::Result<()> {
        let mut allocs = self.0.allocs.lock().unwrap();
        let alloc = allocs
            .iter_mut()
            .find(|a| a.buf.as_ptr() == origin.as_ptr())
            .expect("free of unknown allocation");
        assert!(!alloc.freed, "double free");
        alloc.freed = true;
        Ok(())
    }
}

/// A handler that appends every address it is called with to `log`.
pub fn recording_handler(log: Arc<Mutex<Vec<usize>>>) -> FnHandler {
    Arc::new(move |addr| log.lock().unwrap().push(addr))
}

/// Per-test scratch directory for objects that must live on disk.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rtld32-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes an object file into `dir`, returning its path as a string.
pub fn write_obj(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path.to_str().unwrap().to_string()
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}
