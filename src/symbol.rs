//! Symbol tables and the lookup orderings over the object graph.
//!
//! Each object carries at most one [`SymbolTable`], built from its SysV
//! hash table at parse time and owned outright so lookups never touch the
//! input stream again. On top of single-table lookup this module provides
//! the two graph traversals the public API needs: depth-first in
//! dependency-declaration order (used by the relocator's last-resort
//! step), and breadth-first (used by `dlsym` on a real handle).

use crate::elf32::Sym32;
use crate::registry::{ObjHandle, MAX_HANDLES};
use std::collections::VecDeque;

const STN_UNDEF: usize = 0;

/// SysV ELF hash.
pub(crate) fn elf_hash(name: &str) -> u32 {
    let mut hash = 0u32;
    for &byte in name.as_bytes() {
        hash = (hash << 4).wrapping_add(u32::from(byte));
        let nibble = hash & 0xf000_0000;
        if nibble != 0 {
            hash ^= nibble >> 24;
        }
        hash &= !nibble;
    }
    hash
}

/// An object's exported-symbol table.
///
/// Buckets and chains come straight from the object's `DT_HASH` table;
/// chain indices are bounds-checked on every step so a corrupt table
/// terminates lookup instead of walking wild.
pub(crate) struct SymbolTable {
    buckets: Box<[u32]>,
    chains: Box<[u32]>,
    syms: Box<[Sym32]>,
    strtab: Box<[u8]>,
}

impl SymbolTable {
    pub fn new(buckets: Vec<u32>, chains: Vec<u32>, syms: Vec<Sym32>, strtab: Vec<u8>) -> Self {
        SymbolTable {
            buckets: buckets.into_boxed_slice(),
            chains: chains.into_boxed_slice(),
            syms: syms.into_boxed_slice(),
            strtab: strtab.into_boxed_slice(),
        }
    }

    /// The symbol at table index `idx`.
    pub fn sym(&self, idx: usize) -> Option<&Sym32> {
        self.syms.get(idx)
    }

    /// The name of `sym`, or `None` if its name offset is out of range.
    pub fn sym_name(&self, sym: &Sym32) -> Option<&str> {
        let tail = self.strtab.get(sym.st_name as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&tail[..end]).ok()
    }

    /// Finds the defined symbol named `name`.
    pub fn lookup(&self, name: &str) -> Option<(usize, &Sym32)> {
        self.lookup_excluding(name, STN_UNDEF)
    }

    /// Finds the defined symbol named `name`, ignoring the entry at
    /// `exclude`. Used when an object resolves one of its own relocations
    /// so the undefined reference does not satisfy itself.
    pub fn lookup_excluding(&self, name: &str, exclude: usize) -> Option<(usize, &Sym32)> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = (elf_hash(name) as usize) % self.buckets.len();
        let mut idx = self.buckets[bucket] as usize;
        let mut steps = 0usize;
        while idx != STN_UNDEF && steps <= self.chains.len() {
            let sym = self.syms.get(idx)?;
            if idx != exclude && !sym.is_undef() && self.sym_name(sym) == Some(name) {
                return Some((idx, sym));
            }
            idx = *self.chains.get(idx)? as usize;
            steps += 1;
        }
        None
    }

    /// Finds the defined symbol whose `[st_value, st_value + st_size)`
    /// range contains the image offset `offset`. Zero-sized symbols never
    /// match.
    pub fn by_value(&self, offset: u32) -> Option<(usize, &Sym32)> {
        self.syms
            .iter()
            .enumerate()
            .skip(STN_UNDEF + 1)
            .find(|(_, sym)| {
                !sym.is_undef()
                    && offset >= sym.st_value
                    && offset < sym.st_value.wrapping_add(sym.st_size)
            })
    }
}

fn lookup_in(handle: &ObjHandle, name: &str) -> (Option<usize>, Vec<ObjHandle>) {
    let image = handle.image();
    let found = image
        .symbols
        .as_ref()
        .and_then(|table| table.lookup(name))
        .map(|(_, sym)| image.base + sym.st_value as usize);
    (found, image.deps.clone())
}

/// Depth-first lookup: the object itself, then each dependency subtree in
/// declaration order. Cycles terminate through the visited set.
pub(crate) fn lookup_load_order(start: &ObjHandle, name: &str) -> Option<usize> {
    let mut visited = Vec::new();
    visit(start, name, &mut visited)
}

fn visit(handle: &ObjHandle, name: &str, visited: &mut Vec<ObjHandle>) -> Option<usize> {
    if visited.iter().any(|seen| seen.ptr_eq(handle)) {
        return None;
    }
    visited.push(handle.clone());
    let (found, deps) = lookup_in(handle, name);
    if found.is_some() {
        return found;
    }
    deps.iter().find_map(|dep| visit(dep, name, visited))
}

/// Breadth-first lookup: the object itself, then its direct dependencies,
/// then theirs. The frontier is capped at the registry capacity, which
/// together with duplicate suppression bounds the traversal on any graph.
pub(crate) fn lookup_dep_order(start: &ObjHandle, name: &str) -> Option<usize> {
    let mut queue = VecDeque::with_capacity(MAX_HANDLES);
    let mut seen = vec![start.clone()];
    queue.push_back(start.clone());
    while let Some(handle) = queue.pop_front() {
        let (found, deps) = lookup_in(&handle, name);
        if found.is_some() {
            return found;
        }
        for dep in deps {
            if seen.len() >= MAX_HANDLES {
                break;
            }
            if !seen.iter().any(|s| s.ptr_eq(&dep)) {
                seen.push(dep.clone());
                queue.push_back(dep);
            }
        }
    }
    None
}
