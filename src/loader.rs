//! The load and unload pipelines.
//!
//! Loading is a straight-line sequence: register a handle, parse, load
//! dependencies, size and allocate, copy segments, commit the executable
//! alias, relocate through the writable alias, drop permissions, maintain
//! caches, run initializers. Any failure unwinds through the same
//! teardown that `close` uses, so a half-loaded object never outlives the
//! call that created it.

use crate::api::{Linker, OpenFlags};
use crate::elf32::ElfInfo;
use crate::error::{dep_error, Error, Result};
use crate::host::{HostMemory, ProtFlags, PAGE_SIZE};
use crate::reader::ElfReader;
use crate::registry::{FiniArray, Handle, ObjHandle, Registry, MAX_DEPS};
use crate::relocation::{Relocator, SymResolver};
use crate::segment;
use std::sync::Arc;

/// Called once per init/fini array entry with the entry's base-space
/// address. The default handler casts the address to `extern "C" fn()`
/// and calls it; embedders whose target code cannot run in-process
/// (remote targets, tests) install their own.
///
/// Handlers must not call back into the [`Linker`] that invoked them.
pub type FnHandler = Arc<dyn Fn(usize) + Send + Sync>;

/// Entries a linker editor uses to terminate init/fini arrays early.
const ARRAY_SENTINELS: [u32; 2] = [0, u32::MAX];

pub(crate) fn default_handler() -> FnHandler {
    Arc::new(|addr| {
        let f: extern "C" fn() = unsafe { core::mem::transmute(addr) };
        f();
    })
}

/// Builds the path a dependency is loaded from: the dependant's directory
/// with the last path component replaced by the dependency's name.
fn dep_path(parent: Option<&str>, name: &str) -> String {
    match parent.and_then(|p| p.rfind('/')) {
        Some(slash) => format!("{}{}", &parent.unwrap()[..=slash], name),
        None => name.to_string(),
    }
}

impl<H: HostMemory> Linker<H> {
    /// Loads an object from `reader` under a fresh handle.
    pub(crate) fn load_object(
        &self,
        reader: &mut dyn ElfReader,
        path: Option<String>,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<Handle> {
        let handle = self.registry.create(path, flags.bits())?;
        log::debug!("loading \"{}\"", reader.shortname());
        match self.load_into(&handle, reader, flags, resolver) {
            Ok(()) => {
                log::debug!(
                    "loaded \"{}\" at {:#x}",
                    reader.shortname(),
                    handle.base()
                );
                Ok(Handle::Object(handle))
            }
            Err(err) => {
                if let Err(unwind) = self.release_handle(&handle) {
                    log::warn!("teardown after failed load also failed: {unwind}");
                }
                Err(err)
            }
        }
    }

    fn load_into(
        &self,
        handle: &ObjHandle,
        reader: &mut dyn ElfReader,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<()> {
        let mut info = crate::elf32::parse(reader)?;

        self.load_deps(handle, &info, flags, resolver)?;

        let size = segment::image_size(&info.phdrs)?;
        let pages = size / PAGE_SIZE;
        let origin = self.host.alloc_pages(pages)?;
        {
            let mut image = handle.image_mut();
            image.origin = Some(origin);
            image.size = size;
        }

        unsafe { segment::copy_segments(reader, &info.phdrs, origin, size)? };

        let base = unsafe { self.host.commit_pages(origin, pages)? };
        handle.image_mut().base = base;
        unsafe {
            self.host
                .protect(base, size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?
        };

        let program_resolver = *self.program_resolver.read();
        Relocator::new(handle, &self.registry, resolver, program_resolver).relocate(&info)?;

        unsafe { segment::protect_segments(&self.host, base, &info.phdrs)? };
        self.host.flush_data_cache();
        self.host.invalidate_instruction_cache();

        handle.image_mut().symbols = info.symbols.take();
        if let Some((vaddr, count)) = info.fini_array {
            // A fini array outside the image must fail the load now, not
            // the eventual teardown.
            self.read_array(handle, vaddr, count)?;
            handle.image_mut().fini = Some(FiniArray { vaddr, count });
        }

        self.run_init(handle, &info)
    }

    /// Loads `DT_NEEDED` dependencies into the handle's dependency list.
    ///
    /// With a caller resolver present, dependency loading is best effort:
    /// the resolver is expected to cover whatever the missing objects
    /// would have provided. Without one, any failure is fatal.
    fn load_deps(
        &self,
        handle: &ObjHandle,
        info: &ElfInfo,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<()> {
        let dep_flags = OpenFlags::NOW | (flags & OpenFlags::GLOBAL);
        for (count, name) in info.needed.iter().enumerate() {
            if count >= MAX_DEPS {
                if resolver.is_some() {
                    break;
                }
                return Err(Error::TooManyDeps);
            }
            let path = dep_path(handle.path(), name);
            match self.open_with(Some(&path), dep_flags, resolver) {
                Ok(Handle::Object(dep)) => handle.image_mut().deps.push(dep),
                Ok(Handle::Main) => unreachable!("dependency open always names an object"),
                Err(err) if resolver.is_some() => {
                    log::warn!("skipping dependency \"{name}\": {err}");
                    break;
                }
                Err(err) => return Err(dep_error(format!("\"{name}\": {err}"))),
            }
        }
        Ok(())
    }

    fn run_init(&self, handle: &ObjHandle, info: &ElfInfo) -> Result<()> {
        let Some((vaddr, count)) = info.init_array else {
            return Ok(());
        };
        let entries = self.read_array(handle, vaddr, count)?;
        for entry in entries {
            (self.init_fn)(entry as usize);
        }
        Ok(())
    }

    /// Reads a relocated init/fini array through the origin alias,
    /// dropping sentinel entries.
    fn read_array(&self, handle: &ObjHandle, vaddr: u32, count: usize) -> Result<Vec<u32>> {
        let image = handle.image();
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let entry = image.read_word(vaddr as usize + i * 4)?;
            if !ARRAY_SENTINELS.contains(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Drops one open count; unloads the object when the count reaches
    /// zero. Takes the registry lock once and holds it through any
    /// recursive dependency release.
    pub(crate) fn release_handle(&self, handle: &ObjHandle) -> Result<()> {
        let mut list = self.registry.lock();
        self.release_locked(&mut list, handle)
    }

    fn release_locked(&self, list: &mut Vec<ObjHandle>, handle: &ObjHandle) -> Result<()> {
        if handle.release()? > 1 {
            return Ok(());
        }
        self.unload_locked(list, handle)
    }

    fn unload_locked(&self, list: &mut Vec<ObjHandle>, handle: &ObjHandle) -> Result<()> {
        log::debug!("unloading {handle:?}");

        // Finalizers run in reverse array order.
        let fini = {
            let image = handle.image();
            image.fini
        };
        if let Some(FiniArray { vaddr, count }) = fini {
            // Teardown must reach the memory return and deregistration no
            // matter what; a bad array costs the finalizers, nothing more.
            match self.read_array(handle, vaddr, count) {
                Ok(entries) => {
                    for entry in entries.into_iter().rev() {
                        (self.fini_fn)(entry as usize);
                    }
                }
                Err(err) => log::warn!("skipping finalizers for {handle:?}: {err}"),
            }
        }

        // Failing to give memory back leaves the handle registered; there
        // is no state we could roll forward or back to.
        {
            let mut image = handle.image_mut();
            if let Some(origin) = image.origin {
                let pages = image.size / PAGE_SIZE;
                unsafe {
                    if image.base != 0 {
                        self.host
                            .release_pages(origin, image.base, pages)
                            .map_err(|_| Error::FreeFailed)?;
                    }
                    self.host
                        .free_pages(origin, pages)
                        .map_err(|_| Error::FreeFailed)?;
                }
                image.origin = None;
                image.base = 0;
                image.size = 0;
            }
            image.symbols = None;
            image.fini = None;
        }

        let deps: Vec<ObjHandle> = {
            let mut image = handle.image_mut();
            image.deps.drain(..).collect()
        };
        for dep in deps {
            if let Err(err) = self.release_locked(list, &dep) {
                log::warn!("releasing dependency {dep:?} failed: {err}");
            }
        }

        Registry::remove_locked(list, handle);
        Ok(())
    }
}
