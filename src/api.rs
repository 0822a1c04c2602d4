//! The public `dlopen`-family surface.
//!
//! [`Linker`] owns the handle registry and the host-memory backend, and
//! exposes the four classic entry points — open, sym, close, and address
//! lookup — plus handle enumeration. Every fallible entry point records
//! its error in the calling thread's last-error slot before returning, so
//! bindings can offer a `dlerror` equivalent through
//! [`take_last_error`](crate::take_last_error).

use crate::error::{set_last_error, Error, Result};
use crate::host::HostMemory;
use crate::loader::{default_handler, FnHandler};
use crate::reader::{ElfBinary, ElfFile, ElfReader};
use crate::registry::{Handle, Registry};
use crate::relocation::SymResolver;
use crate::symbol::lookup_dep_order;
use bitflags::bitflags;
use parking_lot::RwLock;

bitflags! {
    /// Open-mode flags.
    ///
    /// Binding is always eager, so [`NOW`](OpenFlags::NOW) is mandatory
    /// and [`LAZY`](OpenFlags::LAZY) is refused. Local visibility is the
    /// absence of [`GLOBAL`](OpenFlags::GLOBAL).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Lazy binding. Not supported; opening with this flag fails.
        const LAZY = 0x1;
        /// Eager binding. Required.
        const NOW = 0x2;
        /// Only look up an already-loaded object, never load.
        const NOLOAD = 0x4;
        /// Self-contained lookup scope. Not supported.
        const DEEPBIND = 0x8;
        /// Export the object's symbols to every later load.
        const GLOBAL = 0x100;
        /// Pin the object in memory. Not supported.
        const NODELETE = 0x1000;
    }
}

fn validate_flags(flags: OpenFlags) -> Result<()> {
    if flags.intersects(OpenFlags::LAZY | OpenFlags::DEEPBIND | OpenFlags::NODELETE) {
        return Err(Error::InvalidParam);
    }
    if !flags.contains(OpenFlags::NOW) {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

/// What [`Linker::addr_info`] reports about an address.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    /// Path the covering object was opened with.
    pub path: Option<String>,
    /// Base address of the covering object.
    pub base: usize,
    /// Image size of the covering object.
    pub size: usize,
    /// Name of the nearest symbol whose extent contains the address.
    pub sym_name: Option<String>,
    /// Base-space address of that symbol.
    pub sym_addr: Option<usize>,
}

/// What [`Linker::info`] reports about a handle.
#[derive(Debug, Clone)]
pub struct ObjInfo {
    pub path: Option<String>,
    pub base: usize,
    pub size: usize,
}

/// The linker instance.
///
/// Generic over its [`HostMemory`] backend so the same pipeline runs
/// against real code-page syscalls on the target and a mock host in
/// tests. All methods take `&self`; the registry carries its own lock.
pub struct Linker<H: HostMemory> {
    pub(crate) host: H,
    pub(crate) registry: Registry,
    pub(crate) init_fn: FnHandler,
    pub(crate) fini_fn: FnHandler,
    pub(crate) program_resolver: RwLock<Option<fn(&str) -> Option<usize>>>,
}

fn record<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        set_last_error(err);
    }
    result
}

impl<H: HostMemory> Linker<H> {
    pub fn new(host: H) -> Self {
        Linker {
            host,
            registry: Registry::new(),
            init_fn: default_handler(),
            fini_fn: default_handler(),
            program_resolver: RwLock::new(None),
        }
    }

    /// Replaces the initializer handler. Handlers must not call back into
    /// this linker.
    pub fn with_init(mut self, handler: FnHandler) -> Self {
        self.init_fn = handler;
        self
    }

    /// Replaces the finalizer handler.
    pub fn with_fini(mut self, handler: FnHandler) -> Self {
        self.fini_fn = handler;
        self
    }

    /// Installs or clears the program resolver: the table of symbols the
    /// main program itself exports to loaded objects.
    pub fn set_program_resolver(&self, resolver: Option<fn(&str) -> Option<usize>>) {
        *self.program_resolver.write() = resolver;
    }

    /// Opens the object at `name`, or the main pseudo-handle when `name`
    /// is `None`. Opening an already-loaded object bumps its open count
    /// instead of loading a second copy.
    pub fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<Handle> {
        record(self.open_with(name, flags, None))
    }

    /// Like [`open`](Linker::open), with a resolver consulted before any
    /// other source during relocation. With a resolver present, missing
    /// dependencies are tolerated.
    pub fn open_with_resolver(
        &self,
        name: Option<&str>,
        flags: OpenFlags,
        resolver: &SymResolver,
    ) -> Result<Handle> {
        record(self.open_with(name, flags, Some(resolver)))
    }

    /// Opens an object from a byte buffer. `name` is optional and only
    /// used for duplicate detection and diagnostics.
    pub fn open_from_memory(
        &self,
        name: Option<&str>,
        bytes: &[u8],
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<Handle> {
        let mut reader = ElfBinary::new(name.unwrap_or("<memory>"), bytes);
        record(self.open_from(&mut reader, name.map(str::to_string), flags, resolver))
    }

    /// Opens an object from an arbitrary [`ElfReader`].
    pub fn open_from_reader(
        &self,
        reader: &mut dyn ElfReader,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<Handle> {
        let name = reader.file_name().to_string();
        record(self.open_from(reader, Some(name), flags, resolver))
    }

    pub(crate) fn open_with(
        &self,
        name: Option<&str>,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<Handle> {
        validate_flags(flags)?;
        let Some(name) = name else {
            return Ok(Handle::Main);
        };
        if let Some(existing) = self.registry.acquire_existing(name) {
            existing.merge_flags((flags & OpenFlags::GLOBAL).bits());
            return Ok(Handle::Object(existing));
        }
        if flags.contains(OpenFlags::NOLOAD) {
            return Err(Error::NotFound);
        }
        let mut reader = ElfFile::from_path(name)?;
        self.load_object(&mut reader, Some(name.to_string()), flags, resolver)
    }

    fn open_from(
        &self,
        reader: &mut dyn ElfReader,
        name: Option<String>,
        flags: OpenFlags,
        resolver: Option<&SymResolver>,
    ) -> Result<Handle> {
        validate_flags(flags)?;
        if let Some(name) = name.as_deref() {
            if let Some(existing) = self.registry.acquire_existing(name) {
                existing.merge_flags((flags & OpenFlags::GLOBAL).bits());
                return Ok(Handle::Object(existing));
            }
        }
        if flags.contains(OpenFlags::NOLOAD) {
            return Err(Error::NotFound);
        }
        self.load_object(reader, name, flags, resolver)
    }

    /// Looks up `name` and returns its base-space address.
    ///
    /// On the main pseudo-handle the program resolver is consulted first,
    /// then the exports of every global object in registration order. On
    /// a real handle the search is breadth-first over its dependency
    /// graph.
    pub fn sym(&self, handle: &Handle, name: &str) -> Result<usize> {
        record(match handle {
            Handle::Main => self.sym_from_main(name).ok_or(Error::NotFound),
            Handle::Object(h) => lookup_dep_order(h, name).ok_or(Error::NotFound),
        })
    }

    fn sym_from_main(&self, name: &str) -> Option<usize> {
        if let Some(resolver) = *self.program_resolver.read() {
            if let Some(addr) = resolver(name) {
                return Some(addr);
            }
        }
        let global = OpenFlags::GLOBAL.bits();
        self.registry
            .snapshot()
            .iter()
            .filter(|h| h.flags() & global != 0)
            .find_map(|h| {
                let image = h.image();
                let sym = image.symbols.as_ref()?.lookup(name)?.1;
                Some(image.base + sym.st_value as usize)
            })
    }

    /// Drops one open count on `handle`; the object is unloaded when the
    /// count reaches zero. Closing the main pseudo-handle does nothing.
    pub fn close(&self, handle: Handle) -> Result<()> {
        record(match handle {
            Handle::Main => Ok(()),
            Handle::Object(h) => self.release_handle(&h),
        })
    }

    /// Attributes `addr` to a loaded object and, when possible, to a
    /// symbol within it.
    pub fn addr_info(&self, addr: usize) -> Result<AddrInfo> {
        record(self.addr_info_inner(addr))
    }

    fn addr_info_inner(&self, addr: usize) -> Result<AddrInfo> {
        let handle = self.registry.find_by_addr(addr).ok_or(Error::NotFound)?;
        let image = handle.image();
        let (sym_name, sym_addr) = image
            .symbols
            .as_ref()
            .and_then(|table| {
                let (_, sym) = table.by_value((addr - image.base) as u32)?;
                Some((
                    table.sym_name(sym).map(str::to_string),
                    Some(image.base + sym.st_value as usize),
                ))
            })
            .unwrap_or((None, None));
        Ok(AddrInfo {
            path: handle.path().map(str::to_string),
            base: image.base,
            size: image.size,
            sym_name,
            sym_addr,
        })
    }

    /// Returns a handle to the object covering `addr`, bumping its open
    /// count. The caller owes a matching [`close`](Linker::close).
    pub fn handle_by_address(&self, addr: usize) -> Result<Handle> {
        record(
            self.registry
                .find_by_addr_acquire(addr)
                .map(Handle::Object)
                .ok_or(Error::NotFound),
        )
    }

    /// Reports path, base, and size for a real handle.
    pub fn info(&self, handle: &Handle) -> Result<ObjInfo> {
        record(handle.object().map(|h| ObjInfo {
            path: h.path().map(str::to_string),
            base: h.base(),
            size: h.size(),
        }))
    }

    /// Calls `f` for the main pseudo-handle, then for every registered
    /// object in registration order.
    pub fn iterate(&self, mut f: impl FnMut(&Handle)) {
        f(&Handle::Main);
        for handle in self.registry.snapshot() {
            f(&Handle::Object(handle));
        }
    }
}
