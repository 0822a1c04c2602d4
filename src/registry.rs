//! Loaded-object handles and the process-wide handle registry.
//!
//! Every successfully opened object is represented by an [`ObjHandle`]
//! registered in the [`Registry`]. The registry is a flat, capacity-capped
//! list: registration order is also the scan order for global symbol
//! lookup and for [`iterate`](crate::Linker::iterate).
//!
//! Reference counts are explicit open counts, not liveness: the count says
//! how many `open` calls must still be balanced by `close` before the
//! object is unloaded. Liveness of the bookkeeping itself is handled by
//! `Arc`, so a stale clone of a handle can never dangle.

use crate::error::{invalid_object, Error, Result};
use crate::symbol::SymbolTable;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Maximum number of simultaneously registered objects.
pub const MAX_HANDLES: usize = 32;
/// Maximum number of direct dependencies per object.
pub const MAX_DEPS: usize = 16;

/// Fini array location, captured at load time and run at unload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FiniArray {
    /// Virtual address of the array within the image.
    pub vaddr: u32,
    pub count: usize,
}

/// The in-memory state of a loaded object.
///
/// Populated progressively while loading: dependencies land first, then
/// the allocation, then the committed base, then symbols. A partially
/// populated image is exactly what teardown expects to see when a load
/// fails halfway.
pub(crate) struct Image {
    /// Writable host pointer to the allocation, if one exists yet.
    pub origin: Option<NonNull<u8>>,
    /// Executable alias address in the target space; 0 until committed.
    pub base: usize,
    /// Allocation size in bytes; 0 until sized.
    pub size: usize,
    /// Direct dependencies, in `DT_NEEDED` order.
    pub deps: Vec<ObjHandle>,
    pub fini: Option<FiniArray>,
    pub symbols: Option<SymbolTable>,
}

impl Image {
    fn empty() -> Self {
        Image {
            origin: None,
            base: 0,
            size: 0,
            deps: Vec::new(),
            fini: None,
            symbols: None,
        }
    }

    /// Whether `addr` falls within this image's base-space range. The top
    /// boundary is inclusive so a pointer one past a trailing function
    /// still attributes to the object.
    pub fn contains(&self, addr: usize) -> bool {
        self.size != 0 && addr >= self.base && addr <= self.base + self.size
    }

    /// Writes a word at the image offset `offset`, through the writable
    /// origin alias.
    pub fn write_word(&self, offset: usize, value: u32) -> Result<()> {
        let origin = self.spot(offset)?;
        unsafe { (origin as *mut u32).write_unaligned(value) };
        Ok(())
    }

    /// Reads a word at the image offset `offset`, through the origin alias.
    pub fn read_word(&self, offset: usize) -> Result<u32> {
        let origin = self.spot(offset)?;
        Ok(unsafe { (origin as *const u32).read_unaligned() })
    }

    fn spot(&self, offset: usize) -> Result<usize> {
        let origin = self.origin.ok_or(Error::NotFound)?;
        if offset
            .checked_add(4)
            .filter(|&end| end <= self.size)
            .is_none()
        {
            return Err(invalid_object("word access outside image"));
        }
        Ok(origin.as_ptr() as usize + offset)
    }
}

pub(crate) struct ObjectInner {
    /// Path or name the object was opened with; `None` for anonymous
    /// memory objects.
    path: Option<String>,
    refc: AtomicUsize,
    flags: AtomicU32,
    image: RwLock<Image>,
}

// The raw origin pointer is only dereferenced while holding the image
// lock, and the allocation it names is owned by this object alone.
unsafe impl Send for ObjectInner {}
unsafe impl Sync for ObjectInner {}

/// A reference to a loaded object.
///
/// Cloning is cheap and does not affect the open count; use
/// [`Linker::open`](crate::Linker::open) and
/// [`Linker::close`](crate::Linker::close) to manage that.
#[derive(Clone)]
pub struct ObjHandle {
    inner: Arc<ObjectInner>,
}

impl ObjHandle {
    pub(crate) fn new(path: Option<String>, flags: u32) -> Self {
        ObjHandle {
            inner: Arc::new(ObjectInner {
                path,
                refc: AtomicUsize::new(1),
                flags: AtomicU32::new(flags),
                image: RwLock::new(Image::empty()),
            }),
        }
    }

    /// The path or name this object was opened with.
    pub fn path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    /// Current open count.
    pub fn ref_count(&self) -> usize {
        self.inner.refc.load(Ordering::Acquire)
    }

    /// Base-space address of the image.
    pub fn base(&self) -> usize {
        self.inner.image.read().base
    }

    /// Image size in bytes.
    pub fn size(&self) -> usize {
        self.inner.image.read().size
    }

    pub(crate) fn acquire(&self) {
        self.inner.refc.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one open count, returning the count before the drop. A
    /// handle whose count already reached zero refuses the drop, so a
    /// stale clone can never wrap the count or re-run teardown.
    pub(crate) fn release(&self) -> Result<usize> {
        self.inner
            .refc
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| Error::InvalidParam)
    }

    pub(crate) fn flags(&self) -> u32 {
        self.inner.flags.load(Ordering::Acquire)
    }

    pub(crate) fn merge_flags(&self, flags: u32) {
        self.inner.flags.fetch_or(flags, Ordering::AcqRel);
    }

    pub(crate) fn image(&self) -> RwLockReadGuard<'_, Image> {
        self.inner.image.read()
    }

    pub(crate) fn image_mut(&self) -> RwLockWriteGuard<'_, Image> {
        self.inner.image.write()
    }

    /// Identity comparison: two handles are the same object iff they share
    /// bookkeeping.
    pub fn ptr_eq(&self, other: &ObjHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl core::fmt::Debug for ObjHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjHandle")
            .field("path", &self.inner.path)
            .field("refc", &self.ref_count())
            .finish()
    }
}

/// A handle returned by [`Linker::open`](crate::Linker::open).
#[derive(Clone, Debug)]
pub enum Handle {
    /// The pseudo-handle for the main program itself. Symbol lookup goes
    /// through the program resolver; closing it is a no-op.
    Main,
    /// A loaded shared object.
    Object(ObjHandle),
}

impl Handle {
    pub(crate) fn object(&self) -> Result<&ObjHandle> {
        match self {
            Handle::Main => Err(Error::InvalidParam),
            Handle::Object(h) => Ok(h),
        }
    }
}

/// The process-wide table of loaded objects.
pub(crate) struct Registry {
    list: Mutex<Vec<ObjHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<ObjHandle>> {
        self.list.lock()
    }

    /// Registers a fresh handle with an open count of one.
    pub fn create(&self, path: Option<String>, flags: u32) -> Result<ObjHandle> {
        let mut list = self.list.lock();
        if list.len() >= MAX_HANDLES {
            return Err(Error::HandleLimit);
        }
        let handle = ObjHandle::new(path, flags);
        list.push(handle.clone());
        Ok(handle)
    }

    /// Finds an already-registered object whose stored path contains
    /// `name`, bumping its open count.
    pub fn acquire_existing(&self, name: &str) -> Option<ObjHandle> {
        let list = self.list.lock();
        let found = list
            .iter()
            .find(|h| h.path().is_some_and(|p| p.contains(name)))?;
        found.acquire();
        Some(found.clone())
    }

    /// Finds the registered object whose image covers `addr`.
    pub fn find_by_addr(&self, addr: usize) -> Option<ObjHandle> {
        let list = self.list.lock();
        list.iter().find(|h| h.image().contains(addr)).cloned()
    }

    /// Like [`find_by_addr`](Registry::find_by_addr), but bumps the open
    /// count before the registry lock is released, so a concurrent close
    /// cannot tear the object down between lookup and acquisition.
    pub fn find_by_addr_acquire(&self, addr: usize) -> Option<ObjHandle> {
        let list = self.list.lock();
        let found = list.iter().find(|h| h.image().contains(addr))?;
        found.acquire();
        Some(found.clone())
    }

    /// Clones the current registration order.
    pub fn snapshot(&self) -> Vec<ObjHandle> {
        self.list.lock().clone()
    }

    /// Drops `handle` from the registry. Storage is shrunk once the list
    /// falls to half its capacity so a burst of loads does not pin memory
    /// forever.
    pub fn remove_locked(list: &mut Vec<ObjHandle>, handle: &ObjHandle) {
        list.retain(|h| !h.ptr_eq(handle));
        if list.len() <= list.capacity() / 2 {
            list.shrink_to_fit();
        }
    }
}
