//! # rtld32
//! A user-space dynamic linker for 32-bit ELF shared objects, for platforms
//! that have no native `dlopen` support.
//!
//! The crate implements the loader/relocator/symbol-resolution core of a
//! `dlopen`/`dlsym`/`dlclose`/`dladdr`-style runtime linker: handle lifecycle
//! and reference counting, structural ELF parsing over a seek/read stream,
//! segment mapping with split write/execute addressing ("mirror" addressing),
//! recursive dependency loading, eager relocation, and the lookup orderings
//! used by the different API entry points.
//!
//! Platform services (page allocation, the executable alias, permission
//! changes, cache maintenance) are abstracted behind the [`HostMemory`]
//! trait, so the same linker runs against real MMU primitives on the target
//! and against a mock host in tests.
//!
//! ## Example
//! ```no_run
//! use rtld32::{Linker, HeapHost, OpenFlags};
//!
//! let linker = Linker::new(HeapHost::new());
//! let handle = linker.open(Some("sdmc:/plugins/libfoo.so"), OpenFlags::NOW).unwrap();
//! let addr = linker.sym(&handle, "foo_entry").unwrap();
//! linker.close(handle).unwrap();
//! ```

mod api;
pub mod arch;
mod elf32;
mod error;
pub mod host;
mod loader;
mod reader;
mod registry;
mod relocation;
mod segment;
mod symbol;

pub use api::{AddrInfo, Linker, ObjInfo, OpenFlags};
pub use error::{take_last_error, Error, Result};
pub use host::{HeapHost, HostMemory, ProtFlags};
pub use loader::FnHandler;
pub use reader::{ElfBinary, ElfFile, ElfReader};
pub use registry::{Handle, ObjHandle, MAX_DEPS, MAX_HANDLES};
pub use relocation::SymResolver;
