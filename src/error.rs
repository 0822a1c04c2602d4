use core::fmt::{self, Display};
use std::borrow::Cow;
use std::cell::Cell;

/// Error types used throughout the linker.
///
/// The taxonomy mirrors the conditions a `dlopen`-style loader can hit:
/// parameter validation, stream I/O, resource limits, structural ELF
/// problems, mapping/relocation failures, and the one unrecoverable case
/// (a failed unmap during teardown).
#[derive(Debug, Clone)]
pub enum Error {
    /// A parameter failed validation (bad flags, missing name, main handle
    /// where a real handle is required).
    InvalidParam,
    /// The input stream could not be opened or read.
    ReadFailed,
    /// The host allocator could not satisfy an allocation.
    NoMemory,
    /// The handle registry is at capacity.
    HandleLimit,
    /// The requested handle or symbol does not exist.
    NotFound,
    /// The object is structurally invalid.
    InvalidObject { msg: Cow<'static, str> },
    /// The object is not 32-bit.
    WrongClass,
    /// The object is not a shared object.
    NotSharedObject,
    /// The object targets an unsupported architecture.
    UnsupportedArch,
    /// Mapping, committing, or protecting object memory failed.
    MapFailed { msg: Cow<'static, str> },
    /// A relocation could not be resolved or applied.
    RelocFailed { msg: Cow<'static, str> },
    /// The object declares more dependencies than the loader supports.
    TooManyDeps,
    /// A dependency could not be loaded.
    DepFailed { msg: Cow<'static, str> },
    /// Releasing object memory failed during teardown. The handle remains
    /// registered in an inconsistent state; there is no clean recovery path
    /// short of process-level intervention.
    FreeFailed,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam => write!(f, "invalid parameter"),
            Error::ReadFailed => write!(f, "could not read input stream"),
            Error::NoMemory => write!(f, "no memory"),
            Error::HandleLimit => write!(f, "hit the handle limit"),
            Error::NotFound => write!(f, "not found"),
            Error::InvalidObject { msg } => write!(f, "invalid object: {msg}"),
            Error::WrongClass => write!(f, "the object is not 32-bit"),
            Error::NotSharedObject => write!(f, "the object is not shared"),
            Error::UnsupportedArch => write!(f, "invalid architecture"),
            Error::MapFailed { msg } => write!(f, "could not map object: {msg}"),
            Error::RelocFailed { msg } => write!(f, "relocation failed: {msg}"),
            Error::TooManyDeps => write!(f, "too many dependencies"),
            Error::DepFailed { msg } => write!(f, "could not load dependency: {msg}"),
            Error::FreeFailed => write!(f, "could not unload object"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn invalid_object(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidObject { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::MapFailed { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::RelocFailed { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn dep_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::DepFailed { msg: msg.into() }
}

thread_local! {
    static LAST_ERROR: Cell<Option<Error>> = const { Cell::new(None) };
}

/// Records the error produced by a public entry point in the calling
/// thread's last-error slot.
pub(crate) fn set_last_error(err: &Error) {
    LAST_ERROR.with(|slot| slot.set(Some(err.clone())));
}

/// Takes the calling thread's last recorded error, clearing the slot.
///
/// This is the `dlerror` analogue: every fallible public entry point on
/// [`Linker`](crate::Linker) stores exactly one error here before returning.
pub fn take_last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.take())
}

pub type Result<T> = core::result::Result<T, Error>;
