//! Construction-time error type.
//!
//! This is deliberately separate from the allocator's hot-path OOM channel
//! (a null return from `alloc`, per `GlobalAlloc`'s own contract — see
//! [`crate::allocator`]). `Error` only surfaces from the one-time arena
//! setup path, which is allowed to return a typed `Result` the way the
//! rest of this crate's setup code (`build.rs`, `ffi.rs`) already does.

use core::fmt;

/// Errors that can occur while constructing an [`Allocator`](crate::allocator::Allocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `region_size` is too small to hold the arena header plus at least one
    /// slab of every configured size class.
    RegionTooSmall {
        /// The region size that was requested.
        requested: usize,
        /// The minimum region size that would have fit the header and one
        /// slab per size class.
        minimum: usize,
    },
    /// The platform shim failed to reserve `region_size` bytes of virtual
    /// memory (`mmap`/`VirtualAlloc` returned failure).
    OsReservationFailed,
    /// The generated size-class table failed a basic sanity check (empty,
    /// not ascending, or not 8-byte aligned). This indicates `build.rs` was
    /// given a malformed `rtmalloc.toml`/`RTMALLOC_CLASSES` override.
    InvalidSizeClassTable(&'static str),
    /// [`crate::allocator::RtMalloc::new_arena`] was called after the
    /// process-wide arena was already lazily initialized by a prior
    /// allocation.
    ArenaAlreadyInitialized,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RegionTooSmall { requested, minimum } => write!(
                f,
                "region_size {requested} is too small (needs at least {minimum} bytes)"
            ),
            Error::OsReservationFailed => {
                write!(f, "failed to reserve virtual memory for the arena")
            }
            Error::InvalidSizeClassTable(reason) => {
                write!(f, "invalid size-class table: {reason}")
            }
            Error::ArenaAlreadyInitialized => {
                write!(f, "global arena already initialized")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
