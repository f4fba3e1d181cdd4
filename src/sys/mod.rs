//! Raw map/unmap primitive.
//!
//! A thin layer over the OS facility for anonymous memory: `mmap`/`munmap`/`mprotect` on
//! POSIX systems, and a pagefile-backed section (create, map view, close handle) on Windows.
//! Everything above this module works with [`MemoryRegion`] and never touches the OS
//! directly, with the exception of the process-map readers in [`crate::maps`].
//!
//! # Placement hints
//!
//! [`map`] accepts a hint address. A zero hint lets the OS choose. A non-zero hint is
//! requested with the strongest *non-clobbering* placement flag the OS offers
//! (`MAP_FIXED_NOREPLACE` on Linux and Android, `MAP_FIXED | MAP_EXCL` on FreeBSD, a base
//! address for `MapViewOfFileEx` on Windows). Elsewhere the hint is advisory, as it is on
//! code-signing-enforced ARM64 targets that refuse fixed placement of JIT memory. Callers
//! must therefore check where the region actually landed.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

use crate::{
    region::{MemoryRegion, Protection, RegionKind},
    Error, Result,
};

/// Maps `size` bytes of anonymous memory with `protection`, optionally at `hint`.
///
/// `size` must already be rounded to [`crate::region::granularity`]; `hint` must be
/// granularity aligned or zero. `kind` selects platform-specific treatment of JIT memory
/// (e.g. `MAP_JIT` on Apple ARM64).
///
/// # Errors
/// Returns [`Error::InvalidArgument`] for a zero size and [`Error::Os`] if the OS refuses
/// the mapping (including a collision at a fixed hint).
pub fn map(size: usize, protection: Protection, hint: usize, kind: RegionKind) -> Result<MemoryRegion> {
    if size == 0 {
        return Err(Error::InvalidArgument(
            "cannot map a zero-sized region".to_string(),
        ));
    }

    let start = platform::map(size, protection, hint, kind)?;
    match unsafe { MemoryRegion::from_raw_parts(start, size, protection, kind) } {
        Some(region) => Ok(region),
        None => Err(Error::Os {
            operation: "mmap",
            code: 0,
        }),
    }
}

/// Unmaps a region previously returned by [`map`].
///
/// The region is consumed; a failed unmap is reported, not retried.
///
/// # Errors
/// Returns [`Error::Os`] if the OS call fails, e.g. because the span was already unmapped
/// by someone else.
pub fn unmap(region: MemoryRegion) -> Result<()> {
    unmap_raw(region.start(), region.len())
}

/// Unmaps `len` bytes at `start`, as recorded by the region tracker.
pub(crate) fn unmap_raw(start: usize, len: usize) -> Result<()> {
    platform::unmap(start, len)
}

/// Changes the protection of `len` bytes at `start`.
///
/// # Errors
/// Returns [`Error::Os`] if the OS refuses the change.
pub fn protect(start: usize, len: usize, protection: Protection) -> Result<()> {
    platform::protect(start, len, protection)
}

/// Returns the load address of the image containing this crate's code.
///
/// This is the default reachability anchor. It is cheap and is queried afresh on every
/// code acquisition, since modules loaded in between can change what a caller means by
/// "the image".
///
/// # Errors
/// Returns [`Error::NotSupported`] if the dynamic loader cannot attribute our own code to
/// an image, or [`Error::Os`] on Windows if the module lookup fails.
pub fn image_base() -> Result<usize> {
    platform::image_base(image_base as usize)
}

/// Highest user-space address (exclusive) a mapping can end at.
#[must_use]
pub fn address_space_ceiling() -> usize {
    platform::address_space_ceiling()
}

pub(crate) fn query_granularity() -> usize {
    platform::query_granularity()
}
