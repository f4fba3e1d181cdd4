//! Owned spans of process address space.
//!
//! This module provides [`MemoryRegion`], the unit every other part of the mapper hands
//! around: a contiguous, granularity-aligned span of address space with a protection set,
//! created by the raw primitive in [`crate::sys`] and destroyed by unmapping it exactly
//! once through [`crate::MemoryMapper::release_region`].
//!
//! # Key Components
//!
//! - [`MemoryRegion`] - The owned span, with bounded write access
//! - [`Protection`] - Read/write/execute permission bits
//! - [`RegionKind`] - Whether a region was acquired for code or for data
//! - [`granularity`] / [`round_up`] - Platform allocation granularity helpers
//! - [`tracker::RegionTracker`] - Table of live regions used to validate releases
//!
//! # Ownership
//!
//! A [`MemoryRegion`] is not `Clone` and does not unmap itself on drop. The loader owns it
//! from acquisition until it passes it back for release; dropping it without releasing
//! leaks the mapping, which is preferable to unmapping code another thread may still be
//! executing.

pub mod tracker;

use std::{fmt, ptr::NonNull, sync::OnceLock};

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{Error, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Access permissions of a mapped span
    pub struct Protection : u8 {
        /// Pages may be read
        const READ = 0x1;
        /// Pages may be written
        const WRITE = 0x2;
        /// Pages may be executed
        const EXEC = 0x4;

        /// Read and write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute
        const READ_EXEC = Self::READ.bits() | Self::EXEC.bits();
        /// Read, write and execute
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Protection, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Protection::READ, 'r'),
            flag(Protection::WRITE, 'w'),
            flag(Protection::EXEC, 'x')
        )
    }
}

/// What a region was acquired for.
///
/// Code regions are placed within reach of the anchor image and take part in the W^X
/// protocol; data regions are placed wherever the OS chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum RegionKind {
    /// Relocated machine code
    Code,
    /// Relocated data, never executed
    Data,
}

/// Returns the platform allocation granularity in bytes.
///
/// On POSIX systems this is the page size. On Windows it is the allocation granularity
/// (typically 64 KiB), since section views can only be placed on that boundary.
pub fn granularity() -> usize {
    static GRANULARITY: OnceLock<usize> = OnceLock::new();
    *GRANULARITY.get_or_init(crate::sys::query_granularity)
}

/// Rounds `size` up to the next multiple of `align`, which must be a power of two.
///
/// Returns `None` if the rounded value would overflow.
#[must_use]
pub fn round_up(size: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    size.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Validates a requested size and rounds it to the platform granularity.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] for a zero size or a size that overflows when
/// rounded.
pub fn page_rounded(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::InvalidArgument(
            "region size must be greater than zero".to_string(),
        ));
    }

    round_up(size, granularity()).ok_or_else(|| {
        Error::InvalidArgument(format!("region size {size:#x} overflows when rounded"))
    })
}

/// An owned, contiguous span of process address space.
///
/// The span starts on a granularity boundary and its length is a multiple of the
/// granularity. Its identity, used by [`tracker::RegionTracker`], is the address of its
/// last byte.
///
/// # Examples
///
/// ```rust,no_run
/// use nearmap::MemoryMapper;
///
/// let mapper = MemoryMapper::global()?;
/// let mut region = mapper.acquire_data_region(100)?;
/// region.write(0, &[1, 2, 3, 4])?;
/// assert_eq!(&region.as_slice()[..4], &[1, 2, 3, 4]);
/// mapper.release_region(region)?;
/// # Ok::<(), nearmap::Error>(())
/// ```
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
    protection: Protection,
    kind: RegionKind,
    writable: bool,
}

// The region is a plain address range; synchronisation of writes is the owner's duty.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Creates a region descriptor from raw parts.
    ///
    /// This is how the raw primitive wraps a fresh mapping, and how a loader that
    /// persisted a region's address can rebuild a descriptor to release it.
    ///
    /// # Safety
    /// `start..start + len` must be a mapping obtained from [`crate::sys::map`] with
    /// `protection`, not yet unmapped, and not described by any other live descriptor.
    /// A descriptor that does not satisfy this is rejected by the tracker on release, but
    /// reading or writing through it is undefined behaviour.
    ///
    /// Returns `None` if `start` is null.
    #[must_use]
    pub unsafe fn from_raw_parts(
        start: usize,
        len: usize,
        protection: Protection,
        kind: RegionKind,
    ) -> Option<Self> {
        Some(MemoryRegion {
            ptr: NonNull::new(start as *mut u8)?,
            len,
            protection,
            kind,
            writable: protection.contains(Protection::WRITE),
        })
    }

    /// Start address of the region.
    #[inline]
    #[must_use]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// End address of the region (exclusive).
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    /// Address of the last byte, the region's tracker identity.
    #[inline]
    #[must_use]
    pub fn last_byte(&self) -> usize {
        self.end() - 1
    }

    /// Length of the region in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; present for API symmetry.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Protection the region was mapped with.
    #[inline]
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// What the region was acquired for.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Whether the region currently accepts writes.
    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Returns `true` if `addr` lies inside `[start, end)`.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Pointer to the first byte.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable pointer to the first byte.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The whole region as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole region as a mutable byte slice.
    ///
    /// # Errors
    /// Returns [`Error::NotWritable`] while the region is flipped executable.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(Error::NotWritable);
        }

        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Copies `bytes` into the region at `offset`.
    ///
    /// # Errors
    /// Returns [`Error::NotWritable`] while the region is flipped executable, and
    /// [`Error::OutOfBounds`] if the write would run past the end of the region.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let Some(offset_end) = offset.checked_add(bytes.len()) else {
            return Err(Error::OutOfBounds);
        };

        if offset_end > self.len {
            return Err(Error::OutOfBounds);
        }

        let target = self.as_mut_slice()?;
        target[offset..offset_end].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("len", &format_args!("{:#x}", self.len))
            .field("protection", &format_args!("{}", self.protection))
            .field("kind", &self.kind)
            .field("writable", &self.writable)
            .finish()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}-{:#x} {} {}",
            self.start(),
            self.end(),
            self.protection,
            self.kind
        )
    }
}
