//! Gap-finding allocator for reachable code regions.
//!
//! Relocated code usually refers back into the host image through 32-bit displacements, so
//! a code region is only usable if it lands within a fixed window after the anchor image.
//! The OS offers no call for "map anywhere in this window", so the allocator finds the
//! window's free space itself and claims it piece by piece:
//!
//! 1. Take a fresh snapshot of the process map from a [`MapSource`]
//! 2. Compute the gaps between occupied mappings, bounded above by the window ceiling
//! 3. Keep the gaps above the anchor that can hold the request ([`find_candidate_gaps`])
//! 4. Try placement at successive strides through each gap, nearest first
//! 5. Check that the mapping the OS returned is really inside the window
//!
//! A failed placement attempt usually means something else mapped the address after the
//! snapshot was taken; it is counted and the next stride is tried. The number of attempts
//! per gap is bounded by [`GapAllocator::with_max_strides_per_gap`].
//!
//! # Concurrency
//!
//! Attempts are serialised by one process-wide lock held for the whole attempt, so two
//! attempts in this process never reason about the same snapshot, even when they come from
//! different allocators. Code outside the mapper that maps memory
//! between the snapshot and the claim is not excluded; the non-clobbering placement flags
//! of [`crate::sys::map`] make that race fail the stride rather than overwrite anything.

mod gap;

pub use gap::{compute_gaps, find_candidate_gaps, Gap};

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use crate::{
    maps::MapSource,
    region::{granularity, MemoryRegion, Protection, RegionKind},
    sys, Error, Result,
};

/// Default bound on placement attempts within one gap.
pub const DEFAULT_MAX_STRIDES_PER_GAP: usize = 256;

/// Held from snapshot to claim by every allocation attempt in the process.
static ALLOCATION_LOCK: Mutex<()> = Mutex::new(());

/// Something that can claim memory at a hinted address.
///
/// The production implementation is [`SysPlacer`]; the allocator only depends on this
/// trait so the stride walk can be driven against a synthetic address space.
pub trait Placer {
    /// Maps `size` bytes, asking for placement at `hint`.
    ///
    /// # Errors
    /// Any error is treated as a lost race for that address.
    fn place(&mut self, size: usize, hint: usize) -> Result<MemoryRegion>;

    /// Gives back a region returned by [`Placer::place`] that turned out to be unusable.
    ///
    /// # Errors
    /// Returns the failure of the underlying unmap.
    fn discard(&mut self, region: MemoryRegion) -> Result<()>;
}

/// Places regions through the raw OS primitive.
#[derive(Debug, Clone, Copy)]
pub struct SysPlacer {
    protection: Protection,
    kind: RegionKind,
}

impl SysPlacer {
    /// Creates a placer mapping with `protection` for regions of `kind`.
    #[must_use]
    pub fn new(protection: Protection, kind: RegionKind) -> Self {
        SysPlacer { protection, kind }
    }
}

impl Placer for SysPlacer {
    fn place(&mut self, size: usize, hint: usize) -> Result<MemoryRegion> {
        sys::map(size, self.protection, hint, self.kind)
    }

    fn discard(&mut self, region: MemoryRegion) -> Result<()> {
        sys::unmap(region)
    }
}

/// Finds and claims free space within a displacement window after an anchor.
#[derive(Debug)]
pub struct GapAllocator {
    failed_attempts: AtomicUsize,
    max_displacement: usize,
    max_strides_per_gap: usize,
    address_space_ceiling: usize,
    align: usize,
}

impl GapAllocator {
    /// Creates an allocator with a window of `max_displacement` bytes after the anchor.
    #[must_use]
    pub fn new(max_displacement: usize) -> Self {
        GapAllocator {
            failed_attempts: AtomicUsize::new(0),
            max_displacement,
            max_strides_per_gap: DEFAULT_MAX_STRIDES_PER_GAP,
            address_space_ceiling: sys::address_space_ceiling(),
            align: granularity(),
        }
    }

    /// Bounds the number of placement attempts made inside any single gap.
    #[must_use]
    pub fn with_max_strides_per_gap(mut self, max_strides_per_gap: usize) -> Self {
        self.max_strides_per_gap = max_strides_per_gap;
        self
    }

    /// Overrides the top of the usable address space.
    #[must_use]
    pub fn with_address_space_ceiling(mut self, ceiling: usize) -> Self {
        self.address_space_ceiling = ceiling;
        self
    }

    /// Overrides the alignment of candidate addresses, which must be a power of two.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `align` is not a power of two.
    pub fn with_alignment(mut self, align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {align:#x} is not a power of two"
            )));
        }
        self.align = align;
        Ok(self)
    }

    /// Width of the window after the anchor.
    #[must_use]
    pub fn max_displacement(&self) -> usize {
        self.max_displacement
    }

    /// Placement attempts that failed since construction.
    #[must_use]
    pub fn failed_attempts(&self) -> usize {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Highest address (exclusive) a region anchored at `reference` may end at.
    #[must_use]
    pub fn ceiling(&self, reference: usize) -> usize {
        self.address_space_ceiling
            .min(reference.saturating_add(self.max_displacement))
    }

    /// Returns `true` if `start..end` lies after `reference` and within the window.
    #[must_use]
    pub fn within_window(&self, start: usize, end: usize, reference: usize) -> bool {
        start > reference && end >= start && end - reference <= self.max_displacement
    }

    /// Claims `size` bytes within the window after `reference`.
    ///
    /// `size` must already be rounded to the placement alignment. Only one attempt runs at
    /// a time in the process, across all allocators.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size
    /// - [`Error::NoSpace`] if every candidate stride of every candidate gap failed, or no
    ///   gap qualified at all; carries the occupied-range table of the snapshot
    /// - [`Error::ConstraintViolation`] if the OS placed the mapping outside the window;
    ///   the mapping has been discarded
    /// - The error of `source` if the process map could not be read
    pub fn acquire(
        &self,
        size: usize,
        reference: usize,
        source: &dyn MapSource,
        placer: &mut dyn Placer,
    ) -> Result<MemoryRegion> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot place a zero-sized region".to_string(),
            ));
        }

        let _guard = lock!(ALLOCATION_LOCK);

        let ceiling = self.ceiling(reference);
        let table = source.current_mappings()?;
        let candidates = find_candidate_gaps(table.as_slice(), reference, size, ceiling);

        for gap in &candidates {
            for hint in gap
                .strides(size, self.align)
                .take(self.max_strides_per_gap)
            {
                let region = match placer.place(size, hint) {
                    Ok(region) => region,
                    Err(error) => {
                        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                        log::trace!("placement at {hint:#x} in gap {gap} failed: {error}");
                        continue;
                    }
                };

                if self.within_window(region.start(), region.end(), reference) {
                    return Ok(region);
                }

                let (address, end) = (region.start(), region.end());
                log::warn!(
                    "hinted mapping at {hint:#x} was placed at {address:#x}..{end:#x}, outside the window of {reference:#x}"
                );
                placer.discard(region)?;

                return Err(Error::ConstraintViolation {
                    address,
                    end,
                    reference,
                    limit: self.max_displacement,
                });
            }
        }

        Err(Error::NoSpace {
            size,
            occupied: table.occupied_table(),
        })
    }
}
