//! Table of live regions issued by the mapper.
//!
//! Each live [`MemoryRegion`] has exactly one [`RegionTrackerEntry`], keyed by the address
//! of the region's last byte. The entry remembers the region's full extent so a release
//! request can be checked against what was actually issued: a descriptor whose last byte
//! is unknown, or whose start does not match (a sub-slice or a forged descriptor), is
//! rejected with [`Error::NotFound`].
//!
//! Mutations are serialised under a single coarse lock. Region acquisition and release are
//! rare compared with ordinary work in the host process, so nothing finer is warranted.
//! Lookups ([`RegionTracker::contains`], [`RegionTracker::region_containing`]) read the
//! ordered index directly and never block.

use std::sync::Mutex;

use crossbeam_skiplist::SkipMap;

use crate::{
    region::{MemoryRegion, RegionKind},
    Error, Result,
};

/// The recorded extent of a live region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTrackerEntry {
    /// Start address of the region
    pub start: usize,
    /// Length of the region in bytes
    pub len: usize,
    /// What the region was acquired for
    pub kind: RegionKind,
}

impl RegionTrackerEntry {
    /// End address (exclusive).
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Address of the last byte; the key of this entry.
    #[must_use]
    pub fn last_byte(&self) -> usize {
        self.end() - 1
    }

    /// Returns `true` if `addr` lies inside the recorded extent.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

impl From<&MemoryRegion> for RegionTrackerEntry {
    fn from(region: &MemoryRegion) -> Self {
        RegionTrackerEntry {
            start: region.start(),
            len: region.len(),
            kind: region.kind(),
        }
    }
}

/// Concurrency-guarded table of live regions.
///
/// # Examples
///
/// ```rust,ignore
/// let tracker = RegionTracker::new();
/// tracker.register(&region)?;
/// assert!(tracker.contains(region.start()));
/// tracker.release(&region)?;
/// assert!(tracker.release(&region).is_err());
/// ```
#[derive(Debug, Default)]
pub struct RegionTracker {
    guard: Mutex<()>,
    entries: SkipMap<usize, RegionTrackerEntry>,
}

impl RegionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        RegionTracker::default()
    }

    /// Records a newly acquired region.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a live entry with the same identity already
    /// exists, which would mean the same span was handed out twice.
    pub fn register(&self, region: &MemoryRegion) -> Result<RegionTrackerEntry> {
        let _guard = lock!(self.guard);

        let entry = RegionTrackerEntry::from(region);
        if self.entries.contains_key(&entry.last_byte()) {
            return Err(Error::InvalidArgument(format!(
                "region ending at {:#x} is already tracked",
                entry.last_byte()
            )));
        }

        self.entries.insert(entry.last_byte(), entry);
        Ok(entry)
    }

    /// Validates and forgets a region.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the region's identity is unknown or its start does
    /// not match the recorded one.
    pub fn release(&self, region: &MemoryRegion) -> Result<()> {
        self.release_with(region, |_| Ok(())).map(|_| ())
    }

    /// Validates a region, runs `teardown` on its recorded extent, and forgets it.
    ///
    /// `teardown` runs while the tracker lock is held, so the entry disappears atomically
    /// with whatever `teardown` does (the unmap). If `teardown` fails the entry is kept,
    /// since the span may well still be mapped.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] as [`RegionTracker::release`] does, or the error
    /// returned by `teardown`.
    pub fn release_with<F>(&self, region: &MemoryRegion, teardown: F) -> Result<RegionTrackerEntry>
    where
        F: FnOnce(&RegionTrackerEntry) -> Result<()>,
    {
        let _guard = lock!(self.guard);

        let key = region.last_byte();
        let entry = match self.entries.get(&key) {
            Some(found) => *found.value(),
            None => return Err(Error::NotFound(key)),
        };

        if entry.start != region.start() {
            return Err(Error::NotFound(key));
        }

        teardown(&entry)?;
        self.entries.remove(&key);
        Ok(entry)
    }

    /// Returns `true` if `addr` lies inside any live region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.region_containing(addr).is_some()
    }

    /// Returns the live region containing `addr`, if any.
    #[must_use]
    pub fn region_containing(&self, addr: usize) -> Option<RegionTrackerEntry> {
        let candidate = self.entries.range(addr..).next()?;
        let entry = *candidate.value();
        entry.contains(addr).then_some(entry)
    }

    /// Snapshot of all live entries, ascending by address.
    #[must_use]
    pub fn entries(&self) -> Vec<RegionTrackerEntry> {
        self.entries.iter().map(|e| *e.value()).collect()
    }

    /// Number of live regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no region is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::forged_region;

    #[test]
    fn register_and_release() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x10000, 0x2000, RegionKind::Code);

        let entry = tracker.register(&region).unwrap();
        assert_eq!(entry.start, 0x10000);
        assert_eq!(entry.last_byte(), 0x11fff);
        assert_eq!(tracker.len(), 1);

        tracker.release(&region).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn double_release_is_not_found() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x10000, 0x1000, RegionKind::Data);

        tracker.register(&region).unwrap();
        tracker.release(&region).unwrap();
        assert!(matches!(tracker.release(&region), Err(Error::NotFound(0x10fff))));
    }

    #[test]
    fn unknown_region_is_not_found() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x40000, 0x1000, RegionKind::Data);
        assert!(matches!(tracker.release(&region), Err(Error::NotFound(_))));
    }

    #[test]
    fn sub_slice_is_rejected() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x10000, 0x3000, RegionKind::Code);
        tracker.register(&region).unwrap();

        // Same last byte, different start.
        let tail = forged_region(0x11000, 0x2000, RegionKind::Code);
        assert!(matches!(tracker.release(&tail), Err(Error::NotFound(0x12fff))));
        assert_eq!(tracker.len(), 1);

        tracker.release(&region).unwrap();
    }

    #[test]
    fn duplicate_register_rejected() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x10000, 0x1000, RegionKind::Data);
        tracker.register(&region).unwrap();
        assert!(matches!(
            tracker.register(&region),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn failed_teardown_keeps_entry() {
        let tracker = RegionTracker::new();
        let region = forged_region(0x10000, 0x1000, RegionKind::Data);
        tracker.register(&region).unwrap();

        let result = tracker.release_with(&region, |_| {
            Err(Error::Os {
                operation: "munmap",
                code: 22,
            })
        });
        assert!(matches!(result, Err(Error::Os { .. })));
        assert!(tracker.contains(0x10000));

        let entry = tracker.release_with(&region, |_| Ok(())).unwrap();
        assert_eq!(entry.len, 0x1000);
        assert!(!tracker.contains(0x10000));
    }

    #[test]
    fn containing_lookup() {
        let tracker = RegionTracker::new();
        let low = forged_region(0x10000, 0x1000, RegionKind::Code);
        let high = forged_region(0x20000, 0x2000, RegionKind::Data);
        tracker.register(&low).unwrap();
        tracker.register(&high).unwrap();

        assert_eq!(
            tracker.region_containing(0x10800).map(|e| e.start),
            Some(0x10000)
        );
        assert_eq!(
            tracker.region_containing(0x21fff).map(|e| e.kind),
            Some(RegionKind::Data)
        );
        assert!(tracker.region_containing(0x11000).is_none());
        assert!(tracker.region_containing(0x0).is_none());
        assert!(tracker.region_containing(0x22000).is_none());

        let starts: Vec<usize> = tracker.entries().iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0x10000, 0x20000]);
    }
}
