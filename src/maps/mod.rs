//! Process map reader.
//!
//! This module enumerates the regions already occupied in the calling process's address
//! space, which is what the gap-finding allocator in [`crate::alloc`] needs to discover free
//! space near the anchor image. The mechanism differs completely between operating systems,
//! so enumeration is expressed as one trait, [`MapSource`], with an implementation per
//! mechanism selected at build time.
//!
//! # Key Components
//!
//! - [`ProcMapping`] - One occupied region: range, permissions, sharing, backing file
//! - [`MappingTable`] - A validated, ascending, non-overlapping snapshot of mappings
//! - [`MapSource`] - Trait implemented by every enumeration backend
//! - [`current_mappings`] - Snapshot through the OS default backend
//!
//! # Backends
//!
//! - [`procfs::ProcFs`] - Text parsing of `/proc/self/maps` (Linux, Android)
//! - `mach::MachRegions` - Recursive `mach_vm_region_recurse` walk (macOS, iOS)
//! - `winquery::VirtualQueryWalk` - `VirtualQuery` page-table enumeration (Windows)
//! - [`snapshot::Snapshot`] - A fixed, caller-provided list of mappings
//!
//! # Freshness
//!
//! A snapshot describes the address space at the instant it was taken. Other threads and
//! the OS itself keep changing the map, so every allocation attempt takes a new snapshot
//! rather than caching one.

#[cfg(target_vendor = "apple")]
pub mod mach;
pub mod procfs;
pub mod snapshot;
#[cfg(windows)]
pub mod winquery;

use std::{fmt, fmt::Write as _, sync::OnceLock};

use crate::{region::Protection, Result};

/// One region occupied in the process's address space at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcMapping {
    /// Start address (inclusive)
    pub start: usize,
    /// End address (exclusive)
    pub end: usize,
    /// Access permissions
    pub protection: Protection,
    /// Whether the mapping is shared rather than private copy-on-write
    pub shared: bool,
    /// Offset into the backing object
    pub offset: u64,
    /// Backing file, if the OS reports one
    pub path: Option<String>,
}

impl ProcMapping {
    /// Creates an anonymous private mapping covering `start..end`.
    #[must_use]
    pub fn new(start: usize, end: usize, protection: Protection) -> Self {
        ProcMapping {
            start,
            end,
            protection,
            shared: false,
            offset: 0,
            path: None,
        }
    }

    /// Attaches a backing file path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` for a zero-length mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Returns `true` if `addr` lies inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for ProcMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:016x} {}{} {:08x}",
            self.start,
            self.end,
            self.protection,
            if self.shared { 's' } else { 'p' },
            self.offset
        )?;
        if let Some(path) = &self.path {
            write!(f, " {path}")?;
        }
        Ok(())
    }
}

/// Ascending, non-overlapping snapshot of a process's mappings.
///
/// Every [`MapSource`] returns its result through [`MappingTable::new`], which sorts the
/// raw entries and refuses inverted or overlapping ranges: a map that contradicts itself
/// is worse than no map for deciding where free space is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    mappings: Vec<ProcMapping>,
}

impl MappingTable {
    /// Sorts and validates raw mappings.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an entry ends before it starts or two
    /// entries overlap.
    pub fn new(mut mappings: Vec<ProcMapping>) -> Result<Self> {
        mappings.sort_by_key(|m| m.start);

        for mapping in &mappings {
            if mapping.end < mapping.start {
                return Err(malformed_error!("inverted mapping {}", mapping));
            }
        }

        for pair in mappings.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(malformed_error!(
                    "overlapping mappings {} and {}",
                    pair[0],
                    pair[1]
                ));
            }
        }

        Ok(MappingTable { mappings })
    }

    /// The mappings, ascending by start address.
    #[must_use]
    pub fn as_slice(&self) -> &[ProcMapping] {
        &self.mappings
    }

    /// Iterates ascending by start address.
    pub fn iter(&self) -> std::slice::Iter<'_, ProcMapping> {
        self.mappings.iter()
    }

    /// Number of mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns `true` if the snapshot holds no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Returns the mapping containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<&ProcMapping> {
        let idx = self.mappings.partition_point(|m| m.end <= addr);
        self.mappings.get(idx).filter(|m| m.contains(addr))
    }

    /// Printable table of all occupied ranges, one per line.
    #[must_use]
    pub fn occupied_table(&self) -> String {
        let mut table = String::with_capacity(self.mappings.len() * 48);
        for mapping in &self.mappings {
            let _ = writeln!(table, "{mapping}");
        }
        table
    }
}

impl<'a> IntoIterator for &'a MappingTable {
    type Item = &'a ProcMapping;
    type IntoIter = std::slice::Iter<'a, ProcMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.iter()
    }
}

/// A way of enumerating the calling process's mappings.
///
/// Implementations must return every region the OS reports, ascending and without
/// overlap, which [`MappingTable::new`] enforces.
pub trait MapSource: Send + Sync {
    /// Takes a fresh snapshot of the process's mappings.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS query fails or its output cannot be interpreted; a
    /// partial snapshot is never returned.
    fn current_mappings(&self) -> Result<MappingTable>;

    /// Short name of the mechanism, for diagnostics.
    fn name(&self) -> &'static str;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn os_source() -> Box<dyn MapSource> {
    Box::new(procfs::ProcFs::new())
}

#[cfg(target_vendor = "apple")]
pub(crate) fn os_source() -> Box<dyn MapSource> {
    Box::new(mach::MachRegions::new())
}

#[cfg(windows)]
pub(crate) fn os_source() -> Box<dyn MapSource> {
    Box::new(winquery::VirtualQueryWalk::new())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    windows
)))]
pub(crate) fn os_source() -> Box<dyn MapSource> {
    Box::new(Unsupported)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    windows
)))]
struct Unsupported;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    windows
)))]
impl MapSource for Unsupported {
    fn current_mappings(&self) -> Result<MappingTable> {
        Err(crate::Error::NotSupported)
    }

    fn name(&self) -> &'static str {
        "unsupported"
    }
}

/// Returns the OS default map source.
pub fn default_source() -> &'static dyn MapSource {
    static SOURCE: OnceLock<Box<dyn MapSource>> = OnceLock::new();
    SOURCE.get_or_init(os_source).as_ref()
}

/// Takes a fresh snapshot of the calling process's mappings through the OS default source.
///
/// # Errors
/// See [`MapSource::current_mappings`].
pub fn current_mappings() -> Result<MappingTable> {
    default_source().current_mappings()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::mapping, Error};

    #[test]
    fn table_sorts() {
        let table = MappingTable::new(vec![
            mapping(0x3000, 0x4000),
            mapping(0x1000, 0x2000),
            mapping(0x2000, 0x3000),
        ])
        .unwrap();

        let starts: Vec<usize> = table.iter().map(|m| m.start).collect();
        assert_eq!(starts, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn table_rejects_overlap() {
        let result = MappingTable::new(vec![mapping(0x1000, 0x3000), mapping(0x2000, 0x4000)]);
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn table_rejects_inverted() {
        let result = MappingTable::new(vec![mapping(0x3000, 0x1000)]);
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn table_find() {
        let table =
            MappingTable::new(vec![mapping(0x1000, 0x2000), mapping(0x4000, 0x6000)]).unwrap();

        assert_eq!(table.find(0x1000).map(|m| m.start), Some(0x1000));
        assert_eq!(table.find(0x5fff).map(|m| m.start), Some(0x4000));
        assert!(table.find(0x2000).is_none());
        assert!(table.find(0x3000).is_none());
        assert!(table.find(0x6000).is_none());
        assert!(table.find(0).is_none());
    }

    #[test]
    fn occupied_table_lists_every_mapping() {
        let table = MappingTable::new(vec![
            mapping(0x1000, 0x2000).with_path("/usr/bin/host"),
            mapping(0x4000, 0x6000),
        ])
        .unwrap();

        let text = table.occupied_table();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000000001000-0000000000002000 rw-p"));
        assert!(lines[0].ends_with("/usr/bin/host"));
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple", windows))]
    #[test]
    fn live_snapshot_contains_our_code() {
        let table = current_mappings().unwrap();
        assert!(!table.is_empty());

        let here = live_snapshot_contains_our_code as usize;
        let own = table.find(here).expect("our own code must be mapped");
        assert!(own.protection.contains(Protection::EXEC));

        for pair in table.as_slice().windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!(pair[0].end <= pair[1].start);
        }
    }
}
