//! Mapper configuration
//!
//! This module provides the tunables of a [`crate::MemoryMapper`]: how far from the anchor
//! code may be placed, how hard the allocator tries, and how strictly writable and
//! executable permissions are kept apart.

use crate::alloc::DEFAULT_MAX_STRIDES_PER_GAP;

/// What code regions must be placed near.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Anchor {
    /// The load address of the image containing this crate, looked up afresh on every
    /// acquisition.
    #[default]
    PrimaryImage,
    /// A fixed address, e.g. the base of a previously loaded module.
    Address(usize),
}

/// Configuration for a [`crate::MemoryMapper`]
///
/// Code regions must land within `max_displacement` bytes after the anchor so 32-bit
/// relocations can reach back into it. Data regions ignore the anchor entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperConfig {
    /// Maximum distance from the anchor to the end of a code region (default: `u32::MAX`)
    pub max_displacement: usize,

    /// Maximum placement attempts within one free gap (default: 256)
    /// Bounds the allocator's retries when other code races it for address space
    pub max_strides_per_gap: usize,

    /// Map code read-write and flip it read-execute even where RWX pages are allowed
    /// Hosts that enforce W^X always toggle, regardless of this flag
    pub enforce_wx: bool,

    /// Scrub registered caches of addresses inside a region when it is released
    pub purge_on_release: bool,

    /// What code regions are placed near
    pub anchor: Anchor,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_displacement: u32::MAX as usize,
            max_strides_per_gap: DEFAULT_MAX_STRIDES_PER_GAP,
            enforce_wx: false,
            purge_on_release: true,
            anchor: Anchor::PrimaryImage,
        }
    }
}

impl MapperConfig {
    /// Creates a configuration that never leaves code writable and executable at once
    ///
    /// Gives up sooner on contested gaps, since each attempt costs a system call.
    #[must_use]
    pub fn hardened() -> Self {
        Self {
            max_displacement: u32::MAX as usize,
            max_strides_per_gap: 64,
            enforce_wx: true,
            purge_on_release: true,
            anchor: Anchor::PrimaryImage,
        }
    }

    /// Creates a configuration that maps code RWX wherever the host allows it
    ///
    /// Released regions are still purged from registered caches.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            enforce_wx: false,
            ..Self::default()
        }
    }

    /// Sets the maximum distance from the anchor to the end of a code region
    #[must_use]
    pub fn with_max_displacement(mut self, max_displacement: usize) -> Self {
        self.max_displacement = max_displacement;
        self
    }

    /// Sets the anchor code regions are placed near
    #[must_use]
    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_config_presets() {
        let default = MapperConfig::default();
        assert_eq!(default.max_displacement, 0xFFFF_FFFF);
        assert_eq!(default.max_strides_per_gap, 256);
        assert!(!default.enforce_wx);
        assert!(default.purge_on_release);
        assert_eq!(default.anchor, Anchor::PrimaryImage);

        let hardened = MapperConfig::hardened();
        assert!(hardened.enforce_wx);
        assert!(hardened.purge_on_release);
        assert!(hardened.max_strides_per_gap < default.max_strides_per_gap);

        let permissive = MapperConfig::permissive();
        assert!(!permissive.enforce_wx);
        assert!(permissive.purge_on_release);
    }

    #[test]
    fn test_mapper_config_setters() {
        let config = MapperConfig::default()
            .with_max_displacement(0x1000_0000)
            .with_anchor(Anchor::Address(0x4000_0000));

        assert_eq!(config.max_displacement, 0x1000_0000);
        assert_eq!(config.anchor, Anchor::Address(0x4000_0000));
        assert_eq!(config.max_strides_per_gap, 256);
    }
}
