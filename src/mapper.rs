//! The mapper a loader talks to.
//!
//! [`MemoryMapper`] ties the subsystems together into the operation set a loader needs:
//! acquire a region for code or data, flip code executable once it has been written, and
//! release the region again when the module is unloaded.
//!
//! # Lifecycle of a code region
//!
//! ```text
//! acquire_code_region ──► write bytes ──► publish ──► execute ...
//!                                          │
//!                                          ├─ make_executable (W^X flip)
//!                                          └─ sync_instruction_cache
//! ... ──► release_region ──► purge registered caches ──► unmap ──► forget
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use nearmap::MemoryMapper;
//!
//! let mapper = MemoryMapper::global()?;
//!
//! let mut code = mapper.acquire_code_region(64)?;
//! code.write(0, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])?;
//! mapper.publish(&mut code)?;
//!
//! let answer: extern "C" fn() -> u32 = unsafe { std::mem::transmute(code.as_ptr()) };
//! assert_eq!(answer(), 42);
//!
//! mapper.release_region(code)?;
//! # Ok::<(), nearmap::Error>(())
//! ```

use std::{fmt, sync::OnceLock};

use crate::{
    alloc::{GapAllocator, SysPlacer},
    config::{Anchor, MapperConfig},
    jit::{self, JitSupport, WxModel},
    maps::{self, MapSource},
    purge::PurgeRegistry,
    region::{
        page_rounded,
        tracker::{RegionTracker, RegionTrackerEntry},
        MemoryRegion, Protection, RegionKind,
    },
    sys, Error, Result,
};

/// Counters describing a mapper's live state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperStats {
    /// Regions acquired and not yet released
    pub live_regions: usize,
    /// Total bytes of all live regions
    pub live_bytes: usize,
    /// Live regions acquired for code
    pub code_regions: usize,
    /// Live regions acquired for data
    pub data_regions: usize,
    /// Placement attempts that failed since construction
    pub failed_placements: usize,
}

impl fmt::Display for MapperStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} live regions ({} code, {} data), {} bytes, {} failed placements",
            self.live_regions,
            self.code_regions,
            self.data_regions,
            self.live_bytes,
            self.failed_placements
        )
    }
}

/// Acquires, tracks and releases regions for relocated code and data.
///
/// A mapper is `Sync`; every operation takes `&self` and may be called from any thread.
pub struct MemoryMapper {
    config: MapperConfig,
    wx_model: WxModel,
    jit: &'static JitSupport,
    source: Box<dyn MapSource>,
    allocator: GapAllocator,
    tracker: RegionTracker,
    purge: PurgeRegistry,
}

impl MemoryMapper {
    /// Creates a mapper with the default configuration.
    ///
    /// # Errors
    /// Returns [`Error::JitUnavailable`] if the host's cache maintenance or write-protection
    /// entry points cannot be resolved.
    pub fn new() -> Result<Self> {
        Self::with_config(MapperConfig::default())
    }

    /// Creates a mapper with `config`, reading the process map through the OS default
    /// source.
    ///
    /// # Errors
    /// As [`MemoryMapper::new`].
    pub fn with_config(config: MapperConfig) -> Result<Self> {
        Self::with_source(config, maps::os_source())
    }

    /// Creates a mapper with `config` that reads the process map through `source`.
    ///
    /// # Errors
    /// As [`MemoryMapper::new`].
    pub fn with_source(config: MapperConfig, source: Box<dyn MapSource>) -> Result<Self> {
        let jit = jit::initialize()?;
        let wx_model = jit::effective_model(jit.native_model(), config.enforce_wx);

        let allocator = GapAllocator::new(config.max_displacement)
            .with_max_strides_per_gap(config.max_strides_per_gap);

        log::debug!(
            "memory mapper: {} map source, {} write protection, window {:#x}",
            source.name(),
            wx_model,
            config.max_displacement
        );

        Ok(MemoryMapper {
            config,
            wx_model,
            jit,
            source,
            allocator,
            tracker: RegionTracker::new(),
            purge: PurgeRegistry::new(),
        })
    }

    /// Returns the process-wide mapper, creating it with the default configuration on
    /// first use.
    ///
    /// # Errors
    /// As [`MemoryMapper::new`]. A failed creation is retried by the next call.
    pub fn global() -> Result<&'static MemoryMapper> {
        static GLOBAL: OnceLock<MemoryMapper> = OnceLock::new();

        if let Some(mapper) = GLOBAL.get() {
            return Ok(mapper);
        }

        let mapper = MemoryMapper::new()?;
        Ok(GLOBAL.get_or_init(|| mapper))
    }

    /// The configuration this mapper was created with.
    #[must_use]
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// The write-protection model applied to code regions.
    #[must_use]
    pub fn wx_model(&self) -> WxModel {
        self.wx_model
    }

    /// Address code regions must currently be placed near.
    ///
    /// For [`Anchor::PrimaryImage`] this is looked up again on every call.
    ///
    /// # Errors
    /// Returns the error of [`sys::image_base`].
    pub fn reference_address(&self) -> Result<usize> {
        match self.config.anchor {
            Anchor::PrimaryImage => sys::image_base(),
            Anchor::Address(address) => Ok(address),
        }
    }

    /// Acquires a writable region of at least `size` bytes for code, placed within the
    /// displacement window after the anchor.
    ///
    /// The region must be passed to [`MemoryMapper::publish`] (or
    /// [`MemoryMapper::make_executable`] and [`MemoryMapper::sync_instruction_cache`])
    /// after writing and before executing it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size
    /// - [`Error::NoSpace`] if nothing in the window can hold the region
    /// - [`Error::ConstraintViolation`] if the OS placed it outside the window
    /// - [`Error::Os`], [`Error::FileError`], [`Error::Malformed`] if the process map
    ///   cannot be read or a system call fails
    pub fn acquire_code_region(&self, size: usize) -> Result<MemoryRegion> {
        let reference = self.reference_address()?;
        self.acquire_code_region_near(size, reference)
    }

    /// Acquires a code region within the displacement window after `reference`.
    ///
    /// # Errors
    /// As [`MemoryMapper::acquire_code_region`].
    pub fn acquire_code_region_near(&self, size: usize, reference: usize) -> Result<MemoryRegion> {
        let size = page_rounded(size)?;

        let mut placer = SysPlacer::new(jit::code_protection(self.wx_model), RegionKind::Code);
        let mut region = self
            .allocator
            .acquire(size, reference, self.source.as_ref(), &mut placer)?;

        self.track(&region)?;

        if self.wx_model == WxModel::ThreadToggle {
            jit::make_writable(&mut region, self.wx_model)?;
        }

        log::debug!(
            "acquired code region {:#x}..{:#x} ({} bytes) near {:#x}",
            region.start(),
            region.end(),
            region.len(),
            reference
        );
        Ok(region)
    }

    /// Acquires a read-write region of at least `size` bytes for data, placed wherever the
    /// OS chooses.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for a zero size and [`Error::Os`] if the mapping
    /// fails.
    pub fn acquire_data_region(&self, size: usize) -> Result<MemoryRegion> {
        let size = page_rounded(size)?;

        let region = sys::map(size, Protection::READ_WRITE, 0, RegionKind::Data)?;
        self.track(&region)?;

        log::debug!(
            "acquired data region {:#x}..{:#x} ({} bytes)",
            region.start(),
            region.end(),
            region.len()
        );
        Ok(region)
    }

    fn track(&self, region: &MemoryRegion) -> Result<()> {
        if let Err(error) = self.tracker.register(region) {
            sys::unmap_raw(region.start(), region.len())?;
            return Err(error);
        }
        Ok(())
    }

    /// Releases a region acquired from this mapper.
    ///
    /// Registered caches are scrubbed of addresses inside the region (unless disabled in
    /// the configuration), then the region is unmapped and forgotten. All three happen
    /// under the tracker lock, so no other release or lookup sees a half-released region.
    /// Purge callbacks therefore must not call back into this method.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the region was not issued by this mapper or was already
    ///   released
    /// - [`Error::Os`] if the unmap fails; the region then stays tracked
    pub fn release_region(&self, region: MemoryRegion) -> Result<()> {
        let entry = self.tracker.release_with(&region, |entry| {
            if self.config.purge_on_release {
                self.purge.purge_stale(entry.start..entry.end())?;
            }
            sys::unmap_raw(entry.start, entry.len)
        })?;

        log::debug!(
            "released {} region {:#x}..{:#x} ({} bytes)",
            entry.kind,
            entry.start,
            entry.end(),
            entry.len
        );
        Ok(())
    }

    fn tracked(&self, region: &MemoryRegion) -> Result<RegionTrackerEntry> {
        match self.tracker.region_containing(region.start()) {
            Some(entry) if entry.start == region.start() && entry.len == region.len() => {
                Ok(entry)
            }
            _ => Err(Error::NotFound(region.last_byte())),
        }
    }

    /// Flips a filled code region executable.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for a region this mapper does not track,
    /// [`Error::InvalidArgument`] for a data region and [`Error::Os`] if the protection
    /// change fails.
    pub fn make_executable(&self, region: &mut MemoryRegion) -> Result<()> {
        self.tracked(region)?;
        jit::make_executable(region, self.wx_model)
    }

    /// Flips a code region back to writable for patching.
    ///
    /// # Errors
    /// As [`MemoryMapper::make_executable`].
    pub fn make_writable(&self, region: &mut MemoryRegion) -> Result<()> {
        self.tracked(region)?;
        jit::make_writable(region, self.wx_model)
    }

    /// Makes `len` bytes of freshly written code at `ptr` visible to instruction fetch.
    ///
    /// # Errors
    /// Returns [`Error::Os`] if the host's flush call fails.
    pub fn sync_instruction_cache(&self, ptr: *const u8, len: usize) -> Result<()> {
        self.jit.sync_instruction_cache(ptr, len)
    }

    /// Flips a filled code region executable and synchronises the instruction cache over
    /// all of it.
    ///
    /// # Errors
    /// As [`MemoryMapper::make_executable`] and [`MemoryMapper::sync_instruction_cache`].
    pub fn publish(&self, region: &mut MemoryRegion) -> Result<()> {
        self.make_executable(region)?;
        self.sync_instruction_cache(region.as_ptr(), region.len())
    }

    /// The registry of caches scrubbed on release.
    #[must_use]
    pub fn purge_registry(&self) -> &PurgeRegistry {
        &self.purge
    }

    /// The table of live regions.
    #[must_use]
    pub fn tracker(&self) -> &RegionTracker {
        &self.tracker
    }

    /// Counters describing the live state.
    #[must_use]
    pub fn stats(&self) -> MapperStats {
        let mut stats = MapperStats {
            failed_placements: self.allocator.failed_attempts(),
            ..MapperStats::default()
        };

        for entry in self.tracker.entries() {
            stats.live_regions += 1;
            stats.live_bytes += entry.len;
            match entry.kind {
                RegionKind::Code => stats.code_regions += 1,
                RegionKind::Data => stats.data_regions += 1,
            }
        }

        stats
    }
}

impl fmt::Debug for MemoryMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMapper")
            .field("config", &self.config)
            .field("wx_model", &self.wx_model)
            .field("source", &self.source.name())
            .field("live_regions", &self.tracker.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        maps::snapshot::Snapshot,
        purge::AddressCache,
        region::granularity,
        test::{forged_region, init_logging},
    };

    #[test]
    fn data_region_round_trip() {
        init_logging();
        let mapper = MemoryMapper::new().unwrap();

        let mut region = mapper.acquire_data_region(100).unwrap();
        assert_eq!(region.len(), granularity());
        assert_eq!(region.kind(), RegionKind::Data);
        region.write(0, b"relocated").unwrap();
        assert_eq!(mapper.stats().data_regions, 1);

        mapper.release_region(region).unwrap();
        assert_eq!(mapper.stats(), MapperStats::default());
    }

    #[test]
    fn zero_size_rejected() {
        let mapper = MemoryMapper::new().unwrap();
        assert!(matches!(
            mapper.acquire_data_region(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            mapper.acquire_code_region(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn code_region_within_window() {
        init_logging();
        let mapper = MemoryMapper::new().unwrap();
        let reference = mapper.reference_address().unwrap();

        let region = mapper.acquire_code_region(5000).unwrap();
        assert!(region.start() > reference);
        assert!(region.end() - reference <= u32::MAX as usize);
        assert_eq!(region.len() % granularity(), 0);
        assert!(region.len() >= 5000);
        assert!(region.is_writable());

        let stats = mapper.stats();
        assert_eq!(stats.code_regions, 1);
        assert_eq!(stats.live_bytes, region.len());

        mapper.release_region(region).unwrap();
    }

    #[test]
    fn release_of_foreign_region_is_not_found() {
        let mapper = MemoryMapper::new().unwrap();
        let region = forged_region(0x7000_0000, 0x1000, RegionKind::Data);
        assert!(matches!(
            mapper.release_region(region),
            Err(Error::NotFound(0x7000_0fff))
        ));
    }

    #[test]
    fn make_executable_requires_tracked_region() {
        let mapper = MemoryMapper::new().unwrap();
        let mut region = forged_region(0x7000_0000, 0x1000, RegionKind::Code);
        assert!(matches!(
            mapper.make_executable(&mut region),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn release_purges_registered_caches() {
        let mapper = MemoryMapper::new().unwrap();
        let cache = Arc::new(AddressCache::new("descriptors"));
        mapper.purge_registry().register(cache.clone()).unwrap();

        let region = mapper.acquire_data_region(1).unwrap();
        cache.insert(region.start() + 8, 0x10);
        cache.insert(0x10, region.last_byte());
        cache.insert(0x20, region.end());

        mapper.release_region(region).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(0x20));
    }

    #[test]
    fn purge_runs_before_unmap() {
        let mapper = Arc::new(MemoryMapper::new().unwrap());
        let seen = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&mapper);
        let counter = seen.clone();
        mapper
            .purge_registry()
            .register_fn("lookup", move |span| {
                // Lock-free lookups are the only mapper calls allowed here.
                if let Some(mapper) = weak.upgrade() {
                    if mapper.tracker().region_containing(span.start).is_some() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
                0
            })
            .unwrap();

        let region = mapper.acquire_data_region(1).unwrap();
        let start = region.start();
        mapper.release_region(region).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(mapper.tracker().region_containing(start).is_none());
    }

    #[test]
    fn purge_can_be_disabled() {
        let config = MapperConfig {
            purge_on_release: false,
            ..MapperConfig::default()
        };
        let mapper = MemoryMapper::with_config(config).unwrap();
        let cache = Arc::new(AddressCache::new("descriptors"));
        mapper.purge_registry().register(cache.clone()).unwrap();

        let region = mapper.acquire_data_region(1).unwrap();
        cache.insert(region.start(), 1);
        mapper.release_region(region).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fixed_anchor_is_used() {
        let config = MapperConfig::default().with_anchor(Anchor::Address(0x1234_0000));
        let mapper = MemoryMapper::with_config(config).unwrap();
        assert_eq!(mapper.reference_address().unwrap(), 0x1234_0000);
    }

    #[test]
    fn no_space_in_full_window() {
        let reference = 0x1000_0000;
        let config = MapperConfig::default()
            .with_anchor(Anchor::Address(reference))
            .with_max_displacement(0x10_0000);
        let source = Snapshot::new(vec![crate::test::mapping(
            reference - 0x1000,
            reference + 0x20_0000,
        )])
        .unwrap();
        let mapper = MemoryMapper::with_source(config, Box::new(source)).unwrap();

        match mapper.acquire_code_region(1) {
            Err(Error::NoSpace { occupied, .. }) => assert_eq!(occupied.lines().count(), 1),
            other => panic!("Expected NoSpace, got {other:?}"),
        }
        assert_eq!(mapper.stats().live_regions, 0);
    }

    #[test]
    fn global_is_shared() {
        let first = MemoryMapper::global().unwrap();
        let second = MemoryMapper::global().unwrap();
        assert!(std::ptr::eq(first, second));
    }
}
