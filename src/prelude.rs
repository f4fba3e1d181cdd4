//! # nearmap Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the nearmap library. Import this module to get quick access to the essential
//! types for acquiring and releasing code and data regions.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all nearmap operations
pub use crate::Error;

/// The result type used throughout nearmap
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The mapper a loader talks to
pub use crate::{MapperStats, MemoryMapper};

/// Mapper configuration
pub use crate::{Anchor, MapperConfig};

// ================================================================================================
// Regions
// ================================================================================================

/// An owned span of address space, its permissions and purpose
pub use crate::{MemoryRegion, Protection, RegionKind};

/// Live-region bookkeeping
pub use crate::region::tracker::{RegionTracker, RegionTrackerEntry};

// ================================================================================================
// Process Maps and Placement
// ================================================================================================

/// Process map enumeration
pub use crate::maps::{MapSource, MappingTable, ProcMapping};

/// Gap computation and placement
pub use crate::alloc::{find_candidate_gaps, Gap, GapAllocator, Placer};

// ================================================================================================
// JIT Support and Cache Purging
// ================================================================================================

/// Write-protection models
pub use crate::jit::WxModel;

/// Caches scrubbed on release
pub use crate::purge::{AddressCache, PurgeRegistry, StaleCache};
