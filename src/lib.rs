// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! # nearmap
//!
//! Position-constrained memory mapping for loading relocatable code into a running process.
//!
//! A loader that copies precompiled, relocated machine code into a live process needs
//! somewhere to put it. Ordinary allocations are not good enough: relocations commonly
//! encode references back into the host image as 32-bit displacements, so the code has to
//! land within a fixed window after that image. `nearmap` finds free address space in that
//! window, claims it without disturbing anything already mapped, keeps writable and
//! executable permissions apart where the host demands it, and makes sure nothing in the
//! process still points into a region once it has been released.
//!
//! ## Features
//!
//! - **Reachable placement** - Code regions land within a configurable window after the
//!   host image, verified after every mapping
//! - **Cross-platform map reading** - `/proc/self/maps`, Mach VM regions and `VirtualQuery`
//!   behind one trait
//! - **W^X cooperation** - Protection flips or per-thread JIT toggling, as the host requires
//! - **Instruction-cache coherency** - Cache-line maintenance sized from the hardware
//! - **Safe release** - Release requests are validated; registered caches are scrubbed of
//!   stale addresses before the region is unmapped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nearmap::prelude::*;
//!
//! let mapper = MemoryMapper::global()?;
//!
//! // Code: write, publish, run
//! let mut code = mapper.acquire_code_region(4096)?;
//! code.write(0, &[0xC3])?;
//! mapper.publish(&mut code)?;
//!
//! // Data: no placement constraint
//! let mut data = mapper.acquire_data_region(256)?;
//! data.write(0, &0xdead_beef_u32.to_le_bytes())?;
//!
//! mapper.release_region(code)?;
//! mapper.release_region(data)?;
//! # Ok::<(), nearmap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`region`] - [`MemoryRegion`], protections, granularity, and the live-region tracker
//! - [`sys`] - The raw per-OS map/unmap/protect primitive and image-base lookup
//! - [`maps`] - Enumeration of the process's existing mappings
//! - [`alloc`] - Gap computation and the gap-finding allocator
//! - [`jit`] - Write-protection toggling and instruction-cache sync
//! - [`purge`] - Registry of caches to scrub on release
//! - [`MemoryMapper`] - The operation set a loader uses
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade; install any logger to see
//! them. Acquisitions and releases are logged at `debug`, each failed placement attempt at
//! `trace`, and misplaced mappings and non-empty cache purges at `warn`.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use nearmap::prelude::*;
///
/// let mapper = MemoryMapper::new()?;
/// let region = mapper.acquire_data_region(64)?;
/// mapper.release_region(region)?;
/// # Ok::<(), nearmap::Error>(())
/// ```
pub mod prelude;

pub mod alloc;
pub mod config;
pub mod jit;
pub mod maps;
pub mod purge;
pub mod region;
pub mod sys;

mod mapper;

/// `nearmap` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `nearmap` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use nearmap::{Error, MemoryMapper};
///
/// let mapper = MemoryMapper::global()?;
/// let region = mapper.acquire_data_region(64)?;
/// let copy = unsafe {
///     nearmap::MemoryRegion::from_raw_parts(
///         region.start(),
///         region.len(),
///         region.protection(),
///         region.kind(),
///     )
/// };
/// mapper.release_region(region)?;
///
/// if let Some(copy) = copy {
///     assert!(matches!(mapper.release_region(copy), Err(Error::NotFound(_))));
/// }
/// # Ok::<(), nearmap::Error>(())
/// ```
pub use error::Error;

pub use config::{Anchor, MapperConfig};
pub use mapper::{MapperStats, MemoryMapper};
pub use region::{MemoryRegion, Protection, RegionKind};
