//! Cache maintenance by virtual address for AArch64 user space.
//!
//! After writing instructions through the data side, the new bytes have to be cleaned from
//! the data cache to the point of unification and the stale lines invalidated from the
//! instruction cache. Line sizes are read from `CTR_EL0` rather than assumed; cores that
//! report `IDC` or `DIC` do not need the corresponding half of the sequence.

use std::arch::asm;

/// Cache geometry as reported by `CTR_EL0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    /// Smallest instruction cache line in bytes
    pub icache_line: usize,
    /// Smallest data cache line in bytes
    pub dcache_line: usize,
    /// Data cache clean to unification is not required for coherence
    pub idc: bool,
    /// Instruction cache invalidation is not required for coherence
    pub dic: bool,
}

impl CacheGeometry {
    /// Decodes a `CTR_EL0` value.
    #[must_use]
    pub fn from_ctr(ctr: u64) -> Self {
        CacheGeometry {
            icache_line: 4 << (ctr & 0xf),
            dcache_line: 4 << ((ctr >> 16) & 0xf),
            idc: ctr & (1 << 28) != 0,
            dic: ctr & (1 << 29) != 0,
        }
    }

    /// Reads the geometry of the executing core.
    #[must_use]
    pub fn read() -> Self {
        let ctr: u64;
        // SAFETY: CTR_EL0 is readable from EL0 on every OS this is compiled for.
        unsafe {
            asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        }
        CacheGeometry::from_ctr(ctr)
    }
}

/// Makes `len` bytes of freshly written code at `start` visible to instruction fetch.
///
/// # Safety
/// `start..start + len` must be mapped and readable.
pub unsafe fn sync(geometry: CacheGeometry, start: usize, len: usize) {
    let end = start.saturating_add(len);

    if !geometry.idc {
        let mut addr = start & !(geometry.dcache_line - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += geometry.dcache_line;
        }
    }
    asm!("dsb ish", options(nostack, preserves_flags));

    if !geometry.dic {
        let mut addr = start & !(geometry.icache_line - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += geometry.icache_line;
        }
        asm!("dsb ish", options(nostack, preserves_flags));
    }
    asm!("isb", options(nostack, preserves_flags));
}
