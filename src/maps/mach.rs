//! Mach VM region walk for macOS and iOS.
//!
//! Darwin has no proc filesystem. The kernel instead answers `mach_vm_region_recurse`
//! queries, one region at a time, starting at a cursor address. Regions backed by a
//! submap (the shared cache, mostly) are reported as a single submap entry at depth `n`
//! and must be re-queried at depth `n + 1` to see what is actually mapped inside. The
//! walk ends when the kernel answers `KERN_INVALID_ADDRESS`, meaning there is nothing
//! mapped at or above the cursor.

use std::mem;

use libc::{c_int, c_void};

use crate::{
    maps::{MapSource, MappingTable, ProcMapping},
    region::Protection,
    Error, Result,
};

type KernReturn = c_int;
type MachPort = u32;

const KERN_SUCCESS: KernReturn = 0;
const KERN_INVALID_ADDRESS: KernReturn = 1;

const VM_PROT_READ: c_int = 0x1;
const VM_PROT_WRITE: c_int = 0x2;
const VM_PROT_EXECUTE: c_int = 0x4;

const SM_SHARED: u8 = 3;
const SM_TRUESHARED: u8 = 5;
const SM_SHARED_ALIASED: u8 = 7;

const MAXPATHLEN: usize = 1024;

#[repr(C, packed(4))]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SubmapInfo64 {
    protection: c_int,
    max_protection: c_int,
    inheritance: u32,
    offset: u64,
    user_tag: u32,
    pages_resident: u32,
    pages_shared_now_private: u32,
    pages_swapped_out: u32,
    pages_dirtied: u32,
    ref_count: u32,
    shadow_depth: u16,
    external_pager: u8,
    share_mode: u8,
    is_submap: c_int,
    behavior: c_int,
    object_id: u32,
    user_wired_count: u16,
    pages_reusable: u32,
    object_id_full: u64,
}

const SUBMAP_INFO_COUNT_64: u32 = (mem::size_of::<SubmapInfo64>() / mem::size_of::<u32>()) as u32;

extern "C" {
    static mach_task_self_: MachPort;

    fn mach_vm_region_recurse(
        target_task: MachPort,
        address: *mut u64,
        size: *mut u64,
        nesting_depth: *mut u32,
        info: *mut c_int,
        info_count: *mut u32,
    ) -> KernReturn;

    fn proc_regionfilename(pid: c_int, address: u64, buffer: *mut c_void, buffersize: u32) -> c_int;
}

fn protection_of(prot: c_int) -> Protection {
    let mut protection = Protection::empty();
    if prot & VM_PROT_READ != 0 {
        protection |= Protection::READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        protection |= Protection::WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        protection |= Protection::EXEC;
    }
    protection
}

fn region_filename(address: u64) -> Option<String> {
    let mut buffer = [0u8; MAXPATHLEN];
    let written = unsafe {
        proc_regionfilename(
            libc::getpid(),
            address,
            buffer.as_mut_ptr().cast(),
            buffer.len() as u32,
        )
    };

    if written <= 0 {
        return None;
    }

    let written = (written as usize).min(buffer.len());
    Some(String::from_utf8_lossy(&buffer[..written]).into_owned())
}

/// Map source walking the task's VM regions with `mach_vm_region_recurse`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachRegions;

impl MachRegions {
    /// Creates the walker.
    #[must_use]
    pub fn new() -> Self {
        MachRegions
    }
}

impl MapSource for MachRegions {
    fn current_mappings(&self) -> Result<MappingTable> {
        let ceiling = crate::sys::address_space_ceiling() as u64;
        let task = unsafe { mach_task_self_ };

        let mut mappings = Vec::new();
        let mut address: u64 = 0;
        let mut depth: u32 = 0;

        while address < ceiling {
            let mut size: u64 = 0;
            let mut count = SUBMAP_INFO_COUNT_64;
            let mut info: SubmapInfo64 = unsafe { mem::zeroed() };

            let kr = unsafe {
                mach_vm_region_recurse(
                    task,
                    &mut address,
                    &mut size,
                    &mut depth,
                    (&mut info as *mut SubmapInfo64).cast(),
                    &mut count,
                )
            };

            if kr == KERN_INVALID_ADDRESS {
                break;
            }
            if kr != KERN_SUCCESS {
                return Err(Error::Os {
                    operation: "mach_vm_region_recurse",
                    code: kr,
                });
            }

            let is_submap = info.is_submap;
            if is_submap != 0 {
                depth += 1;
                continue;
            }

            let Some(end) = address.checked_add(size) else {
                return Err(malformed_error!(
                    "region at {:#x} with size {:#x} wraps the address space",
                    address,
                    size
                ));
            };

            let share_mode = info.share_mode;
            mappings.push(ProcMapping {
                start: address as usize,
                end: end as usize,
                protection: protection_of(info.protection),
                shared: matches!(share_mode, SM_SHARED | SM_TRUESHARED | SM_SHARED_ALIASED),
                offset: info.offset,
                path: region_filename(address),
            });

            address = end;
        }

        MappingTable::new(mappings)
    }

    fn name(&self) -> &'static str {
        "mach"
    }
}
