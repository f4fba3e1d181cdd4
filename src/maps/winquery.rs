//! `VirtualQuery` walk for Windows.
//!
//! `VirtualQuery` describes the run of pages sharing one state starting at a given
//! address. Walking from the lowest to the highest application address and advancing by
//! each answer's `RegionSize` visits every run; free runs are dropped, reserved and
//! committed runs are both occupied as far as placement is concerned.

use std::{ffi::c_void, mem};

use windows_sys::Win32::System::{
    LibraryLoader::GetModuleFileNameW,
    Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_FREE, MEM_IMAGE, MEM_MAPPED,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    },
    SystemInformation::{GetSystemInfo, SYSTEM_INFO},
};

use crate::{
    maps::{MapSource, MappingTable, ProcMapping},
    region::Protection,
    Result,
};

const MAX_PATH: usize = 260;

fn protection_of(protect: PAGE_PROTECTION_FLAGS) -> Protection {
    match protect & 0xff {
        PAGE_READONLY => Protection::READ,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::READ_WRITE,
        PAGE_EXECUTE => Protection::EXEC,
        PAGE_EXECUTE_READ => Protection::READ_EXEC,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::ALL,
        _ => Protection::empty(),
    }
}

fn module_filename(base: *mut c_void) -> Option<String> {
    let mut buffer = [0u16; MAX_PATH];
    let written = unsafe { GetModuleFileNameW(base, buffer.as_mut_ptr(), buffer.len() as u32) };
    if written == 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&buffer[..written as usize]))
}

/// Map source walking the address space with `VirtualQuery`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualQueryWalk;

impl VirtualQueryWalk {
    /// Creates the walker.
    #[must_use]
    pub fn new() -> Self {
        VirtualQueryWalk
    }
}

impl MapSource for VirtualQueryWalk {
    fn current_mappings(&self) -> Result<MappingTable> {
        let (mut cursor, ceiling) = unsafe {
            let mut info: SYSTEM_INFO = mem::zeroed();
            GetSystemInfo(&mut info);
            (
                info.lpMinimumApplicationAddress as usize,
                info.lpMaximumApplicationAddress as usize,
            )
        };

        let mut mappings = Vec::new();
        while cursor < ceiling {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
            let written = unsafe {
                VirtualQuery(
                    cursor as *const c_void,
                    &mut info,
                    mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                // Past the last queryable address.
                break;
            }

            let start = info.BaseAddress as usize;
            let Some(end) = start.checked_add(info.RegionSize) else {
                return Err(malformed_error!(
                    "region at {:#x} with size {:#x} wraps the address space",
                    start,
                    info.RegionSize
                ));
            };
            if end <= cursor {
                return Err(malformed_error!("VirtualQuery did not advance at {:#x}", cursor));
            }

            if info.State != MEM_FREE {
                mappings.push(ProcMapping {
                    start,
                    end,
                    protection: protection_of(info.Protect),
                    shared: info.Type == MEM_MAPPED,
                    offset: (start - info.AllocationBase as usize) as u64,
                    path: if info.Type == MEM_IMAGE {
                        module_filename(info.AllocationBase)
                    } else {
                        None
                    },
                });
            }

            cursor = end;
        }

        MappingTable::new(mappings)
    }

    fn name(&self) -> &'static str {
        "virtualquery"
    }
}
