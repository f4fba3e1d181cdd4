use std::{ffi::c_void, ptr};

use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, HMODULE, INVALID_HANDLE_VALUE},
    System::{
        LibraryLoader::{
            GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
        },
        Memory::{
            CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualProtect, FILE_MAP,
            FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS,
            PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
            PAGE_READONLY, PAGE_READWRITE,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

use crate::{
    region::{Protection, RegionKind},
    Error, Result,
};

fn last_error(operation: &'static str) -> Error {
    Error::Os {
        operation,
        code: unsafe { GetLastError() } as i32,
    }
}

fn page_protection(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    let read = protection.contains(Protection::READ);
    let write = protection.contains(Protection::WRITE);
    let exec = protection.contains(Protection::EXEC);

    match (exec, write, read) {
        (true, true, _) => PAGE_EXECUTE_READWRITE,
        (true, false, _) => PAGE_EXECUTE_READ,
        (false, true, _) => PAGE_READWRITE,
        (false, false, true) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
    }
}

fn view_access(protection: Protection) -> FILE_MAP {
    let mut access = FILE_MAP_READ;
    if protection.contains(Protection::WRITE) {
        access |= FILE_MAP_WRITE;
    }
    if protection.contains(Protection::EXEC) {
        access |= FILE_MAP_EXECUTE;
    }
    access
}

pub(super) fn map(size: usize, protection: Protection, hint: usize, _kind: RegionKind) -> Result<usize> {
    let size = size as u64;

    // The section allows everything; the view restricts to what was asked for, which
    // leaves room to flip the view with VirtualProtect later.
    let section = unsafe {
        CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null(),
            PAGE_EXECUTE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            ptr::null(),
        )
    };
    if section.is_null() {
        return Err(last_error("CreateFileMappingW"));
    }

    let view = unsafe {
        MapViewOfFileEx(
            section,
            view_access(protection),
            0,
            0,
            size as usize,
            hint as *const c_void,
        )
    };
    let view_error = last_error("MapViewOfFileEx");

    // The view keeps the section alive; the handle itself is no longer needed.
    unsafe { CloseHandle(section) };

    if view.Value.is_null() {
        return Err(view_error);
    }

    Ok(view.Value as usize)
}

pub(super) fn unmap(start: usize, _len: usize) -> Result<()> {
    let view = MEMORY_MAPPED_VIEW_ADDRESS {
        Value: start as *mut c_void,
    };
    if unsafe { UnmapViewOfFile(view) } == 0 {
        return Err(last_error("UnmapViewOfFile"));
    }
    Ok(())
}

pub(super) fn protect(start: usize, len: usize, protection: Protection) -> Result<()> {
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    let ok = unsafe {
        VirtualProtect(
            start as *const c_void,
            len,
            page_protection(protection),
            &mut old,
        )
    };
    if ok == 0 {
        return Err(last_error("VirtualProtect"));
    }
    Ok(())
}

pub(super) fn image_base(probe: usize) -> Result<usize> {
    let mut module: HMODULE = ptr::null_mut();
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            probe as *const u16,
            &mut module,
        )
    };
    if ok == 0 || module.is_null() {
        return Err(last_error("GetModuleHandleExW"));
    }
    Ok(module as usize)
}

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

pub(super) fn address_space_ceiling() -> usize {
    (system_info().lpMaximumApplicationAddress as usize).saturating_add(1)
}

pub(super) fn query_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}
