use libc::{c_int, c_void};

use crate::{
    region::{Protection, RegionKind},
    Error, Result,
};

fn prot_bits(protection: Protection) -> c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn placement_flags() -> c_int {
    libc::MAP_FIXED_NOREPLACE
}

#[cfg(target_os = "freebsd")]
fn placement_flags() -> c_int {
    libc::MAP_FIXED | libc::MAP_EXCL
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn placement_flags() -> c_int {
    0
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
fn kind_flags(kind: RegionKind) -> c_int {
    match kind {
        RegionKind::Code => libc::MAP_JIT,
        RegionKind::Data => 0,
    }
}

#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
fn kind_flags(_kind: RegionKind) -> c_int {
    0
}

pub(super) fn map(size: usize, protection: Protection, hint: usize, kind: RegionKind) -> Result<usize> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON | kind_flags(kind);
    if hint != 0 {
        flags |= placement_flags();
    }

    let ptr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size,
            prot_bits(protection),
            flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(os_error!("mmap"));
    }

    Ok(ptr as usize)
}

pub(super) fn unmap(start: usize, len: usize) -> Result<()> {
    if unsafe { libc::munmap(start as *mut c_void, len) } != 0 {
        return Err(os_error!("munmap"));
    }
    Ok(())
}

pub(super) fn protect(start: usize, len: usize, protection: Protection) -> Result<()> {
    if unsafe { libc::mprotect(start as *mut c_void, len, prot_bits(protection)) } != 0 {
        return Err(os_error!("mprotect"));
    }
    Ok(())
}

pub(super) fn image_base(probe: usize) -> Result<usize> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let found = unsafe { libc::dladdr(probe as *const c_void, &mut info) };

    if found == 0 || info.dli_fbase.is_null() {
        return Err(Error::NotSupported);
    }

    Ok(info.dli_fbase as usize)
}

pub(super) fn address_space_ceiling() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        1usize << 47
    }
    #[cfg(target_arch = "aarch64")]
    {
        1usize << 48
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        usize::MAX
    }
}

pub(super) fn query_granularity() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
