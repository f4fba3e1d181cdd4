//! Write-xor-execute toggling and instruction-cache coherency.
//!
//! Freshly relocated code is written through the data side of the memory system and then
//! executed. Two platform concerns sit between those steps:
//!
//! - **Write protection.** Some hosts refuse pages that are writable and executable at the
//!   same time. A code region then has to be flipped from writable to executable once it
//!   has been filled, and back if it is patched. [`WxModel`] names how a host does this.
//! - **Cache coherency.** Some architectures do not keep the instruction cache coherent with
//!   data writes. Before the first branch into new code, the written range has to be
//!   cleaned from the data cache and invalidated in the instruction cache.
//!
//! The entry points for both are resolved once, by [`initialize`], and held in process-wide
//! state that never changes afterwards. Resolution failure is reported as
//! [`Error::JitUnavailable`] and stops a [`crate::MemoryMapper`] from being built: running
//! code without a working cache sync would execute stale instructions at random.
//!
//! # Platform Matrix
//!
//! | Host                      | [`WxModel`]      | Cache sync                          |
//! |---------------------------|------------------|-------------------------------------|
//! | x86 / x86-64 (any OS)     | `Unrestricted`   | none, caches are coherent           |
//! | AArch64 Linux, Android    | `Unrestricted`   | `dc cvau` / `ic ivau` by cache line |
//! | Apple AArch64             | `ThreadToggle`   | `sys_icache_invalidate`             |
//! | Windows on ARM            | `Unrestricted`   | `FlushInstructionCache`             |
//! | OpenBSD                   | `Mprotect`       | per architecture                    |
//! | other Unix                | `Unrestricted`   | `__clear_cache`                     |

#[cfg(all(
    target_arch = "aarch64",
    not(target_vendor = "apple"),
    not(windows)
))]
pub mod icache;

use std::sync::OnceLock;

use strum::Display;

use crate::{
    region::{MemoryRegion, Protection, RegionKind},
    sys, Error, Result,
};

/// How a host keeps writable and executable permissions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum WxModel {
    /// Pages may be writable and executable at once; toggling is a no-op.
    #[strum(serialize = "unrestricted")]
    Unrestricted,
    /// Code is mapped read-write and flipped to read-execute with a protection change.
    #[strum(serialize = "mprotect")]
    Mprotect,
    /// Code is mapped read-write-execute as JIT memory and the calling thread switches
    /// between writing and executing it (`pthread_jit_write_protect_np`).
    #[strum(serialize = "thread-toggle")]
    ThreadToggle,
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
type WriteProtectFn = unsafe extern "C" fn(libc::c_int);

#[derive(Debug, Clone, Copy)]
enum CacheSync {
    Coherent,
    #[cfg(all(
        target_arch = "aarch64",
        not(target_vendor = "apple"),
        not(windows)
    ))]
    LineMaintenance(icache::CacheGeometry),
    #[cfg(all(target_vendor = "apple", not(any(target_arch = "x86", target_arch = "x86_64"))))]
    SysIcacheInvalidate(unsafe extern "C" fn(*mut libc::c_void, libc::size_t)),
    #[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
    FlushInstructionCache,
    #[cfg(all(
        unix,
        not(target_vendor = "apple"),
        not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))
    ))]
    ClearCache(unsafe extern "C" fn(*mut libc::c_char, *mut libc::c_char)),
}

impl CacheSync {
    fn name(&self) -> &'static str {
        match self {
            CacheSync::Coherent => "coherent",
            #[cfg(all(
                target_arch = "aarch64",
                not(target_vendor = "apple"),
                not(windows)
            ))]
            CacheSync::LineMaintenance(_) => "dc cvau/ic ivau",
            #[cfg(all(
                target_vendor = "apple",
                not(any(target_arch = "x86", target_arch = "x86_64"))
            ))]
            CacheSync::SysIcacheInvalidate(_) => "sys_icache_invalidate",
            #[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
            CacheSync::FlushInstructionCache => "FlushInstructionCache",
            #[cfg(all(
                unix,
                not(target_vendor = "apple"),
                not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))
            ))]
            CacheSync::ClearCache(_) => "__clear_cache",
        }
    }
}

/// Looks up `name` among the symbols already loaded into the process.
#[cfg(unix)]
#[allow(dead_code)]
fn resolve_symbol(name: &'static str) -> Result<*mut libc::c_void> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| Error::JitUnavailable(format!("invalid symbol name {name}")))?;

    let symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
    if symbol.is_null() {
        return Err(Error::JitUnavailable(format!("{name} could not be resolved")));
    }
    Ok(symbol)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn resolve_cache_sync() -> Result<CacheSync> {
    Ok(CacheSync::Coherent)
}

#[cfg(all(
    target_arch = "aarch64",
    not(target_vendor = "apple"),
    not(windows)
))]
fn resolve_cache_sync() -> Result<CacheSync> {
    let geometry = icache::CacheGeometry::read();
    if geometry.icache_line == 0 || geometry.dcache_line == 0 {
        return Err(Error::JitUnavailable(format!(
            "implausible cache geometry {geometry:?}"
        )));
    }
    Ok(CacheSync::LineMaintenance(geometry))
}

#[cfg(all(target_vendor = "apple", not(any(target_arch = "x86", target_arch = "x86_64"))))]
fn resolve_cache_sync() -> Result<CacheSync> {
    let symbol = resolve_symbol("sys_icache_invalidate")?;
    Ok(CacheSync::SysIcacheInvalidate(unsafe {
        std::mem::transmute::<*mut libc::c_void, unsafe extern "C" fn(*mut libc::c_void, libc::size_t)>(
            symbol,
        )
    }))
}

#[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
fn resolve_cache_sync() -> Result<CacheSync> {
    Ok(CacheSync::FlushInstructionCache)
}

#[cfg(all(
    unix,
    not(target_vendor = "apple"),
    not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))
))]
fn resolve_cache_sync() -> Result<CacheSync> {
    let symbol = resolve_symbol("__clear_cache")?;
    Ok(CacheSync::ClearCache(unsafe {
        std::mem::transmute::<*mut libc::c_void, unsafe extern "C" fn(*mut libc::c_char, *mut libc::c_char)>(
            symbol,
        )
    }))
}

/// Resolved write-protection and cache-sync entry points for this process.
#[derive(Debug)]
pub struct JitSupport {
    model: WxModel,
    cache_sync: CacheSync,
    #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
    write_protect: WriteProtectFn,
}

impl JitSupport {
    #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
    fn resolve() -> Result<Self> {
        let symbol = resolve_symbol("pthread_jit_write_protect_np")?;
        Ok(JitSupport {
            model: WxModel::ThreadToggle,
            cache_sync: resolve_cache_sync()?,
            write_protect: unsafe {
                std::mem::transmute::<*mut libc::c_void, WriteProtectFn>(symbol)
            },
        })
    }

    #[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
    fn resolve() -> Result<Self> {
        let model = if cfg!(target_os = "openbsd") {
            WxModel::Mprotect
        } else {
            WxModel::Unrestricted
        };

        Ok(JitSupport {
            model,
            cache_sync: resolve_cache_sync()?,
        })
    }

    /// The write-protection model the host enforces.
    #[must_use]
    pub fn native_model(&self) -> WxModel {
        self.model
    }

    /// Name of the cache maintenance mechanism in use.
    #[must_use]
    pub fn cache_sync_name(&self) -> &'static str {
        self.cache_sync.name()
    }

    /// Makes `len` bytes of freshly written code at `ptr` visible to instruction fetch.
    ///
    /// Must be called after the last write and before the first branch into the range.
    /// A zero length is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::Os`] if the OS flush call fails.
    #[cfg_attr(
        any(target_arch = "x86", target_arch = "x86_64"),
        allow(unused_variables)
    )]
    pub fn sync_instruction_cache(&self, ptr: *const u8, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }

        match self.cache_sync {
            CacheSync::Coherent => {}
            #[cfg(all(
                target_arch = "aarch64",
                not(target_vendor = "apple"),
                not(windows)
            ))]
            CacheSync::LineMaintenance(geometry) => unsafe {
                icache::sync(geometry, ptr as usize, len);
            },
            #[cfg(all(
                target_vendor = "apple",
                not(any(target_arch = "x86", target_arch = "x86_64"))
            ))]
            CacheSync::SysIcacheInvalidate(invalidate) => unsafe {
                invalidate(ptr as *mut libc::c_void, len);
            },
            #[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
            CacheSync::FlushInstructionCache => {
                use windows_sys::Win32::System::{
                    Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
                };

                let ok = unsafe { FlushInstructionCache(GetCurrentProcess(), ptr.cast(), len) };
                if ok == 0 {
                    return Err(os_error!("FlushInstructionCache"));
                }
            }
            #[cfg(all(
                unix,
                not(target_vendor = "apple"),
                not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))
            ))]
            CacheSync::ClearCache(clear) => unsafe {
                let begin = ptr as *mut libc::c_char;
                clear(begin, begin.add(len));
            },
        }

        Ok(())
    }

    #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
    fn set_thread_write_protect(&self, enabled: bool) {
        unsafe { (self.write_protect)(libc::c_int::from(enabled)) };
    }

    #[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
    fn set_thread_write_protect(&self, _enabled: bool) {}
}

static SUPPORT: OnceLock<JitSupport> = OnceLock::new();

/// Resolves the write-protection and cache-sync entry points, once per process.
///
/// Later calls return the same resolved state. A failed resolution is not cached, so
/// every later call reports it again.
///
/// # Errors
/// Returns [`Error::JitUnavailable`] if an entry point cannot be resolved.
pub fn initialize() -> Result<&'static JitSupport> {
    if let Some(support) = SUPPORT.get() {
        return Ok(support);
    }

    let resolved = JitSupport::resolve()?;
    let support = SUPPORT.get_or_init(|| resolved);
    log::debug!(
        "jit support: write protection {}, cache sync {}",
        support.model,
        support.cache_sync_name()
    );
    Ok(support)
}

/// The effective model, given whether W^X toggling is requested on hosts that allow RWX.
#[must_use]
pub fn effective_model(native: WxModel, enforce_wx: bool) -> WxModel {
    match native {
        WxModel::Unrestricted if enforce_wx => WxModel::Mprotect,
        model => model,
    }
}

/// Protection to map a code region with under `model`.
#[must_use]
pub fn code_protection(model: WxModel) -> Protection {
    match model {
        WxModel::Unrestricted | WxModel::ThreadToggle => Protection::ALL,
        WxModel::Mprotect => Protection::READ_WRITE,
    }
}

fn require_code(region: &MemoryRegion) -> Result<()> {
    if region.kind() != RegionKind::Code {
        return Err(Error::InvalidArgument(format!(
            "region {region} is not a code region"
        )));
    }
    Ok(())
}

/// Flips a filled code region from writable to executable.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] for a data region, [`Error::JitUnavailable`] if
/// [`initialize`] fails, and [`Error::Os`] if the protection change is refused.
pub fn make_executable(region: &mut MemoryRegion, model: WxModel) -> Result<()> {
    require_code(region)?;

    match model {
        WxModel::Unrestricted => {}
        WxModel::Mprotect => {
            sys::protect(region.start(), region.len(), Protection::READ_EXEC)?;
            region.set_writable(false);
        }
        WxModel::ThreadToggle => {
            initialize()?.set_thread_write_protect(true);
            region.set_writable(false);
        }
    }

    Ok(())
}

/// Flips a code region back to writable, e.g. for patching.
///
/// # Errors
/// As [`make_executable`].
pub fn make_writable(region: &mut MemoryRegion, model: WxModel) -> Result<()> {
    require_code(region)?;

    match model {
        WxModel::Unrestricted => {}
        WxModel::Mprotect => {
            sys::protect(region.start(), region.len(), Protection::READ_WRITE)?;
            region.set_writable(true);
        }
        WxModel::ThreadToggle => {
            initialize()?.set_thread_write_protect(false);
            region.set_writable(true);
        }
    }

    Ok(())
}

/// Makes `len` bytes of freshly written code at `ptr` visible to instruction fetch.
///
/// # Errors
/// Returns [`Error::JitUnavailable`] if [`initialize`] fails, or the error of
/// [`JitSupport::sync_instruction_cache`].
pub fn sync_instruction_cache(ptr: *const u8, len: usize) -> Result<()> {
    initialize()?.sync_instruction_cache(ptr, len)
}
