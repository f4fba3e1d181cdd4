#![allow(unused_macros)]

/// Helper macro for locking items, propagating a poisoned lock as
/// [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let mut table = lock!(self.table);
///  table.insert(key, value);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let caches = read_lock!(self.caches);
///  println!("{}", caches.len());
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut caches = write_lock!(self.caches);
///  caches.push(cache);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for capturing the last OS error of a failed system call
///
/// ```rust, ignore
///  if unsafe { libc::munmap(ptr, len) } != 0 {
///      return Err(os_error!("munmap"));
///  }
/// ```
macro_rules! os_error {
    ($operation:expr) => {
        crate::Error::Os {
            operation: $operation,
            code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    };
}
