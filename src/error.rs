use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every failure of the mapper is reported to the caller through this type; nothing is
/// swallowed. The only condition that is treated as fatal rather than recoverable is the
/// failure to resolve the instruction-cache and write-protection entry points at startup,
/// which surfaces once as [`Error::JitUnavailable`] from [`crate::jit::initialize`] and
/// prevents a [`crate::MemoryMapper`] from being constructed at all.
///
/// # Error Categories
///
/// ## Request Errors
/// - [`Error::InvalidArgument`] - Zero-sized or otherwise unusable request
/// - [`Error::NotFound`] - Release of a region this mapper never issued, or issued twice
/// - [`Error::OutOfBounds`] - Write beyond the end of a region
/// - [`Error::NotWritable`] - Write into a region that is currently executable
///
/// ## Placement Errors
/// - [`Error::NoSpace`] - No gap satisfies the size and reachability constraint
/// - [`Error::ConstraintViolation`] - The OS placed a hinted mapping outside the window
///
/// ## System Errors
/// - [`Error::Os`] - An underlying system call failed
/// - [`Error::FileError`] - The proc pseudo-file could not be read
/// - [`Error::Malformed`] - The process map could not be parsed
/// - [`Error::NotSupported`] - No process map backend exists for this target
/// - [`Error::LockError`] - A lock was poisoned by a panicking thread
/// - [`Error::JitUnavailable`] - Cache maintenance entry points could not be resolved
///
/// # Examples
///
/// ```rust,no_run
/// use nearmap::{Error, MemoryMapper};
///
/// let mapper = MemoryMapper::global()?;
/// match mapper.acquire_code_region(4096) {
///     Ok(region) => println!("code at {:#x}", region.start()),
///     Err(Error::NoSpace { size, occupied }) => {
///         eprintln!("no room for {} bytes near the image:\n{}", size, occupied);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok::<(), nearmap::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The request itself is unusable, e.g. a zero-sized region.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// An underlying system call failed.
    ///
    /// # Fields
    ///
    /// * `operation` - Name of the failing call (`mmap`, `VirtualQuery`, ...)
    /// * `code` - Raw OS error code (`errno` / `GetLastError`)
    #[error("{operation} failed: {}", os_message(.code))]
    Os {
        /// The system call which failed
        operation: &'static str,
        /// The raw OS error code
        code: i32,
    },

    /// No free gap after the anchor is large enough and close enough.
    ///
    /// The `occupied` table lists every mapping seen while searching, one per line,
    /// to make the failure diagnosable after the fact.
    #[error("No space for {size} bytes within reach of the anchor; occupied ranges:\n{occupied}")]
    NoSpace {
        /// The page-rounded size that was requested
        size: usize,
        /// Printable table of the occupied ranges at the time of the attempt
        occupied: String,
    },

    /// The OS placed a hinted mapping outside the reachable window.
    ///
    /// The offending mapping has already been unmapped when this is returned.
    #[error(
        "Mapping {address:#x}..{end:#x} is not within {limit:#x} bytes of anchor {reference:#x}"
    )]
    ConstraintViolation {
        /// Start of the mapping the OS returned
        address: usize,
        /// End (exclusive) of the mapping the OS returned
        end: usize,
        /// The anchor the mapping had to be near
        reference: usize,
        /// The maximum displacement allowed from the anchor
        limit: usize,
    },

    /// Release was requested for an address this mapper did not issue, or already released.
    #[error("No live region is identified by {0:#x}")]
    NotFound(usize),

    /// The process map could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A write would have gone past the end of the region.
    #[error("Out of Bound write would have occurred!")]
    OutOfBounds,

    /// The region is currently flipped executable and must be made writable first.
    #[error("Region is not writable in its current protection state")]
    NotWritable,

    /// There is no process map backend for this target.
    #[error("This target is not supported")]
    NotSupported,

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// because another thread panicked while holding the lock.
    #[error("Failed to lock target")]
    LockError,

    /// Instruction-cache or write-protection entry points could not be resolved.
    ///
    /// Running generated code without them risks executing stale instructions, so
    /// this is reported once at initialization and the mapper refuses to start.
    #[error("JIT support unavailable - {0}")]
    JitUnavailable(String),

    /// File I/O error.
    ///
    /// Wraps errors from reading the proc pseudo-file.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
}

fn os_message(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

impl Error {
    /// Returns the raw OS error code if this error came from a failed system call.
    #[must_use]
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Os { code, .. } => Some(*code),
            Error::FileError(io) => io.raw_os_error(),
            _ => None,
        }
    }
}
