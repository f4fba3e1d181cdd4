//! Text-based proc filesystem backend.
//!
//! Linux and Android expose the calling process's mappings as `/proc/self/maps`, one line
//! per region:
//!
//! ```text
//! 55d0c8a4b000-55d0c8a4d000 r-xp 00002000 08:01 1234567    /usr/bin/host
//! 7ffd1c5f2000-7ffd1c613000 rw-p 00000000 00:00 0          [stack]
//! ```
//!
//! The fields are the hex address range, a four-character permission string (the last
//! character `s` for shared or `p` for private), the hex file offset, the device, the
//! inode, and an optional path which may itself contain spaces. A line with fewer than the
//! five mandatory fields fails the whole parse: skipping it would hide an occupied range
//! from the allocator.
//!
//! [`parse_maps`] is a pure function so it can be tested and benchmarked on fixed input;
//! [`ProcFs`] reads the pseudo-file and feeds it through.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    maps::{MapSource, MappingTable, ProcMapping},
    region::Protection,
    Result,
};

/// Default location of the calling process's map.
pub const SELF_MAPS: &str = "/proc/self/maps";

/// Map source reading a `/proc/<pid>/maps` style pseudo-file.
#[derive(Debug, Clone)]
pub struct ProcFs {
    path: PathBuf,
}

impl ProcFs {
    /// Reads the calling process's map at [`SELF_MAPS`].
    #[must_use]
    pub fn new() -> Self {
        ProcFs {
            path: PathBuf::from(SELF_MAPS),
        }
    }

    /// Reads a map file at another location, e.g. a saved copy.
    #[must_use]
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        ProcFs {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        ProcFs::new()
    }
}

impl MapSource for ProcFs {
    fn current_mappings(&self) -> Result<MappingTable> {
        let text = fs::read_to_string(&self.path)?;
        MappingTable::new(parse_maps(&text)?)
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

fn parse_hex(field: &str, what: &str, line_no: usize) -> Result<u64> {
    u64::from_str_radix(field, 16)
        .map_err(|_| malformed_error!("line {}: invalid {} '{}'", line_no, what, field))
}

fn parse_address(field: &str, line_no: usize) -> Result<usize> {
    let value = parse_hex(field, "address", line_no)?;
    usize::try_from(value)
        .map_err(|_| malformed_error!("line {}: address {} exceeds usize", line_no, field))
}

fn parse_permissions(field: &str, line_no: usize) -> Result<(Protection, bool)> {
    let bytes = field.as_bytes();
    if bytes.len() != 4 {
        return Err(malformed_error!(
            "line {}: invalid permissions '{}'",
            line_no,
            field
        ));
    }

    let mut protection = Protection::empty();
    for (byte, expected, bit) in [
        (bytes[0], b'r', Protection::READ),
        (bytes[1], b'w', Protection::WRITE),
        (bytes[2], b'x', Protection::EXEC),
    ] {
        if byte == expected {
            protection |= bit;
        } else if byte != b'-' {
            return Err(malformed_error!(
                "line {}: invalid permissions '{}'",
                line_no,
                field
            ));
        }
    }

    let shared = match bytes[3] {
        b's' => true,
        b'p' => false,
        _ => {
            return Err(malformed_error!(
                "line {}: invalid sharing flag in '{}'",
                line_no,
                field
            ))
        }
    };

    Ok((protection, shared))
}

/// Splits off the next whitespace-delimited field, returning it and the remainder.
fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(end) => Some((&text[..end], &text[end..])),
        None => Some((text, "")),
    }
}

/// Parses one line of a proc map.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the line has fewer than five fields or any
/// mandatory field is invalid.
pub fn parse_line(line: &str, line_no: usize) -> Result<ProcMapping> {
    let mut fields = [""; 5];
    let mut rest = line;
    for (idx, slot) in fields.iter_mut().enumerate() {
        let Some((field, remainder)) = next_field(rest) else {
            return Err(malformed_error!(
                "line {}: expected at least 5 fields, found {}",
                line_no,
                idx
            ));
        };
        *slot = field;
        rest = remainder;
    }

    let [range, perms, offset, _device, _inode] = fields;

    let Some((start, end)) = range.split_once('-') else {
        return Err(malformed_error!(
            "line {}: invalid address range '{}'",
            line_no,
            range
        ));
    };
    let start = parse_address(start, line_no)?;
    let end = parse_address(end, line_no)?;
    let (protection, shared) = parse_permissions(perms, line_no)?;
    let offset = parse_hex(offset, "offset", line_no)?;

    let path = rest.trim();
    Ok(ProcMapping {
        start,
        end,
        protection,
        shared,
        offset,
        path: (!path.is_empty()).then(|| path.to_string()),
    })
}

/// Parses the full text of a proc map.
///
/// Blank lines are ignored; any other malformed line fails the whole parse.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] naming the first offending line.
pub fn parse_maps(text: &str) -> Result<Vec<ProcMapping>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_line(line, idx + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const SAMPLE: &str = "\
55d0c8a4b000-55d0c8a4d000 r--p 00000000 08:01 1234567                    /usr/bin/host
55d0c8a4d000-55d0c8a52000 r-xp 00002000 08:01 1234567                    /usr/bin/host
55d0c9f00000-55d0c9f21000 rw-p 00000000 00:00 0                          [heap]
7f2a10000000-7f2a10021000 rw-s 00000000 00:05 98765                      /dev/shm/my segment
7ffd1c5f2000-7ffd1c613000 rw-p 00000000 00:00 0                          [stack]
7ffd1c7f0000-7ffd1c7f2000 r-xp 00000000 00:00 0
";

    #[test]
    fn parse_sample() {
        let mappings = parse_maps(SAMPLE).unwrap();
        assert_eq!(mappings.len(), 6);

        let text = &mappings[1];
        assert_eq!(text.start, 0x55d0c8a4d000);
        assert_eq!(text.end, 0x55d0c8a52000);
        assert_eq!(text.protection, Protection::READ_EXEC);
        assert!(!text.shared);
        assert_eq!(text.offset, 0x2000);
        assert_eq!(text.path.as_deref(), Some("/usr/bin/host"));

        assert_eq!(mappings[2].path.as_deref(), Some("[heap]"));
        assert_eq!(mappings[2].protection, Protection::READ_WRITE);

        let shm = &mappings[3];
        assert!(shm.shared);
        assert_eq!(shm.path.as_deref(), Some("/dev/shm/my segment"));

        assert_eq!(mappings[5].path, None);
    }

    #[test]
    fn parse_sample_is_a_valid_table() {
        let table = MappingTable::new(parse_maps(SAMPLE).unwrap()).unwrap();
        assert_eq!(table.len(), 6);
        assert!(table.find(0x55d0c8a4e000).is_some());
    }

    #[test]
    fn short_line_fails_whole_parse() {
        let text = format!("{SAMPLE}7ffd1c800000-7ffd1c801000 r--p 00000000\n");
        match parse_maps(&text) {
            Err(Error::Malformed { message, .. }) => {
                assert!(message.contains("line 7"), "{message}");
                assert!(message.contains("found 3"), "{message}");
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn bad_fields_rejected() {
        assert!(parse_line("zz-1000 r--p 0 00:00 0", 1).is_err());
        assert!(parse_line("1000 r--p 0 00:00 0", 1).is_err());
        assert!(parse_line("1000-2000 rq-p 0 00:00 0", 1).is_err());
        assert!(parse_line("1000-2000 r--x 0 00:00 0", 1).is_err());
        assert!(parse_line("1000-2000 r-- 0 00:00 0", 1).is_err());
        assert!(parse_line("1000-2000 r--p zz 00:00 0", 1).is_err());
    }

    #[test]
    fn blank_lines_ignored() {
        let mappings = parse_maps("\n1000-2000 r--p 0 00:00 0\n\n").unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].len(), 0x1000);
    }

    #[test]
    fn proc_fs_reads_saved_copy() {
        let path = std::env::temp_dir().join("nearmap_procfs_saved_copy.maps");
        std::fs::write(&path, SAMPLE).unwrap();

        let table = ProcFs::with_path(&path).current_mappings().unwrap();
        assert_eq!(table.len(), 6);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn proc_fs_missing_file() {
        let result = ProcFs::with_path("/nonexistent/maps").current_mappings();
        match result {
            Err(Error::FileError(io_error)) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("Expected FileError, got {other:?}"),
        }
    }
}
