//! Free-space computation over a process map.

use std::fmt;

use crate::maps::ProcMapping;

/// A free `[start, end)` interval between occupied mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gap {
    /// First free address
    pub start: usize,
    /// First address past the free space
    pub end: usize,
}

impl Gap {
    /// Creates a gap covering `start..end`.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        Gap { start, end }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` if the gap holds no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Candidate placement addresses for a `size`-byte region inside this gap.
    ///
    /// The first candidate is the gap start rounded up to `align` (a power of two); each
    /// next candidate is `size` bytes further. Every yielded candidate leaves the whole
    /// region inside the gap.
    pub fn strides(&self, size: usize, align: usize) -> impl Iterator<Item = usize> {
        let end = self.end;
        let first = crate::region::round_up(self.start, align);
        let fits = move |candidate: &usize| {
            size > 0 && candidate.checked_add(size).is_some_and(|e| e <= end)
        };

        std::iter::successors(first.filter(fits), move |&prev| {
            prev.checked_add(size).filter(fits)
        })
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// Computes the free space between consecutive mappings.
///
/// `mappings` must be ascending by start address. Returns one gap between each pair of
/// consecutive mappings that do not touch, plus a final gap from the end of the last
/// mapping to `ceiling`. With no mappings at all the whole range `0..ceiling` is free.
#[must_use]
pub fn compute_gaps(mappings: &[ProcMapping], ceiling: usize) -> Vec<Gap> {
    let mut gaps: Vec<Gap> = mappings
        .windows(2)
        .filter(|pair| pair[1].start > pair[0].end)
        .map(|pair| Gap::new(pair[0].end, pair[1].start))
        .collect();

    match mappings.last() {
        Some(last) if last.end < ceiling => gaps.push(Gap::new(last.end, ceiling)),
        Some(_) => {}
        None if ceiling > 0 => gaps.push(Gap::new(0, ceiling)),
        None => {}
    }

    gaps
}

/// Returns the gaps that could hold a `size`-byte region placed after `reference`.
///
/// A gap qualifies if it starts strictly above `reference` and, once clipped to
/// `ceiling`, is at least `size` bytes long. The result keeps ascending address order,
/// so the nearest candidates are tried first.
///
/// # Examples
///
/// ```rust
/// use nearmap::alloc::{find_candidate_gaps, Gap};
/// use nearmap::maps::ProcMapping;
/// use nearmap::Protection;
///
/// let mappings = [
///     ProcMapping::new(0, 100, Protection::READ_EXEC),
///     ProcMapping::new(200, 300, Protection::READ_WRITE),
/// ];
///
/// assert_eq!(find_candidate_gaps(&mappings, 50, 50, 300), vec![Gap::new(100, 200)]);
/// assert!(find_candidate_gaps(&mappings, 50, 200, 300).is_empty());
/// ```
#[must_use]
pub fn find_candidate_gaps(
    mappings: &[ProcMapping],
    reference: usize,
    size: usize,
    ceiling: usize,
) -> Vec<Gap> {
    compute_gaps(mappings, ceiling)
        .into_iter()
        .filter(|gap| gap.start > reference)
        .map(|gap| Gap::new(gap.start, gap.end.min(ceiling)))
        .filter(|gap| gap.len() >= size)
        .collect()
}
