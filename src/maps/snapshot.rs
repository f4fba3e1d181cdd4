//! Fixed, caller-provided process map.

use crate::{
    maps::{MapSource, MappingTable, ProcMapping},
    Result,
};

/// A map source that always reports the same mappings.
///
/// Used to drive the allocator against a synthetic address space, and to freeze a live
/// snapshot so several placements can be reasoned about against one view.
///
/// # Examples
///
/// ```rust
/// use nearmap::maps::{snapshot::Snapshot, MapSource, ProcMapping};
/// use nearmap::Protection;
///
/// let source = Snapshot::new(vec![
///     ProcMapping::new(0x10000, 0x20000, Protection::READ_EXEC),
///     ProcMapping::new(0x40000, 0x48000, Protection::READ_WRITE),
/// ])?;
/// assert_eq!(source.current_mappings()?.len(), 2);
/// # Ok::<(), nearmap::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    table: MappingTable,
}

impl Snapshot {
    /// Validates and stores `mappings`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the mappings overlap or are inverted.
    pub fn new(mappings: Vec<ProcMapping>) -> Result<Self> {
        Ok(Snapshot {
            table: MappingTable::new(mappings)?,
        })
    }

    /// An address space with nothing mapped.
    #[must_use]
    pub fn empty() -> Self {
        Snapshot::default()
    }

    /// Freezes whatever `source` reports right now.
    ///
    /// # Errors
    /// Propagates the failure of `source`.
    pub fn capture(source: &dyn MapSource) -> Result<Self> {
        Ok(Snapshot {
            table: source.current_mappings()?,
        })
    }

    /// The frozen table.
    #[must_use]
    pub fn table(&self) -> &MappingTable {
        &self.table
    }
}

impl From<MappingTable> for Snapshot {
    fn from(table: MappingTable) -> Self {
        Snapshot { table }
    }
}

impl MapSource for Snapshot {
    fn current_mappings(&self) -> Result<MappingTable> {
        Ok(self.table.clone())
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}
