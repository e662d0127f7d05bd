use core::alloc::Layout;
use core::fmt;

/// Represents errors that can occur when a table has to change size.
///
/// Lookups and removals never fail; only operations that may allocate report
/// errors, and the table is left unchanged when they do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The requested capacity overflowed the maximum allocation size
    CapacityOverflow,

    /// The allocator declined the layout required for the requested capacity
    AllocationFailure {
        /// The layout that could not be allocated
        layout: Layout,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapacityOverflow => write!(f, "hash table capacity overflow"),
            Error::AllocationFailure { layout } => write!(
                f,
                "allocation of {} bytes for a hash table failed",
                layout.size()
            ),
        }
    }
}

impl core::error::Error for Error {}

/// Table result
pub type Result<T> = core::result::Result<T, Error>;
