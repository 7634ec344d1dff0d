//! Hash aggregation of event hits.
//!
//! A [`HashTable`] groups event records by a key built from record fields
//! (or the current call stack) and keeps per-key hit counts and value sums.
//! Updates run in tracing context: they never allocate, and all storage
//! is reserved when the table is created, either from the heap or from a
//! boot-time [`BootArena`].

pub mod arena;
pub mod field;
pub mod fnv;
pub mod report;
pub mod sort;
pub mod table;

use alloc::string::String;
use core::fmt;

pub use arena::{ArenaBlock, BootArena, Exhausted, HeapStorage, StoragePolicy};
pub use field::{FieldDisplay, HashField, Scalar, ValueFn};
pub use sort::{SortField, SortKey};
pub use table::{EntryRef, HashTable, KeyValue};

/// Maximum number of fields in a compound key.
pub const COMPOUND_KEY_MAX: usize = 8;

/// Maximum number of summed values.
pub const HASH_VALS_MAX: usize = 16;

/// Maximum number of sort keys (primary and secondary).
pub const HASH_SORT_KEYS_MAX: usize = 2;

/// Longest string field usable as a key.
pub const HASH_KEY_STRING_MAX: usize = 64;

/// Table size used by the `hash` trigger command.
pub const HASH_TRIGGER_BITS: u32 = 11;

/// Largest accepted table size.
pub const HASH_BITS_MAX: u32 = 20;

/// Hash table creation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A key or value list was empty.
    EmptySpec(&'static str),
    /// No such field in the event.
    UnknownField(String),
    /// The field cannot be used in this position (function, bad width, ...).
    UnsuitableField(String),
    /// Unknown `.modifier`, or one not allowed on this field.
    InvalidModifier(String),
    /// String and stacktrace keys cannot be combined with other keys.
    MixedKey,
    TooManyKeys,
    TooManyVals,
    TooManySortKeys,
    InvalidSortKey(String),
    InvalidBits(u32),
    /// Table storage could not be reserved.
    NoMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptySpec(what) => write!(f, "No {} fields given", what),
            Error::UnknownField(name) => write!(f, "Unknown field: {}", name),
            Error::UnsuitableField(name) => write!(f, "Field cannot be aggregated: {}", name),
            Error::InvalidModifier(m) => write!(f, "Invalid field modifier: {}", m),
            Error::MixedKey => write!(f, "String and stacktrace keys must be used alone"),
            Error::TooManyKeys => write!(f, "Too many key fields (max {})", COMPOUND_KEY_MAX),
            Error::TooManyVals => write!(f, "Too many value fields (max {})", HASH_VALS_MAX),
            Error::TooManySortKeys => {
                write!(f, "Too many sort keys (max {})", HASH_SORT_KEYS_MAX)
            }
            Error::InvalidSortKey(name) => write!(f, "Invalid sort key: {}", name),
            Error::InvalidBits(bits) => write!(f, "Invalid table size: {} bits", bits),
            Error::NoMemory => write!(f, "Out of memory for hash table"),
        }
    }
}

impl core::error::Error for Error {}

impl From<Exhausted> for Error {
    fn from(_: Exhausted) -> Self {
        Error::NoMemory
    }
}
