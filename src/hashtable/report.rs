//! Text reports of table contents.
//!
//! Output format, one line per entry:
//!
//! ```text
//! key: pid:1, call_site:[ffffffff81234567] kfree	vals: count:2, bytes_alloc:17
//! Totals:
//!     Hits: 3
//!     Entries: 2
//!     Dropped: 0
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use super::field::FieldDisplay;
use super::sort;
use super::table::{EntryRef, HashTable, KeyValue};
use crate::trace_ops::{StackTrace, TraceOps};

/// Indentation of stacktrace frames.
const FRAME_INDENT: usize = 9;

/// Printed after the totals when entries could not be sorted.
pub const UNSORTED_MARKER: &str = "Unsorted (couldn't alloc memory for sorting)\n";

fn print_bytes(out: &mut dyn Write, bytes: &[u8]) -> fmt::Result {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    out.write_str(&String::from_utf8_lossy(&bytes[..len]))
}

fn print_stacktrace(out: &mut dyn Write, trace: &StackTrace, ops: &dyn TraceOps) -> fmt::Result {
    for &frame in trace.frames() {
        if frame == usize::MAX {
            break;
        }
        write!(out, "{:width$}", "", width = FRAME_INDENT)?;
        match ops.lookup_symbol(frame as u64) {
            Some(sym) => writeln!(out, "{}", sym)?,
            None => writeln!(out, "0x{:x}", frame)?,
        }
    }
    Ok(())
}

/// Print one entry: its key parts, then hit count and sums.
pub fn print_entry(
    out: &mut dyn Write,
    table: &HashTable,
    entry: &EntryRef<'_>,
    ops: &dyn TraceOps,
) -> fmt::Result {
    out.write_str("key: ")?;
    for (i, key) in table.keys().iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        let name = key.name();
        match (entry.key(i), key.display()) {
            (KeyValue::Stacktrace(trace), _) => {
                out.write_str("stacktrace:\n")?;
                print_stacktrace(out, trace, ops)?;
            }
            (KeyValue::String(s), _) => {
                write!(out, "{}:", name)?;
                print_bytes(out, s)?;
            }
            (KeyValue::U64(v), FieldDisplay::Sym) => {
                let sym = ops.lookup_symbol(v).unwrap_or_default();
                write!(out, "{}:[{:x}] {}", name, v, sym)?;
            }
            (KeyValue::U64(v), FieldDisplay::Hex) => write!(out, "{}:{:x}", name, v)?,
            (KeyValue::U64(v), FieldDisplay::Execname) => {
                write!(out, "{}:", name)?;
                print_bytes(out, entry.comm().unwrap_or_default())?;
                write!(out, "[{}]", v)?;
            }
            (KeyValue::U64(v), FieldDisplay::Syscall) => match ops.syscall_name(v) {
                Some(sc) => write!(out, "{}:{}", name, sc)?,
                None => write!(out, "{}:unknown_syscall", name)?,
            },
            (KeyValue::U64(v), FieldDisplay::Plain) => write!(out, "{}:{}", name, v)?,
        }
    }

    write!(out, "\tvals: count:{}", entry.count())?;
    for (i, val) in table.vals().iter().enumerate() {
        write!(out, ", {}:{}", val.name(), entry.sum(i))?;
    }
    out.write_str("\n")
}

/// Sort buffer growth from the heap; `false` when out of memory.
pub fn heap_reserve(entries: &mut Vec<EntryRef<'_>>, additional: usize) -> bool {
    entries.try_reserve_exact(additional).is_ok()
}

/// Entries in bucket order. `None` if the snapshot vector cannot be allocated.
pub fn collect_entries(table: &HashTable) -> Option<Vec<EntryRef<'_>>> {
    collect_entries_with(table, &heap_reserve)
}

/// [`collect_entries`] with the buffer grown through `reserve`.
pub fn collect_entries_with<'t>(
    table: &'t HashTable,
    reserve: &dyn Fn(&mut Vec<EntryRef<'_>>, usize) -> bool,
) -> Option<Vec<EntryRef<'t>>> {
    let mut entries = Vec::new();
    // Entries may be added while we walk; reserve for the current count
    // and grow one at a time past it.
    if !reserve(&mut entries, table.total_entries() as usize) {
        return None;
    }
    for e in table.entries() {
        if entries.len() == entries.capacity() && !reserve(&mut entries, 1) {
            break;
        }
        entries.push(e);
    }
    Some(entries)
}

/// Entries ordered by the table's sort keys.
pub fn sorted_entries(table: &HashTable) -> Option<Vec<EntryRef<'_>>> {
    let mut entries = collect_entries(table)?;
    sort::sort_entries(&mut entries, table.sort_keys());
    Some(entries)
}

/// Print all entries in bucket order.
pub fn print_entries_unsorted(
    out: &mut dyn Write,
    table: &HashTable,
    ops: &dyn TraceOps,
) -> fmt::Result {
    for e in table.entries() {
        print_entry(out, table, &e, ops)?;
    }
    Ok(())
}

pub fn print_totals(out: &mut dyn Write, table: &HashTable, sorted: bool) -> fmt::Result {
    write!(
        out,
        "Totals:\n    Hits: {}\n    Entries: {}\n    Dropped: {}\n",
        table.total_hits(),
        table.total_entries(),
        table.drops()
    )?;
    if !sorted {
        out.write_str(UNSORTED_MARKER)?;
    }
    Ok(())
}

/// Entries (sorted when possible) followed by the totals.
pub fn print_table(out: &mut dyn Write, table: &HashTable, ops: &dyn TraceOps) -> fmt::Result {
    print_table_with(out, table, ops, &heap_reserve)
}

/// [`print_table`] with the sort buffer grown through `reserve`. Falls back
/// to bucket order, flagged after the totals, when it cannot be allocated.
pub fn print_table_with(
    out: &mut dyn Write,
    table: &HashTable,
    ops: &dyn TraceOps,
    reserve: &dyn Fn(&mut Vec<EntryRef<'_>>, usize) -> bool,
) -> fmt::Result {
    let sorted = match collect_entries_with(table, reserve) {
        Some(mut entries) => {
            sort::sort_entries(&mut entries, table.sort_keys());
            for e in &entries {
                print_entry(out, table, e, ops)?;
            }
            true
        }
        None => {
            warn!("No memory to sort {} hash entries", table.total_entries());
            print_entries_unsorted(out, table, ops)?;
            false
        }
    };
    print_totals(out, table, sorted)
}

impl HashTable {
    /// Render the full report into a string.
    pub fn report(&self, ops: &dyn TraceOps) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = print_table(&mut out, self, ops);
        out
    }
}
