//! Ordering of table entries for reports.

use alloc::string::ToString;
use alloc::vec::Vec;
use core::cmp::Ordering;

use super::field::HashField;
use super::table::EntryRef;
use super::{Error, HASH_SORT_KEYS_MAX};

/// What an entry is sorted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    HitCount,
    /// Sum of the value field at this index.
    Value(usize),
    /// Integer key part at this index.
    KeyPart(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    /// Hit count, ascending.
    pub const fn hitcount() -> Self {
        Self {
            field: SortField::HitCount,
            descending: false,
        }
    }

    /// The sorted-on quantity of `entry`.
    pub fn value_of(&self, entry: &EntryRef<'_>) -> u64 {
        match self.field {
            SortField::HitCount => entry.count(),
            SortField::Value(i) => entry.sum(i),
            SortField::KeyPart(i) => entry.key_u64(i),
        }
    }

    pub fn compare(&self, a: &EntryRef<'_>, b: &EntryRef<'_>) -> Ordering {
        let ord = self.value_of(a).cmp(&self.value_of(b));
        if self.descending { ord.reverse() } else { ord }
    }
}

impl Default for SortKey {
    fn default() -> Self {
        Self::hitcount()
    }
}

/// Resolve a sort field name: `hitcount`, a value (`a-b` for differences),
/// or an integer key.
fn resolve(name: &str, keys: &[HashField], vals: &[HashField]) -> Option<SortField> {
    if name == "hitcount" {
        return Some(SortField::HitCount);
    }
    if let Some(i) = vals.iter().position(|v| v.name() == name) {
        return Some(SortField::Value(i));
    }
    keys.iter()
        .position(|k| !k.is_string() && !k.is_stacktrace() && k.name() == name)
        .map(SortField::KeyPart)
}

/// Parse `sort=field[.ascending|.descending][,field[...]]`.
///
/// Without a sort string, entries sort by hit count ascending.
pub fn parse_sort_keys(
    spec: Option<&str>,
    keys: &[HashField],
    vals: &[HashField],
) -> Result<Vec<SortKey>, Error> {
    let Some(spec) = spec else {
        return Ok(alloc::vec![SortKey::hitcount()]);
    };
    let Some(("sort", fields)) = spec.split_once('=') else {
        return Err(Error::InvalidSortKey(spec.to_string()));
    };
    if fields.is_empty() {
        return Err(Error::InvalidSortKey(spec.to_string()));
    }

    let mut sort_keys = Vec::new();
    for token in fields.split(',') {
        if sort_keys.len() == HASH_SORT_KEYS_MAX {
            return Err(Error::TooManySortKeys);
        }
        let (name, direction) = match token.split_once('.') {
            Some((name, dir)) => (name, Some(dir)),
            None => (token, None),
        };
        let field = resolve(name, keys, vals)
            .ok_or_else(|| Error::InvalidSortKey(name.to_string()))?;
        let descending = match direction {
            None | Some("ascending") | Some("asc") => false,
            Some("descending") | Some("desc") => true,
            Some(other) => return Err(Error::InvalidSortKey(other.to_string())),
        };
        sort_keys.push(SortKey { field, descending });
    }
    Ok(sort_keys)
}

/// Sort by the primary key, then order each run of primary-key ties by
/// the secondary key.
///
/// Both passes are stable, so sorting an already sorted slice is a no-op.
pub fn sort_entries(entries: &mut [EntryRef<'_>], sort_keys: &[SortKey]) {
    let Some(primary) = sort_keys.first() else {
        return;
    };
    entries.sort_by(|a, b| primary.compare(a, b));

    if let Some(secondary) = sort_keys.get(1) {
        for run in entries.chunk_by_mut(|a, b| primary.value_of(a) == primary.value_of(b)) {
            if run.len() > 1 {
                run.sort_by(|a, b| secondary.compare(a, b));
            }
        }
    }
}
