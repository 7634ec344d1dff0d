//! The aggregation table.
//!
//! Storage is a fixed pool of `2 << bits` entries chained off `1 << bits`
//! bucket heads. Entries are claimed from the pool in order under the
//! table lock and linked at the head of their bucket only after their key
//! is written, so lookups walk the chains without locking. Entries are
//! never removed; once the pool is used up new keys are dropped and
//! counted while existing keys keep aggregating.

use alloc::alloc::Layout;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use super::field::{self, HashField};
use super::fnv;
use super::sort::{self, SortKey};
use super::{COMPOUND_KEY_MAX, Error, HASH_BITS_MAX, HASH_KEY_STRING_MAX, HASH_VALS_MAX};
use super::arena::{Slots, StoragePolicy};
use crate::event::EventCall;
use crate::trace_ops::{
    HASH_STACKTRACE_SKIP, IrqGuard, PID_MAX_DEFAULT, StackTrace, TASK_COMM_LEN, TaskInfo,
    TraceOps,
};

/// End of a bucket chain.
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    /// One integer field.
    Scalar,
    /// Several integer fields.
    Compound,
    String,
    Stacktrace,
}

/// One key part of an entry, as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValue<'a> {
    U64(u64),
    /// Stored bytes of a string key, NUL padding included.
    String(&'a [u8]),
    Stacktrace(&'a StackTrace),
}

struct EntryKey {
    vals: [u64; COMPOUND_KEY_MAX],
    comm: Option<[u8; TASK_COMM_LEN]>,
}

struct KeyString {
    len: usize,
    bytes: [u8; HASH_KEY_STRING_MAX],
}

impl KeyString {
    fn new(src: &[u8]) -> Self {
        let len = src.len().min(HASH_KEY_STRING_MAX);
        let mut bytes = [0u8; HASH_KEY_STRING_MAX];
        bytes[..len].copy_from_slice(&src[..len]);
        Self { len, bytes }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

struct HashEntry {
    key: Once<EntryKey>,
    sums: [AtomicU64; HASH_VALS_MAX],
    count: AtomicU64,
    next: AtomicUsize,
}

impl HashEntry {
    fn new() -> Self {
        Self {
            key: Once::new(),
            sums: [const { AtomicU64::new(0) }; HASH_VALS_MAX],
            count: AtomicU64::new(0),
            next: AtomicUsize::new(NIL),
        }
    }
}

/// Key of an incoming hit, extracted before touching the table.
struct LookupKey<'a> {
    vals: [u64; COMPOUND_KEY_MAX],
    string: &'a [u8],
    stack: &'a StackTrace,
    bucket: usize,
}

/// Layout of the bucket, entry, string and stack arrays in one block, with
/// the offset of each.
fn slot_layout(
    buckets: usize,
    entries: usize,
    strings: usize,
    stacks: usize,
) -> Option<(Layout, [usize; 4])> {
    let layout = Layout::array::<AtomicUsize>(buckets).ok()?;
    let (layout, entries_at) = layout.extend(Layout::array::<HashEntry>(entries).ok()?).ok()?;
    let (layout, strings_at) = layout
        .extend(Layout::array::<Once<KeyString>>(strings).ok()?)
        .ok()?;
    let (layout, stacks_at) = layout
        .extend(Layout::array::<Once<StackTrace>>(stacks).ok()?)
        .ok()?;
    Some((layout.pad_to_align(), [0, entries_at, strings_at, stacks_at]))
}

fn addr_range<T>(slots: &[T]) -> Range<usize> {
    let r = slots.as_ptr_range();
    r.start as usize..r.end as usize
}

/// Command name saved for `.execname` keys.
fn save_comm(task: &TaskInfo) -> [u8; TASK_COMM_LEN] {
    let name: &[u8] = if task.pid == 0 {
        b"<idle>"
    } else if task.pid < 0 {
        b"<XXX>"
    } else if task.pid > PID_MAX_DEFAULT {
        b"<...>"
    } else {
        return task.comm;
    };
    let mut comm = [0u8; TASK_COMM_LEN];
    comm[..name.len()].copy_from_slice(name);
    comm
}

/// A fixed-capacity hash aggregation table.
pub struct HashTable {
    bits: u32,
    kind: KeyKind,
    keys: Vec<HashField>,
    vals: Vec<HashField>,
    sort_keys: Vec<SortKey>,
    save_execname: bool,
    buckets: Slots<AtomicUsize>,
    entries: Slots<HashEntry>,
    strings: Slots<Once<KeyString>>,
    stacks: Slots<Once<StackTrace>>,
    /// Serializes entry creation; holds the number of claimed entries.
    lock: Mutex<usize>,
    total_hits: AtomicU64,
    total_entries: AtomicU64,
    drops: AtomicU64,
}

impl HashTable {
    /// Build a table from `keys:vals[:sort]` lists.
    ///
    /// `call` describes the records fed to [`HashTable::hit`]; without it
    /// only `stacktrace` keys and `hitcount`/`.override` values resolve.
    pub fn create(
        bits: u32,
        keys: &str,
        vals: &str,
        sort_keys: Option<&str>,
        call: Option<&EventCall>,
        storage: &dyn StoragePolicy,
    ) -> Result<Self, Error> {
        if bits == 0 || bits > HASH_BITS_MAX {
            return Err(Error::InvalidBits(bits));
        }

        if keys.is_empty() {
            return Err(Error::EmptySpec("key"));
        }
        let mut key_fields = Vec::new();
        for token in keys.split(',') {
            if key_fields.len() == COMPOUND_KEY_MAX {
                return Err(Error::TooManyKeys);
            }
            key_fields.push(field::parse_key(token, call)?);
        }

        let alone = key_fields.iter().any(|k| k.is_string() || k.is_stacktrace());
        if alone && key_fields.len() > 1 {
            return Err(Error::MixedKey);
        }
        let kind = match &key_fields[0] {
            k if k.is_stacktrace() => KeyKind::Stacktrace,
            k if k.is_string() => {
                if k.size() > HASH_KEY_STRING_MAX {
                    return Err(Error::UnsuitableField(k.name().into()));
                }
                KeyKind::String
            }
            _ if key_fields.len() > 1 => KeyKind::Compound,
            _ => KeyKind::Scalar,
        };

        if vals.is_empty() {
            return Err(Error::EmptySpec("value"));
        }
        let mut val_fields = Vec::new();
        for token in vals.split(',') {
            if let Some(v) = field::parse_val(token, call)? {
                if val_fields.len() == HASH_VALS_MAX {
                    return Err(Error::TooManyVals);
                }
                val_fields.push(v);
            }
        }

        let sort_keys = sort::parse_sort_keys(sort_keys, &key_fields, &val_fields)?;

        let n_buckets = 1usize << bits;
        let capacity = n_buckets * 2;
        let side = |needed: bool| if needed { capacity } else { 0 };
        let n_strings = side(kind == KeyKind::String);
        let n_stacks = side(kind == KeyKind::Stacktrace);
        let (layout, at) =
            slot_layout(n_buckets, capacity, n_strings, n_stacks).ok_or(Error::NoMemory)?;
        let block = storage.allocate_block(layout)?;
        let block = block.as_ref();

        let table = Self {
            bits,
            kind,
            save_execname: key_fields
                .iter()
                .any(|k| k.display() == field::FieldDisplay::Execname),
            keys: key_fields,
            vals: val_fields,
            sort_keys,
            buckets: Slots::new(block, at[0], n_buckets, || AtomicUsize::new(NIL))
                .ok_or(Error::NoMemory)?,
            entries: Slots::new(block, at[1], capacity, HashEntry::new).ok_or(Error::NoMemory)?,
            strings: Slots::new(block, at[2], n_strings, Once::new).ok_or(Error::NoMemory)?,
            stacks: Slots::new(block, at[3], n_stacks, Once::new).ok_or(Error::NoMemory)?,
            lock: Mutex::new(0),
            total_hits: AtomicU64::new(0),
            total_entries: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        };

        debug!(
            "Created hash table: bits={}, keys={}, vals={}, {} bytes from {}",
            bits,
            table.keys.len(),
            table.vals.len(),
            layout.size(),
            storage.name()
        );
        Ok(table)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of bucket heads, `1 << bits`.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Maximum number of distinct keys, `2 << bits`.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Address ranges of the bucket, entry, string and stack arrays. The
    /// last two are empty unless the table is keyed on them.
    pub fn storage_ranges(&self) -> [Range<usize>; 4] {
        [
            addr_range(&self.buckets),
            addr_range(&self.entries),
            addr_range(&self.strings),
            addr_range(&self.stacks),
        ]
    }

    pub fn keys(&self) -> &[HashField] {
        &self.keys
    }

    pub fn vals(&self) -> &[HashField] {
        &self.vals
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    /// Hits that reached an entry.
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    /// Distinct keys stored.
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Acquire)
    }

    /// Hits whose key could not be stored because the table was full.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn lookup_key<'a>(&self, rec: &'a [u8], stack: &'a StackTrace) -> LookupKey<'a> {
        let mut key = LookupKey {
            vals: [0; COMPOUND_KEY_MAX],
            string: &[],
            stack,
            bucket: 0,
        };
        let hash = match self.kind {
            KeyKind::Stacktrace => fnv::hash_stacktrace(stack, self.bits),
            KeyKind::String => {
                let s = self.keys[0].string_bytes(rec);
                key.string = &s[..s.len().min(HASH_KEY_STRING_MAX)];
                fnv::fnv_1a(key.string, self.bits)
            }
            KeyKind::Compound => {
                for (slot, k) in key.vals.iter_mut().zip(&self.keys) {
                    *slot = k.value(rec);
                }
                fnv::hash_compound(&key.vals[..self.keys.len()], self.bits)
            }
            KeyKind::Scalar => {
                key.vals[0] = self.keys[0].value(rec);
                if self.keys[0].size() == 8 {
                    fnv::hash_64(key.vals[0], self.bits)
                } else {
                    fnv::hash_32(key.vals[0] as u32, self.bits)
                }
            }
        };
        key.bucket = hash as usize;
        key
    }

    fn matches(&self, idx: usize, key: &LookupKey<'_>) -> bool {
        let Some(stored) = self.entries[idx].key.get() else {
            return false;
        };
        match self.kind {
            KeyKind::Stacktrace => self.stacks[idx]
                .get()
                .is_some_and(|s| s.frames() == key.stack.frames()),
            KeyKind::String => self.strings[idx]
                .get()
                .is_some_and(|s| s.as_bytes() == key.string),
            KeyKind::Scalar | KeyKind::Compound => {
                let n = self.keys.len();
                stored.vals[..n] == key.vals[..n]
            }
        }
    }

    fn find(&self, key: &LookupKey<'_>) -> Option<usize> {
        let mut idx = self.buckets[key.bucket].load(Ordering::Acquire);
        while idx != NIL {
            if self.matches(idx, key) {
                return Some(idx);
            }
            idx = self.entries[idx].next.load(Ordering::Acquire);
        }
        None
    }

    /// Claim, fill and publish a new entry. Caller holds the table lock.
    fn create_locked(&self, claimed: &mut usize, ops: &dyn TraceOps, key: &LookupKey<'_>) -> Option<usize> {
        if *claimed >= self.capacity() {
            if self.drops.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!(
                    "Hash table full ({} entries), dropping new keys",
                    self.capacity()
                );
            }
            return None;
        }
        let idx = *claimed;
        *claimed += 1;

        match self.kind {
            KeyKind::String => {
                self.strings[idx].call_once(|| KeyString::new(key.string));
            }
            KeyKind::Stacktrace => {
                self.stacks[idx].call_once(|| *key.stack);
            }
            KeyKind::Scalar | KeyKind::Compound => {}
        }
        let comm = self.save_execname.then(|| save_comm(&ops.current_task()));
        let entry = &self.entries[idx];
        entry.key.call_once(|| EntryKey {
            vals: key.vals,
            comm,
        });

        let head = &self.buckets[key.bucket];
        entry.next.store(head.load(Ordering::Relaxed), Ordering::Relaxed);
        head.store(idx, Ordering::Release);
        self.total_entries.fetch_add(1, Ordering::Release);
        Some(idx)
    }

    fn lookup_or_create_key(&self, ops: &dyn TraceOps, key: &LookupKey<'_>) -> Option<usize> {
        if let Some(idx) = self.find(key) {
            return Some(idx);
        }
        let _irq = IrqGuard::new(ops);
        let mut claimed = self.lock.lock();
        // Another CPU may have created the key while we waited.
        self.find(key)
            .or_else(|| self.create_locked(&mut claimed, ops, key))
    }

    fn capture_stack(&self, ops: &dyn TraceOps) -> StackTrace {
        let mut stack = StackTrace::new(HASH_STACKTRACE_SKIP);
        if self.kind == KeyKind::Stacktrace {
            ops.save_stack_trace(&mut stack);
        }
        stack
    }

    /// Find the entry for the key of `rec` (or the current stack), creating
    /// it if needed. `None` when the key is new and the table is full.
    pub fn lookup_or_create(&self, ops: &dyn TraceOps, rec: Option<&[u8]>) -> Option<EntryRef<'_>> {
        let stack = self.capture_stack(ops);
        let key = self.lookup_key(rec.unwrap_or(&[]), &stack);
        self.lookup_or_create_key(ops, &key)
            .map(|idx| EntryRef { table: self, idx })
    }

    /// Add one hit and the values of `rec` to `entry`.
    pub fn update(&self, entry: EntryRef<'_>, rec: &[u8]) {
        let e = &self.entries[entry.idx];
        e.count.fetch_add(1, Ordering::Relaxed);
        for (sum, val) in e.sums.iter().zip(&self.vals) {
            sum.fetch_add(val.value(rec), Ordering::Relaxed);
        }
    }

    /// Add one hit and caller-supplied values to `entry`.
    ///
    /// `vals[i]` is added to the i-th value field; missing values add nothing.
    pub fn update_with_vals(&self, entry: EntryRef<'_>, vals: Option<&[u64]>) {
        let e = &self.entries[entry.idx];
        e.count.fetch_add(1, Ordering::Relaxed);
        if let Some(vals) = vals {
            for (sum, v) in e.sums.iter().zip(vals.iter().take(self.vals.len())) {
                sum.fetch_add(*v, Ordering::Relaxed);
            }
        }
    }

    /// Aggregate one event record.
    pub fn hit(&self, ops: &dyn TraceOps, rec: &[u8]) {
        if let Some(entry) = self.lookup_or_create(ops, Some(rec)) {
            self.update(entry, rec);
            self.total_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Aggregate one hit without a record, keyed on the current stack.
    pub fn hit_with_vals(&self, ops: &dyn TraceOps, vals: Option<&[u64]>) {
        if let Some(entry) = self.lookup_or_create(ops, None) {
            self.update_with_vals(entry, vals);
            self.total_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// All stored entries in bucket order, chain order within a bucket.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            table: self,
            bucket: 0,
            next: NIL,
        }
    }
}

/// A stored entry.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    table: &'a HashTable,
    idx: usize,
}

impl<'a> EntryRef<'a> {
    /// Position in the entry pool; entries are claimed in creation order.
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn count(&self) -> u64 {
        self.table.entries[self.idx].count.load(Ordering::Relaxed)
    }

    /// Sum of the i-th value field.
    pub fn sum(&self, i: usize) -> u64 {
        self.table.entries[self.idx]
            .sums
            .get(i)
            .map_or(0, |s| s.load(Ordering::Relaxed))
    }

    /// The i-th key part.
    pub fn key(&self, i: usize) -> KeyValue<'a> {
        let t = self.table;
        match t.kind {
            KeyKind::Stacktrace => t.stacks[self.idx]
                .get()
                .map_or(KeyValue::U64(0), KeyValue::Stacktrace),
            KeyKind::String => t.strings[self.idx]
                .get()
                .map_or(KeyValue::U64(0), |s| KeyValue::String(s.as_bytes())),
            KeyKind::Scalar | KeyKind::Compound => KeyValue::U64(self.key_u64(i)),
        }
    }

    /// Integer value of the i-th key part, 0 for string and stacktrace keys.
    pub fn key_u64(&self, i: usize) -> u64 {
        self.table.entries[self.idx]
            .key
            .get()
            .and_then(|k| k.vals.get(i).copied())
            .unwrap_or(0)
    }

    /// Command name saved when the entry was created, up to the first NUL.
    pub fn comm(&self) -> Option<&'a [u8]> {
        let comm = self.table.entries[self.idx].key.get()?.comm.as_ref()?;
        let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
        Some(&comm[..len])
    }
}

impl core::fmt::Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntryRef")
            .field("idx", &self.idx)
            .field("count", &self.count())
            .finish()
    }
}

/// Iterator over the entries of a table, see [`HashTable::entries`].
pub struct Entries<'a> {
    table: &'a HashTable,
    bucket: usize,
    next: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next == NIL {
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.next = self.table.buckets[self.bucket].load(Ordering::Acquire);
            self.bucket += 1;
        }
        let idx = self.next;
        self.next = self.table.entries[idx].next.load(Ordering::Acquire);
        Some(EntryRef {
            table: self.table,
            idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_comm_special_pids() {
        assert_eq!(&save_comm(&TaskInfo::new(0, "swapper"))[..6], b"<idle>");
        assert_eq!(&save_comm(&TaskInfo::new(-1, "x"))[..5], b"<XXX>");
        assert_eq!(&save_comm(&TaskInfo::new(PID_MAX_DEFAULT + 1, "x"))[..5], b"<...>");
        assert_eq!(&save_comm(&TaskInfo::new(42, "bash"))[..5], b"bash\0");
    }

    #[test]
    fn test_key_string_truncates() {
        let long = [b'a'; HASH_KEY_STRING_MAX + 10];
        assert_eq!(KeyString::new(&long).as_bytes().len(), HASH_KEY_STRING_MAX);
    }
}
