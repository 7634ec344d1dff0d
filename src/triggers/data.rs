//! Trigger instances.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use core::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use spin::RwLock;

use super::Error;
use super::command::EventCommand;
use crate::event::EventFile;
use crate::hashtable::HashTable;
use crate::trace_ops::EventFilter;

/// Bitmask of trigger kinds, used to defer post triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerType(u32);

impl TriggerType {
    pub const NONE: Self = Self(0);
    pub const TRACE_ONOFF: Self = Self(1 << 0);
    pub const SNAPSHOT: Self = Self(1 << 1);
    pub const STACKTRACE: Self = Self(1 << 2);
    pub const EVENT_ENABLE: Self = Self(1 << 3);
    pub const EVENT_HASH: Self = Self(1 << 4);

    /// Type for a command defined outside this crate. Pick bits above the
    /// built-in ones.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TriggerType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TriggerType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A compiled filter together with the expression it came from.
pub struct TriggerFilter {
    pub filter: Arc<dyn EventFilter>,
    pub expr: String,
}

/// Behaviour of one kind of trigger instance.
pub trait TriggerOps: Send + Sync {
    /// Fire the trigger. `rec` is `None` when the event fired without a record.
    fn func(&self, data: &TriggerData, rec: Option<&[u8]>);

    /// Describe the trigger, one line, for the trigger listing.
    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result;

    /// Take a reference on registration.
    fn init(&self, data: &TriggerData) -> Result<(), Error> {
        data.get();
        Ok(())
    }

    /// Drop a reference; the last one releases the trigger's resources.
    fn free(&self, data: &TriggerData) {
        if data.put() {
            trigger_data_free(data);
        }
    }

    /// Event enabled or disabled by this trigger, if any.
    fn enable_target(&self) -> Option<&Arc<EventFile>> {
        None
    }

    /// Table aggregated by this trigger, if any.
    fn hash_table(&self) -> Option<&Arc<HashTable>> {
        None
    }
}

/// One trigger attached to one event.
pub struct TriggerData {
    name: &'static str,
    trigger_type: TriggerType,
    post_trigger: bool,
    ops: Arc<dyn TriggerOps>,
    /// Remaining firings, -1 for unlimited.
    count: AtomicI64,
    filter: RwLock<Option<Arc<TriggerFilter>>>,
    refcnt: AtomicI32,
}

impl TriggerData {
    pub fn new<C: EventCommand + ?Sized>(cmd: &C, ops: Arc<dyn TriggerOps>) -> Self {
        Self {
            name: cmd.name(),
            trigger_type: cmd.trigger_type(),
            post_trigger: cmd.post_trigger(),
            ops,
            count: AtomicI64::new(-1),
            filter: RwLock::new(None),
            refcnt: AtomicI32::new(0),
        }
    }

    /// Name of the command that created this trigger.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger_type
    }

    pub fn post_trigger(&self) -> bool {
        self.post_trigger
    }

    pub fn ops(&self) -> &Arc<dyn TriggerOps> {
        &self.ops
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn set_count(&self, count: i64) {
        self.count.store(count, Ordering::Release);
    }

    /// Whether the trigger was given a firing limit.
    pub fn is_counted(&self) -> bool {
        self.count() != -1
    }

    /// Account for one firing. False once a limited trigger is used up.
    pub fn try_consume(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| match c {
                -1 => Some(-1),
                0 => None,
                c => Some(c - 1),
            })
            .is_ok()
    }

    pub fn filter(&self) -> Option<Arc<TriggerFilter>> {
        self.filter.read().clone()
    }

    /// Filter expression as written by the user.
    pub fn filter_str(&self) -> Option<String> {
        self.filter.read().as_ref().map(|f| f.expr.clone())
    }

    pub fn has_filter(&self) -> bool {
        self.filter.read().is_some()
    }

    pub fn set_filter(&self, filter: Option<TriggerFilter>) {
        *self.filter.write() = filter.map(Arc::new);
    }

    /// Whether `rec` passes the filter. Unfiltered triggers always match.
    pub fn matches(&self, rec: &[u8]) -> bool {
        match self.filter() {
            Some(f) => f.filter.matches(rec),
            None => true,
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference. True when it was the last one.
    pub(crate) fn put(&self) -> bool {
        let prev = self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| (r > 0).then(|| r - 1));
        match prev {
            Ok(prev) => prev == 1,
            Err(_) => {
                warn!("Trigger '{}' released more often than taken", self.name);
                false
            }
        }
    }
}

impl fmt::Debug for TriggerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerData")
            .field("name", &self.name)
            .field("count", &self.count())
            .field("filter", &self.filter_str())
            .field("ref", &self.ref_count())
            .finish()
    }
}

/// Release what every trigger owns: its filter.
pub fn trigger_data_free(data: &TriggerData) {
    data.set_filter(None);
}

/// `name:unlimited` or `name:count=N`, then ` if <filter>` when filtered.
pub fn event_trigger_print(out: &mut dyn fmt::Write, name: &str, data: &TriggerData) -> fmt::Result {
    out.write_str(name)?;
    match data.count() {
        -1 => out.write_str(":unlimited")?,
        n => write!(out, ":count={}", n)?,
    }
    match data.filter_str() {
        Some(expr) => writeln!(out, " if {}", expr),
        None => out.write_str("\n"),
    }
}
