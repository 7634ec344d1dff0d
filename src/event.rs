//! Trace event model: fields, event definitions and per-instance event files.
//!
//! An [`EventFile`] owns the trigger list of one event and the flag word
//! consulted on every hit. Readers of the trigger list never block: they
//! take a snapshot `Arc` of the current list, while writers copy, modify
//! and republish it under a separate update lock. A removed trigger lives
//! until the last reader drops its snapshot.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::hashtable::fnv::FnvBuildHasher;
use crate::trace_ops::{IrqGuard, TraceOps};
use crate::triggers::{TriggerData, TriggerType};

/// Name of the common pid field every event carries.
pub const COMMON_PID: &str = "common_pid";

/// Event file flag bits.
pub mod flags {
    /// The event is registered with its tracepoint.
    pub const ENABLED: u32 = 1 << 0;
    /// At least one soft-mode user keeps the event registered.
    pub const SOFT_MODE: u32 = 1 << 1;
    /// Registered, but records are discarded instead of committed.
    pub const SOFT_DISABLED: u32 = 1 << 2;
    /// At least one trigger is attached.
    pub const TRIGGER_MODE: u32 = 1 << 3;
    /// Some trigger needs the record (filter or post trigger).
    pub const TRIGGER_COND: u32 = 1 << 4;
}

// =============================================================================
// Fields
// =============================================================================

/// How a field's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    /// Fixed-size, NUL-padded character array.
    String,
    /// Function pointer; never usable as a key or value.
    Function,
}

/// A field of an event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventField {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub is_signed: bool,
    pub ty: FieldType,
}

impl EventField {
    pub fn new(name: &str, offset: usize, size: usize, is_signed: bool, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            offset,
            size,
            is_signed,
            ty,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.ty == FieldType::Integer
    }

    pub fn is_string(&self) -> bool {
        self.ty == FieldType::String
    }

    /// The field's bytes within `rec`, or `None` if the record is too short.
    pub fn bytes<'a>(&self, rec: &'a [u8]) -> Option<&'a [u8]> {
        rec.get(self.offset..self.offset.checked_add(self.size)?)
    }

    /// Read an integer field, sign-extending signed widths to 64 bits.
    pub fn read_integer(&self, rec: &[u8]) -> Option<u64> {
        let b = self.bytes(rec)?;
        let v = match (self.size, self.is_signed) {
            (1, false) => b[0] as u64,
            (1, true) => b[0] as i8 as i64 as u64,
            (2, false) => u16::from_ne_bytes([b[0], b[1]]) as u64,
            (2, true) => i16::from_ne_bytes([b[0], b[1]]) as i64 as u64,
            (4, false) => u32::from_ne_bytes(b.try_into().ok()?) as u64,
            (4, true) => i32::from_ne_bytes(b.try_into().ok()?) as i64 as u64,
            (8, _) => u64::from_ne_bytes(b.try_into().ok()?),
            _ => return None,
        };
        Some(v)
    }
}

// =============================================================================
// Event Definitions
// =============================================================================

/// Static description of an event: its name and record layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCall {
    pub system: String,
    pub name: String,
    pub fields: Vec<EventField>,
}

impl EventCall {
    pub fn new(system: &str, name: &str) -> Self {
        Self {
            system: system.to_string(),
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field append.
    pub fn with_field(mut self, field: EventField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&EventField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `system:event`
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.system, self.name)
    }
}

// =============================================================================
// Event Files
// =============================================================================

/// Per-instance state of one event.
pub struct EventFile {
    call: EventCall,
    flags: AtomicU32,
    /// Soft-mode users.
    sm_ref: AtomicI32,
    /// Attached triggers.
    tm_ref: AtomicI32,
    triggers: RwLock<Arc<Vec<Arc<TriggerData>>>>,
    update_lock: Mutex<()>,
}

impl EventFile {
    pub fn new(call: EventCall) -> Self {
        Self {
            call,
            flags: AtomicU32::new(0),
            sm_ref: AtomicI32::new(0),
            tm_ref: AtomicI32::new(0),
            triggers: RwLock::new(Arc::new(Vec::new())),
            update_lock: Mutex::new(()),
        }
    }

    pub fn call(&self) -> &EventCall {
        &self.call
    }

    /// `system:event`
    pub fn name(&self) -> String {
        self.call.full_name()
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn is_enabled(&self) -> bool {
        self.has_flag(flags::ENABLED)
    }

    pub fn is_soft_disabled(&self) -> bool {
        self.has_flag(flags::SOFT_DISABLED)
    }

    /// Number of attached triggers holding trigger mode.
    pub fn trigger_mode_refs(&self) -> i32 {
        self.tm_ref.load(Ordering::Acquire)
    }

    /// Number of soft-mode users.
    pub fn soft_mode_refs(&self) -> i32 {
        self.sm_ref.load(Ordering::Acquire)
    }

    /// Snapshot of the attached triggers, most recently added first.
    pub fn triggers(&self) -> Arc<Vec<Arc<TriggerData>>> {
        self.triggers.read().clone()
    }

    /// Copy, modify and republish the trigger list.
    ///
    /// Local interrupts are off while the list is swapped, so an event
    /// firing on this CPU never spins on the write lock.
    pub(crate) fn update_triggers<R>(
        &self,
        ops: &dyn TraceOps,
        f: impl FnOnce(&mut Vec<Arc<TriggerData>>) -> R,
    ) -> R {
        let _guard = self.update_lock.lock();
        let mut next = Vec::clone(&self.triggers.read());
        let ret = f(&mut next);
        let next = Arc::new(next);
        let old = {
            let _irq = IrqGuard::new(ops);
            core::mem::replace(&mut *self.triggers.write(), next)
        };
        drop(old);
        ret
    }

    /// Enable or disable the event.
    ///
    /// Soft users are reference counted: the event stays registered while
    /// any soft user remains, and records are discarded (soft-disabled)
    /// unless the event was also enabled directly.
    pub fn enable_disable(&self, enable: bool, soft: bool) {
        if enable {
            if !soft {
                self.clear_flag(flags::SOFT_DISABLED);
            } else {
                if self.sm_ref.fetch_add(1, Ordering::AcqRel) + 1 > 1 {
                    return;
                }
                self.set_flag(flags::SOFT_MODE);
            }

            if !self.is_enabled() {
                if soft {
                    self.set_flag(flags::SOFT_DISABLED);
                }
                self.set_flag(flags::ENABLED);
                debug!("Enabled event {}", self.name());
            }
            return;
        }

        if !self.is_enabled() {
            return;
        }
        let disable = if soft {
            if self.sm_ref.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                return;
            }
            let was_soft_disabled = self.is_soft_disabled();
            self.clear_flag(flags::SOFT_MODE);
            was_soft_disabled
        } else {
            !self.has_flag(flags::SOFT_MODE)
        };

        if disable {
            self.clear_flag(flags::ENABLED);
            debug!("Disabled event {}", self.name());
        }
        if self.has_flag(flags::SOFT_MODE) {
            self.set_flag(flags::SOFT_DISABLED);
        } else {
            self.clear_flag(flags::SOFT_DISABLED);
        }
    }

    /// Account for a trigger being attached or detached.
    ///
    /// The first trigger puts the event in trigger mode and soft-enables it;
    /// the last one takes both back.
    pub fn trigger_enable_disable(&self, enable: bool) {
        if enable {
            if self.tm_ref.fetch_add(1, Ordering::AcqRel) + 1 > 1 {
                return;
            }
            self.set_flag(flags::TRIGGER_MODE);
            self.enable_disable(true, true);
        } else {
            if self.tm_ref.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                return;
            }
            self.clear_flag(flags::TRIGGER_MODE);
            self.enable_disable(false, true);
        }
    }

    /// Recompute [`flags::TRIGGER_COND`] from the attached triggers.
    pub fn update_cond_flag(&self) {
        let cond = self
            .triggers()
            .iter()
            .any(|t| t.has_filter() || t.post_trigger());
        if cond {
            self.set_flag(flags::TRIGGER_COND);
        } else {
            self.clear_flag(flags::TRIGGER_COND);
        }
    }

    /// Run the attached triggers.
    ///
    /// Without a record every trigger runs unconditionally. With a record,
    /// filtered triggers run only on a match and post triggers are deferred:
    /// their types are returned for [`EventFile::event_triggers_post_call`].
    pub fn event_triggers_call(&self, rec: Option<&[u8]>) -> TriggerType {
        let mut tt = TriggerType::NONE;
        for data in self.triggers().iter() {
            let Some(rec) = rec else {
                data.ops().func(data, None);
                continue;
            };
            if !data.matches(rec) {
                continue;
            }
            if data.post_trigger() {
                tt |= data.trigger_type();
                continue;
            }
            data.ops().func(data, Some(rec));
        }
        tt
    }

    /// Run deferred triggers whose type is in `tt`, after the record was committed.
    pub fn event_triggers_post_call(&self, tt: TriggerType, rec: &[u8]) {
        for data in self.triggers().iter() {
            if tt.intersects(data.trigger_type()) {
                data.ops().func(data, Some(rec));
            }
        }
    }

    /// Emit one record for this event.
    ///
    /// `commit` writes the record to the trace buffer and is skipped while
    /// the event is soft-disabled. Returns whether the record was committed.
    pub fn trace(&self, rec: &[u8], commit: impl FnOnce(&[u8])) -> bool {
        let f = self.flags();
        if f & flags::ENABLED == 0 {
            return false;
        }

        if f & flags::TRIGGER_COND == 0 {
            if f & flags::TRIGGER_MODE != 0 {
                self.event_triggers_call(None);
            }
            if f & flags::SOFT_DISABLED != 0 {
                return false;
            }
        }

        let tt = if f & flags::TRIGGER_COND != 0 {
            self.event_triggers_call(Some(rec))
        } else {
            TriggerType::NONE
        };

        let committed = !self.is_soft_disabled();
        if committed {
            commit(rec);
        }
        if !tt.is_empty() {
            self.event_triggers_post_call(tt, rec);
        }
        committed
    }
}

impl core::fmt::Debug for EventFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventFile")
            .field("event", &self.name())
            .field("flags", &self.flags())
            .field("triggers", &self.triggers().len())
            .finish()
    }
}

// =============================================================================
// Trace Array
// =============================================================================

/// The set of event files of one trace instance, keyed by `system:event`.
pub struct TraceArray {
    events: RwLock<HashMap<String, Arc<EventFile>, FnvBuildHasher>>,
}

impl TraceArray {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::with_hasher(FnvBuildHasher::default())),
        }
    }

    /// Add an event, returning the existing file if the name is taken.
    pub fn add_event(&self, call: EventCall) -> Arc<EventFile> {
        let name = call.full_name();
        let mut events = self.events.write();
        events
            .entry(name)
            .or_insert_with(|| Arc::new(EventFile::new(call)))
            .clone()
    }

    pub fn find_event_file(&self, system: &str, event: &str) -> Option<Arc<EventFile>> {
        self.find(&format!("{system}:{event}"))
    }

    /// Look up by `system:event`.
    pub fn find(&self, name: &str) -> Option<Arc<EventFile>> {
        self.events.read().get(name).cloned()
    }

    pub fn event_files(&self) -> Vec<Arc<EventFile>> {
        self.events.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach and free every trigger of every event.
    pub fn clear_event_triggers(&self, ops: &dyn TraceOps) {
        for file in self.event_files() {
            let removed = file.update_triggers(ops, core::mem::take);
            for data in removed.iter() {
                file.trigger_enable_disable(false);
                data.ops().free(data);
            }
            file.update_cond_flag();
        }
    }
}

impl Default for TraceArray {
    fn default() -> Self {
        Self::new()
    }
}
