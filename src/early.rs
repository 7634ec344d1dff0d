//! Boot-time hash triggers.
//!
//! Allocation events fire long before trigger files can be written. Hash
//! triggers given on the kernel command line,
//!
//! ```text
//! trace_event_hashtriggers=kmem:kmalloc:hash:stacktrace:bytes_req.override,bytes_alloc.override
//! ```
//!
//! are set up against a fixed [`BootArena`] and fed directly by the
//! allocator hooks below. Without an event description their keys must be
//! `stacktrace` and their values `hitcount` or `.override` values supplied
//! by the hook. Once a live `hash` trigger is attached to the same event,
//! the boot-time one stops recording and its table is printed ahead of the
//! live one.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;

use crate::config::TriggerConfig;
use crate::hashtable::{BootArena, HashTable};
use crate::trace_ops::TraceOps;
use crate::triggers::{Error, strsep};

pub struct EarlyHashTrigger {
    event_name: String,
    table: Arc<HashTable>,
    enabled: AtomicBool,
}

impl EarlyHashTrigger {
    /// `system:event`
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn table(&self) -> &Arc<HashTable> {
        &self.table
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// The boot-time triggers and the arena backing their tables.
pub struct EarlyHashTriggers {
    arena: BootArena,
    bits: u32,
    max: usize,
    triggers: RwLock<Vec<Arc<EarlyHashTrigger>>>,
}

impl EarlyHashTriggers {
    /// Reserve a region of `config.early_arena_bytes` for the tables.
    pub fn new(config: &TriggerConfig) -> Self {
        Self::with_arena(config, BootArena::new(config.early_arena_bytes))
    }

    /// Carve the tables out of `arena`, e.g. one over a static buffer.
    pub fn with_arena(config: &TriggerConfig, arena: BootArena) -> Self {
        Self {
            arena,
            bits: config.early_hash_bits,
            max: config.max_early_triggers,
            triggers: RwLock::new(Vec::new()),
        }
    }

    pub fn arena(&self) -> &BootArena {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.triggers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set up `;`-separated boot-time triggers.
    ///
    /// Stops at the first invalid one; triggers before it stay in place.
    /// Returns the number of triggers added.
    pub fn setup(&self, spec: &str) -> Result<usize, Error> {
        let mut added = 0;
        for one in spec.split(';').filter(|s| !s.is_empty()) {
            if let Err(e) = self.setup_one(one) {
                warn!("Invalid boot-time hash trigger '{}': {}", one, e);
                return Err(e);
            }
            added += 1;
        }
        Ok(added)
    }

    /// `subsys:event:hash:keys:vals[:sort]`
    fn setup_one(&self, spec: &str) -> Result<(), Error> {
        if self.len() >= self.max {
            return Err(Error::NoSpace);
        }
        let invalid = || Error::InvalidArgument(spec.to_string());

        // Anything after whitespace would be a filter, which needs an event.
        let (trigger, _) = strsep(spec, " \t");
        let (subsys, rest) = strsep(trigger, ":");
        let (event, rest) = strsep(rest.ok_or_else(invalid)?, ":");
        let (hash, rest) = strsep(rest.ok_or_else(invalid)?, ":");
        if hash != "hash" {
            return Err(Error::InvalidCommand(hash.to_string()));
        }
        let (keys, rest) = strsep(rest.ok_or_else(invalid)?, ":");
        let (vals, rest) = strsep(rest.ok_or_else(invalid)?, ":");
        let sort = rest.map(|r| strsep(r, ":").0);

        let table = HashTable::create(self.bits, keys, vals, sort, None, &self.arena)?;
        let event_name = format!("{subsys}:{event}");
        info!(
            "Boot-time hash trigger on {} ({} of {} arena bytes used)",
            event_name,
            self.arena.used(),
            self.arena.capacity()
        );
        self.triggers.write().push(Arc::new(EarlyHashTrigger {
            event_name,
            table: Arc::new(table),
            enabled: AtomicBool::new(true),
        }));
        Ok(())
    }

    pub fn find(&self, event_name: &str) -> Option<Arc<EarlyHashTrigger>> {
        self.triggers
            .read()
            .iter()
            .find(|t| t.event_name == event_name)
            .cloned()
    }

    /// Table of the boot-time trigger on `event_name`, enabled or not.
    pub fn table(&self, event_name: &str) -> Option<Arc<HashTable>> {
        self.find(event_name).map(|t| t.table.clone())
    }

    /// Table to record into, if a boot-time trigger on `event_name` is still active.
    pub fn early_event_enabled(&self, event_name: &str) -> Option<Arc<HashTable>> {
        self.find(event_name)
            .filter(|t| t.is_enabled())
            .map(|t| t.table.clone())
    }

    /// Stop recording for `event_name`. The table is kept for reports.
    pub fn disable(&self, event_name: &str) {
        if let Some(t) = self.find(event_name) {
            t.enabled.store(false, Ordering::Release);
            debug!("Boot-time hash trigger on {} disabled", event_name);
        }
    }

    /// Record one hit for `event_name`. Returns whether a table took it.
    pub fn record(&self, ops: &dyn TraceOps, event_name: &str, vals: Option<&[u64]>) -> bool {
        match self.early_event_enabled(event_name) {
            Some(table) => {
                table.hit_with_vals(ops, vals);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Allocator hooks
    // =========================================================================

    pub fn early_trace_kmalloc(&self, ops: &dyn TraceOps, bytes_req: usize, bytes_alloc: usize) {
        self.record(ops, "kmem:kmalloc", Some(&[bytes_req as u64, bytes_alloc as u64]));
    }

    pub fn early_trace_kmem_cache_alloc(&self, ops: &dyn TraceOps, bytes_req: usize, bytes_alloc: usize) {
        self.record(
            ops,
            "kmem:kmem_cache_alloc",
            Some(&[bytes_req as u64, bytes_alloc as u64]),
        );
    }

    pub fn early_trace_kmalloc_node(&self, ops: &dyn TraceOps, bytes_req: usize, bytes_alloc: usize) {
        self.record(ops, "kmem:kmalloc_node", Some(&[bytes_req as u64, bytes_alloc as u64]));
    }

    pub fn early_trace_kmem_cache_alloc_node(
        &self,
        ops: &dyn TraceOps,
        bytes_req: usize,
        bytes_alloc: usize,
    ) {
        self.record(
            ops,
            "kmem:kmem_cache_alloc_node",
            Some(&[bytes_req as u64, bytes_alloc as u64]),
        );
    }

    pub fn early_trace_mm_page_alloc(&self, ops: &dyn TraceOps) {
        self.record(ops, "kmem:mm_page_alloc", None);
    }

    pub fn early_trace_mm_page_alloc_extfrag(&self, ops: &dyn TraceOps) {
        self.record(ops, "kmem:mm_page_alloc_extfrag", None);
    }

    pub fn early_trace_mm_page_alloc_zone_locked(&self, ops: &dyn TraceOps) {
        self.record(ops, "kmem:mm_page_alloc_zone_locked", None);
    }
}
