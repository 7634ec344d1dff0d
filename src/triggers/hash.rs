//! `hash`: aggregate event hits into a [`HashTable`].
//!
//! Parameter format is `keys:vals[:sort=...] [if filter]`. Counts are not
//! accepted. The table is filled after the record is committed and its
//! report is printed with the trigger listing.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::fmt;

use super::Error;
use super::command::{EventCommand, strsep};
use super::data::{TriggerData, TriggerOps, TriggerType, event_trigger_print};
use crate::event::EventFile;
use crate::hashtable::{HashTable, HeapStorage, report};
use crate::trace_ops::TraceOps;
use crate::tracer::Tracer;

pub struct HashCommand;

impl EventCommand for HashCommand {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn trigger_type(&self) -> TriggerType {
        TriggerType::EVENT_HASH
    }

    fn post_trigger(&self) -> bool {
        true
    }

    fn parse(
        &self,
        tracer: &Tracer,
        file: &Arc<EventFile>,
        glob: &str,
        cmd: &str,
        param: Option<&str>,
    ) -> Result<(), Error> {
        if glob.starts_with('!') {
            let test = TriggerData::new(self, Arc::new(RemovalKey));
            self.unreg(tracer, file, &test);
            return Ok(());
        }

        let param = param.ok_or_else(|| Error::InvalidArgument(cmd.to_string()))?;
        let (trigger, filter) = strsep(param, " \t");

        let (keys, rest) = strsep(trigger, ":");
        let rest = rest.ok_or_else(|| Error::InvalidArgument(trigger.to_string()))?;
        let (vals, rest) = strsep(rest, ":");
        let (sort, rest) = match rest {
            Some(rest) => {
                let (sort, rest) = strsep(rest, ":");
                (Some(sort), rest)
            }
            None => (None, None),
        };
        if rest.is_some() {
            return Err(Error::InvalidArgument(trigger.to_string()));
        }

        let table = HashTable::create(
            tracer.config().hash_bits,
            keys,
            vals,
            sort,
            Some(file.call()),
            &HeapStorage,
        )?;

        let event_name = file.name();
        #[cfg(feature = "early-hashtriggers")]
        let early = tracer.early().table(&event_name);
        #[cfg(not(feature = "early-hashtriggers"))]
        let early = None;

        let ops = Arc::new(HashTrigger {
            table: Arc::new(table),
            early,
            event_name,
            ops: tracer.ops().clone(),
        });
        let data = Arc::new(TriggerData::new(self, ops));

        if filter.is_some() {
            self.set_filter(tracer, filter, &data, file)?;
        }

        if let Err(e) = self.reg(tracer, file, &data) {
            let _ = self.set_filter(tracer, None, &data, file);
            return Err(e);
        }

        // The live trigger takes over from any boot-time one.
        #[cfg(feature = "early-hashtriggers")]
        tracer.early().disable(&file.name());
        Ok(())
    }
}

/// Stand-in ops for building the lookup key of `!hash`.
struct RemovalKey;

impl TriggerOps for RemovalKey {
    fn func(&self, _data: &TriggerData, _rec: Option<&[u8]>) {}

    fn print(&self, _out: &mut dyn fmt::Write, _data: &TriggerData) -> fmt::Result {
        Ok(())
    }
}

struct HashTrigger {
    table: Arc<HashTable>,
    /// Boot-time table for the same event, reported alongside.
    early: Option<Arc<HashTable>>,
    event_name: String,
    ops: Arc<dyn TraceOps>,
}

impl TriggerOps for HashTrigger {
    fn func(&self, _data: &TriggerData, rec: Option<&[u8]>) {
        if let Some(rec) = rec {
            self.table.hit(&*self.ops, rec);
        }
    }

    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result {
        event_trigger_print(out, "hash", data)?;
        if let Some(early) = &self.early {
            writeln!(out, "Early {} events:", self.event_name)?;
            report::print_table(out, early, &*self.ops)?;
        }
        report::print_table(out, &self.table, &*self.ops)
    }

    fn hash_table(&self) -> Option<&Arc<HashTable>> {
        Some(&self.table)
    }
}
