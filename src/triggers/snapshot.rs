//! `snapshot`: take a snapshot of the trace buffer.

use alloc::sync::Arc;
use core::fmt;

use super::Error;
use super::command::{EventCommand, register_trigger, unregister_trigger};
use super::data::{TriggerData, TriggerOps, TriggerType, event_trigger_print};
use crate::event::EventFile;
use crate::trace_ops::TraceOps;
use crate::tracer::Tracer;

pub struct SnapshotCommand;

impl EventCommand for SnapshotCommand {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn trigger_type(&self) -> TriggerType {
        TriggerType::SNAPSHOT
    }

    /// The snapshot buffer is allocated on first use; without it the
    /// trigger is taken off again.
    fn reg(&self, tracer: &Tracer, file: &EventFile, data: &Arc<TriggerData>) -> Result<(), Error> {
        register_trigger(tracer, file, data)?;
        if !tracer.ops().alloc_snapshot() {
            warn!("Snapshot buffer unavailable, dropping snapshot trigger on {}", file.name());
            unregister_trigger(tracer, file, data);
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn trigger_ops(&self, tracer: &Tracer, _cmd: &str) -> Option<Arc<dyn TriggerOps>> {
        Some(Arc::new(SnapshotTrigger {
            ops: tracer.ops().clone(),
        }))
    }
}

struct SnapshotTrigger {
    ops: Arc<dyn TraceOps>,
}

impl TriggerOps for SnapshotTrigger {
    fn func(&self, data: &TriggerData, _rec: Option<&[u8]>) {
        if data.try_consume() {
            self.ops.snapshot();
        }
    }

    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result {
        event_trigger_print(out, "snapshot", data)
    }
}
