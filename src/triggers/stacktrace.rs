//! `stacktrace`: dump the current stack into the trace buffer.

use alloc::sync::Arc;
use core::fmt;

use super::command::EventCommand;
use super::data::{TriggerData, TriggerOps, TriggerType, event_trigger_print};
use crate::trace_ops::{STACK_SKIP, TraceOps};
use crate::tracer::Tracer;

pub struct StacktraceCommand;

impl EventCommand for StacktraceCommand {
    fn name(&self) -> &'static str {
        "stacktrace"
    }

    fn trigger_type(&self) -> TriggerType {
        TriggerType::STACKTRACE
    }

    // The stack goes after the event's own record.
    fn post_trigger(&self) -> bool {
        true
    }

    fn trigger_ops(&self, tracer: &Tracer, _cmd: &str) -> Option<Arc<dyn TriggerOps>> {
        Some(Arc::new(StacktraceTrigger {
            ops: tracer.ops().clone(),
        }))
    }
}

struct StacktraceTrigger {
    ops: Arc<dyn TraceOps>,
}

impl TriggerOps for StacktraceTrigger {
    fn func(&self, data: &TriggerData, _rec: Option<&[u8]>) {
        if data.try_consume() {
            self.ops.dump_stack(STACK_SKIP);
        }
    }

    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result {
        event_trigger_print(out, "stacktrace", data)
    }
}
