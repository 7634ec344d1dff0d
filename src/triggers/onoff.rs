//! `traceon` and `traceoff`: switch the trace buffer on or off.

use alloc::sync::Arc;
use core::fmt;

use super::command::EventCommand;
use super::data::{TriggerData, TriggerOps, TriggerType, event_trigger_print};
use crate::trace_ops::TraceOps;
use crate::tracer::Tracer;

pub struct TraceOnOffCommand {
    on: bool,
}

impl TraceOnOffCommand {
    pub const fn traceon() -> Self {
        Self { on: true }
    }

    pub const fn traceoff() -> Self {
        Self { on: false }
    }
}

impl EventCommand for TraceOnOffCommand {
    fn name(&self) -> &'static str {
        if self.on { "traceon" } else { "traceoff" }
    }

    fn trigger_type(&self) -> TriggerType {
        TriggerType::TRACE_ONOFF
    }

    fn trigger_ops(&self, tracer: &Tracer, _cmd: &str) -> Option<Arc<dyn TriggerOps>> {
        Some(Arc::new(TraceOnOffTrigger {
            ops: tracer.ops().clone(),
            on: self.on,
        }))
    }
}

struct TraceOnOffTrigger {
    ops: Arc<dyn TraceOps>,
    on: bool,
}

impl TriggerOps for TraceOnOffTrigger {
    fn func(&self, data: &TriggerData, _rec: Option<&[u8]>) {
        // Already in the wanted state: don't use up a count.
        if self.ops.tracing_is_on() == self.on {
            return;
        }
        if !data.try_consume() {
            return;
        }
        if self.on {
            self.ops.tracing_on();
        } else {
            self.ops.tracing_off();
        }
    }

    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result {
        event_trigger_print(out, if self.on { "traceon" } else { "traceoff" }, data)
    }
}
