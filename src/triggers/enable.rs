//! `enable_event` and `disable_event`: soft-enable or soft-disable another
//! event when this one fires.
//!
//! Parameter format is `system:event[:count]`. The target event is put in
//! soft mode for as long as the trigger exists, so switching it only flips
//! its soft-disabled flag.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use core::fmt;

use super::Error;
use super::command::{EventCommand, parse_count, strsep};
use super::data::{TriggerData, TriggerOps, TriggerType, event_trigger_print, trigger_data_free};
use crate::event::{EventFile, flags};
use crate::tracer::Tracer;

pub const ENABLE_EVENT_STR: &str = "enable_event";
pub const DISABLE_EVENT_STR: &str = "disable_event";

pub struct EnableCommand {
    enable: bool,
}

impl EnableCommand {
    pub const fn enable() -> Self {
        Self { enable: true }
    }

    pub const fn disable() -> Self {
        Self { enable: false }
    }
}

fn same_target(a: &TriggerData, b: &TriggerData) -> bool {
    match (a.ops().enable_target(), b.ops().enable_target()) {
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

impl EventCommand for EnableCommand {
    fn name(&self) -> &'static str {
        if self.enable { ENABLE_EVENT_STR } else { DISABLE_EVENT_STR }
    }

    fn trigger_type(&self) -> TriggerType {
        TriggerType::EVENT_ENABLE
    }

    fn parse(
        &self,
        tracer: &Tracer,
        file: &Arc<EventFile>,
        glob: &str,
        cmd: &str,
        param: Option<&str>,
    ) -> Result<(), Error> {
        let param = param.ok_or_else(|| Error::InvalidArgument(cmd.to_string()))?;
        let (trigger, filter) = strsep(param, " \t");

        let (system, rest) = strsep(trigger, ":");
        let rest = rest.ok_or_else(|| Error::InvalidArgument(trigger.to_string()))?;
        let (event, count) = strsep(rest, ":");

        let target = tracer
            .events()
            .find_event_file(system, event)
            .ok_or_else(|| Error::NoSuchEvent(format!("{system}:{event}")))?;

        let ops = Arc::new(EventEnableTrigger {
            target: target.clone(),
            enable: self.enable,
        });
        let data = Arc::new(TriggerData::new(self, ops));

        if glob.starts_with('!') {
            self.unreg(tracer, file, &data);
            return Ok(());
        }

        if let Some(count) = count {
            if count.is_empty() {
                return Err(Error::InvalidArgument(trigger.to_string()));
            }
            data.set_count(parse_count(count)?);
        }

        if filter.is_some() {
            self.set_filter(tracer, filter, &data, file)?;
        }

        // Keep the target registered (soft mode) while the trigger exists.
        target.enable_disable(true, true);
        if let Err(e) = self.reg(tracer, file, &data) {
            target.enable_disable(false, true);
            let _ = self.set_filter(tracer, None, &data, file);
            return Err(e);
        }
        Ok(())
    }

    /// One enable or disable trigger per target event.
    fn reg(&self, tracer: &Tracer, file: &EventFile, data: &Arc<TriggerData>) -> Result<(), Error> {
        file.update_triggers(&**tracer.ops(), |list| {
            if list.iter().any(|t| same_target(t, data)) {
                return Err(Error::AlreadyExists);
            }
            data.ops().init(data)?;
            list.insert(0, data.clone());
            Ok(())
        })?;

        file.trigger_enable_disable(true);
        file.update_cond_flag();
        debug!("Registered {} trigger on {}", data.name(), file.name());
        Ok(())
    }

    fn unreg(&self, tracer: &Tracer, file: &EventFile, test: &TriggerData) {
        let removed = file.update_triggers(&**tracer.ops(), |list| {
            let pos = list.iter().position(|t| same_target(t, test))?;
            Some(list.remove(pos))
        });

        if let Some(data) = removed {
            file.update_cond_flag();
            file.trigger_enable_disable(false);
            data.ops().free(&data);
        }
    }
}

struct EventEnableTrigger {
    target: Arc<EventFile>,
    enable: bool,
}

impl EventEnableTrigger {
    fn switch(&self) {
        if self.enable {
            self.target.clear_flag(flags::SOFT_DISABLED);
        } else {
            self.target.set_flag(flags::SOFT_DISABLED);
        }
    }
}

impl TriggerOps for EventEnableTrigger {
    fn func(&self, data: &TriggerData, _rec: Option<&[u8]>) {
        if data.is_counted() {
            if data.count() == 0 {
                return;
            }
            // Skip if the target is already in the wanted state.
            if self.enable != self.target.is_soft_disabled() {
                return;
            }
            if !data.try_consume() {
                return;
            }
        }
        self.switch();
    }

    fn print(&self, out: &mut dyn fmt::Write, data: &TriggerData) -> fmt::Result {
        let call = self.target.call();
        let name = format!(
            "{}:{}:{}",
            if self.enable { ENABLE_EVENT_STR } else { DISABLE_EVENT_STR },
            call.system,
            call.name
        );
        event_trigger_print(out, &name, data)
    }

    fn free(&self, data: &TriggerData) {
        if data.put() {
            self.target.enable_disable(false, true);
            trigger_data_free(data);
        }
    }

    fn enable_target(&self) -> Option<&Arc<EventFile>> {
        Some(&self.target)
    }
}
