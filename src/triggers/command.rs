//! Trigger commands and the generic parse/register machinery they share.

use alloc::string::ToString;
use alloc::sync::Arc;

use super::Error;
use super::data::{TriggerData, TriggerFilter, TriggerOps, TriggerType};
use crate::event::EventFile;
use crate::tracer::Tracer;

/// A named trigger command, e.g. `traceon` or `hash`.
pub trait EventCommand: Send + Sync {
    fn name(&self) -> &'static str;

    fn trigger_type(&self) -> TriggerType;

    /// Post triggers run after the record is committed.
    fn post_trigger(&self) -> bool {
        false
    }

    /// Parse `param` and attach (or, for a `!`-prefixed `glob`, detach) a
    /// trigger on `file`.
    fn parse(
        &self,
        tracer: &Tracer,
        file: &Arc<EventFile>,
        glob: &str,
        cmd: &str,
        param: Option<&str>,
    ) -> Result<(), Error> {
        event_trigger_callback(self, tracer, file, glob, cmd, param)
    }

    /// Attach `data` to `file`.
    fn reg(&self, tracer: &Tracer, file: &EventFile, data: &Arc<TriggerData>) -> Result<(), Error> {
        register_trigger(tracer, file, data)
    }

    /// Detach the trigger matching `test` from `file`.
    fn unreg(&self, tracer: &Tracer, file: &EventFile, test: &TriggerData) {
        unregister_trigger(tracer, file, test);
    }

    /// Instance behaviour for `cmd`. Commands with their own `parse` may
    /// leave this unimplemented.
    fn trigger_ops(&self, tracer: &Tracer, cmd: &str) -> Option<Arc<dyn TriggerOps>> {
        let _ = (tracer, cmd);
        None
    }

    /// Attach `filter` (`if <expr>`) to `data`, or clear it with `None`.
    fn set_filter(
        &self,
        tracer: &Tracer,
        filter: Option<&str>,
        data: &TriggerData,
        file: &EventFile,
    ) -> Result<(), Error> {
        set_trigger_filter(tracer, filter, data, file)
    }
}

/// Split `s` at the first of `delims`, like C `strsep`.
///
/// Returns the token and the remainder after the delimiter, `None` if no
/// delimiter was found.
pub fn strsep<'a>(s: &'a str, delims: &str) -> (&'a str, Option<&'a str>) {
    match s.find(|c| delims.contains(c)) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    }
}

/// Parse an unsigned count with C base-0 rules: `0x` hex, leading `0` octal.
pub fn parse_count(s: &str) -> Result<i64, Error> {
    let invalid = || Error::InvalidArgument(s.to_string());
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    let n = u64::from_str_radix(digits, radix).map_err(|_| invalid())?;
    i64::try_from(n).map_err(|_| invalid())
}

/// Attach `data` to `file`.
///
/// At most one trigger of each type may be attached to an event.
pub fn register_trigger(
    tracer: &Tracer,
    file: &EventFile,
    data: &Arc<TriggerData>,
) -> Result<(), Error> {
    file.update_triggers(&**tracer.ops(), |list| {
        if list.iter().any(|t| t.trigger_type() == data.trigger_type()) {
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

/// Detach the first trigger of the same type as `test`. No-op if none.
pub fn unregister_trigger(tracer: &Tracer, file: &EventFile, test: &TriggerData) {
    let removed = file.update_triggers(&**tracer.ops(), |list| {
        let pos = list
            .iter()
            .position(|t| t.trigger_type() == test.trigger_type())?;
        Some(list.remove(pos))
    });

    if let Some(data) = removed {
        file.update_cond_flag();
        file.trigger_enable_disable(false);
        data.ops().free(&data);
        debug!("Unregistered {} trigger from {}", data.name(), file.name());
    }
}

/// Compile `if <expr>` into a filter on `data`; `None` clears it.
pub fn set_trigger_filter(
    tracer: &Tracer,
    filter: Option<&str>,
    data: &TriggerData,
    file: &EventFile,
) -> Result<(), Error> {
    let Some(filter) = filter else {
        data.set_filter(None);
        return Ok(());
    };

    let (word, expr) = strsep(filter, " \t");
    let expr = match (word, expr) {
        ("if", Some(expr)) if !expr.trim().is_empty() => expr.trim(),
        _ => return Err(Error::InvalidArgument(filter.to_string())),
    };

    let compiled = tracer.ops().compile_filter(file.call(), expr)?;
    data.set_filter(Some(TriggerFilter {
        filter: compiled,
        expr: expr.to_string(),
    }));
    Ok(())
}

/// Generic `cmd[:count] [if filter]` handling shared by the simple commands.
pub fn event_trigger_callback<C: EventCommand + ?Sized>(
    cmd_ops: &C,
    tracer: &Tracer,
    file: &Arc<EventFile>,
    glob: &str,
    cmd: &str,
    param: Option<&str>,
) -> Result<(), Error> {
    let mut param = param;
    let mut count = None;
    if let Some(p) = param.filter(|p| p.starts_with(|c: char| c.is_ascii_digit())) {
        let (token, rest) = strsep(p, " \t");
        count = Some(token);
        param = rest;
    }

    let ops = cmd_ops
        .trigger_ops(tracer, cmd)
        .ok_or_else(|| Error::InvalidCommand(cmd.to_string()))?;
    let data = Arc::new(TriggerData::new(cmd_ops, ops));

    if glob.starts_with('!') {
        cmd_ops.unreg(tracer, file, &data);
        return Ok(());
    }

    if let Some(token) = count {
        let (number, _) = strsep(token, ":");
        data.set_count(parse_count(number)?);
    }

    if param.is_some() {
        cmd_ops.set_filter(tracer, param, &data, file)?;
    }

    if let Err(e) = cmd_ops.reg(tracer, file, &data) {
        let _ = cmd_ops.set_filter(tracer, None, &data, file);
        return Err(e);
    }
    Ok(())
}
