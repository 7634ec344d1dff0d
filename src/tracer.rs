//! The trace instance: events, trigger commands and the trigger file interface.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt::Write;

use spin::Mutex;

use crate::config::TriggerConfig;
#[cfg(feature = "early-hashtriggers")]
use crate::early::EarlyHashTriggers;
use crate::event::{EventCall, EventFile, TraceArray};
use crate::hashtable::BootArena;
use crate::trace_ops::TraceOps;
use crate::triggers::{self, Error, TRIGGER_WRITE_MAX, TriggerCommands, strsep};

/// Owns everything triggers act on. Constructed once at boot and passed
/// by reference to every parse and dispatch path.
pub struct Tracer {
    ops: Arc<dyn TraceOps>,
    config: TriggerConfig,
    commands: TriggerCommands,
    events: TraceArray,
    #[cfg(feature = "early-hashtriggers")]
    early: EarlyHashTriggers,
    /// Serializes trigger file writes.
    event_mutex: Mutex<()>,
}

impl Tracer {
    /// Create a tracer with the built-in commands registered and the
    /// configured boot-time hash triggers set up.
    pub fn new(ops: Arc<dyn TraceOps>, config: TriggerConfig) -> Result<Self, Error> {
        Self::build(ops, config, None)
    }

    /// Like [`Tracer::new`], with boot-time tables carved from `arena`
    /// instead of a region reserved from the heap.
    #[cfg(feature = "early-hashtriggers")]
    pub fn with_boot_arena(
        ops: Arc<dyn TraceOps>,
        config: TriggerConfig,
        arena: BootArena,
    ) -> Result<Self, Error> {
        Self::build(ops, config, Some(arena))
    }

    fn build(
        ops: Arc<dyn TraceOps>,
        config: TriggerConfig,
        arena: Option<BootArena>,
    ) -> Result<Self, Error> {
        config.validate()?;
        #[cfg(not(feature = "early-hashtriggers"))]
        let _ = arena;

        let commands = TriggerCommands::new();
        triggers::register_trigger_cmds(&commands)?;

        let tracer = Self {
            ops,
            #[cfg(feature = "early-hashtriggers")]
            early: match arena {
                Some(arena) => EarlyHashTriggers::with_arena(&config, arena),
                None => EarlyHashTriggers::new(&config),
            },
            config,
            commands,
            events: TraceArray::new(),
            event_mutex: Mutex::new(()),
        };

        #[cfg(feature = "early-hashtriggers")]
        if let Some(spec) = &tracer.config.early_hashtriggers {
            // Invalid entries are logged by setup and skipped.
            if let Ok(n) = tracer.early.setup(spec) {
                info!("{} boot-time hash trigger(s) active", n);
            }
        }

        Ok(tracer)
    }

    pub fn ops(&self) -> &Arc<dyn TraceOps> {
        &self.ops
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn commands(&self) -> &TriggerCommands {
        &self.commands
    }

    pub fn events(&self) -> &TraceArray {
        &self.events
    }

    #[cfg(feature = "early-hashtriggers")]
    pub fn early(&self) -> &EarlyHashTriggers {
        &self.early
    }

    /// Add an event source; returns the existing one if already added.
    pub fn add_event(&self, call: EventCall) -> Arc<EventFile> {
        self.events.add_event(call)
    }

    /// Look up an event by `system:event`.
    pub fn event(&self, name: &str) -> Result<Arc<EventFile>, Error> {
        let (system, event) = parse_event_name(name)?;
        self.events
            .find_event_file(system, event)
            .ok_or_else(|| Error::NoSuchEvent(name.into()))
    }

    /// Run one trigger command against `file`.
    ///
    /// The first token (up to `:`, space or tab) names the command, with an
    /// optional `!` prefix to remove instead of add.
    pub fn process_trigger(&self, file: &Arc<EventFile>, buff: &str) -> Result<(), Error> {
        let _guard = self.event_mutex.lock();
        let (command, next) = strsep(buff, ": \t");
        let name = command.strip_prefix('!').unwrap_or(command);
        let cmd = self
            .commands
            .find(name)
            .ok_or_else(|| Error::InvalidCommand(name.into()))?;
        cmd.parse(self, file, buff, name, next)
    }

    /// Write `buf` to the trigger file of `event`.
    ///
    /// Returns the number of bytes consumed: all of them on success, 0 for
    /// a blank write.
    pub fn write_trigger(&self, event: &str, buf: &str) -> Result<usize, Error> {
        if buf.len() >= TRIGGER_WRITE_MAX {
            return Err(Error::TooLong(buf.len()));
        }
        let file = self.event(event)?;
        let cmd = buf.trim();
        if cmd.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.process_trigger(&file, cmd) {
            debug!("Trigger write '{}' on {} failed: {}", cmd, event, e);
            return Err(e);
        }
        Ok(buf.len())
    }

    /// Contents of the trigger file of `event`.
    ///
    /// Lists the available commands while no trigger is attached.
    pub fn show_triggers(&self, event: &str) -> Result<String, Error> {
        let file = self.event(event)?;
        let mut out = String::new();
        let attached = file.triggers();
        if attached.is_empty() {
            out.push_str("# Available triggers:\n#");
            for name in self.commands.names() {
                out.push(' ');
                out.push_str(name);
            }
            out.push('\n');
            return Ok(out);
        }
        for data in attached.iter() {
            // Writing into a String cannot fail.
            let _ = data.ops().print(&mut out as &mut dyn Write, data);
        }
        Ok(out)
    }

    /// Emit one record for `event`, see [`EventFile::trace`].
    pub fn trace(&self, file: &EventFile, rec: &[u8], commit: impl FnOnce(&[u8])) -> bool {
        file.trace(rec, commit)
    }

    /// Detach every trigger from every event.
    pub fn clear_event_triggers(&self) {
        let _guard = self.event_mutex.lock();
        self.events.clear_event_triggers(&*self.ops);
    }
}

/// Split `system:event`.
fn parse_event_name(name: &str) -> Result<(&str, &str), Error> {
    match name.split_once(':') {
        Some((system, event)) if !system.is_empty() && !event.is_empty() => Ok((system, event)),
        _ => Err(Error::NoSuchEvent(name.into())),
    }
}
