//! Event trigger commands.
//!
//! A trigger is attached to an event by writing a command to the event's
//! trigger interface:
//!
//! ```text
//! traceoff:3 if prev_pid == 0
//! enable_event:sched:sched_wakeup
//! hash:call_site.sym:bytes_alloc:sort=bytes_alloc.descending
//! !traceoff
//! ```
//!
//! Each command ([`EventCommand`]) parses its parameters into a
//! [`TriggerData`] whose [`TriggerOps`] run whenever the event fires.

pub mod command;
pub mod data;
pub mod enable;
pub mod hash;
pub mod onoff;
pub mod registry;
#[cfg(feature = "snapshot")]
pub mod snapshot;
#[cfg(feature = "stacktrace")]
pub mod stacktrace;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use axerrno::AxError;

pub use command::{
    EventCommand, event_trigger_callback, parse_count, register_trigger, set_trigger_filter,
    strsep, unregister_trigger,
};
pub use data::{
    TriggerData, TriggerFilter, TriggerOps, TriggerType, event_trigger_print, trigger_data_free,
};
pub use registry::TriggerCommands;

use crate::hashtable;
use crate::trace_ops::FilterError;

/// Longest command accepted by [`crate::Tracer::write_trigger`].
pub const TRIGGER_WRITE_MAX: usize = 4096;

/// Trigger errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No command with this name is registered.
    InvalidCommand(String),
    /// Malformed command parameters.
    InvalidArgument(String),
    /// A trigger of this type is already attached.
    AlreadyExists,
    /// Command or trigger not found, or registration attached nothing.
    NotFound,
    /// No event with this name.
    NoSuchEvent(String),
    /// A command with this name is already registered.
    Busy(String),
    /// Command written in one piece exceeds [`TRIGGER_WRITE_MAX`].
    TooLong(usize),
    /// Too many boot-time triggers.
    NoSpace,
    Filter(FilterError),
    Table(hashtable::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCommand(name) => write!(f, "Unknown trigger command: {}", name),
            Error::InvalidArgument(arg) => write!(f, "Invalid trigger argument: '{}'", arg),
            Error::AlreadyExists => write!(f, "Trigger already attached"),
            Error::NotFound => write!(f, "Trigger not found"),
            Error::NoSuchEvent(name) => write!(f, "Event not found: {}", name),
            Error::Busy(name) => write!(f, "Trigger command already registered: {}", name),
            Error::TooLong(len) => {
                write!(f, "Trigger command too long: {} bytes (max {})", len, TRIGGER_WRITE_MAX - 1)
            }
            Error::NoSpace => write!(f, "No room for more boot-time triggers"),
            Error::Filter(e) => write!(f, "{}", e),
            Error::Table(e) => write!(f, "{}", e),
        }
    }
}

impl core::error::Error for Error {}

impl From<FilterError> for Error {
    fn from(e: FilterError) -> Self {
        Error::Filter(e)
    }
}

impl From<hashtable::Error> for Error {
    fn from(e: hashtable::Error) -> Self {
        Error::Table(e)
    }
}

impl From<Error> for AxError {
    fn from(e: Error) -> Self {
        match e {
            Error::AlreadyExists => AxError::AlreadyExists,
            Error::NotFound | Error::NoSuchEvent(_) => AxError::NotFound,
            Error::Busy(_) => AxError::ResourceBusy,
            Error::NoSpace | Error::Table(hashtable::Error::NoMemory) => AxError::NoMemory,
            Error::InvalidCommand(_)
            | Error::InvalidArgument(_)
            | Error::TooLong(_)
            | Error::Filter(_)
            | Error::Table(_) => AxError::InvalidInput,
        }
    }
}

/// Register the built-in trigger commands.
pub fn register_trigger_cmds(commands: &TriggerCommands) -> Result<(), Error> {
    commands.register(Arc::new(onoff::TraceOnOffCommand::traceon()))?;
    commands.register(Arc::new(onoff::TraceOnOffCommand::traceoff()))?;
    #[cfg(feature = "snapshot")]
    commands.register(Arc::new(snapshot::SnapshotCommand))?;
    #[cfg(feature = "stacktrace")]
    commands.register(Arc::new(stacktrace::StacktraceCommand))?;
    commands.register(Arc::new(enable::EnableCommand::enable()))?;
    commands.register(Arc::new(enable::EnableCommand::disable()))?;
    commands.register(Arc::new(hash::HashCommand))?;
    Ok(())
}
