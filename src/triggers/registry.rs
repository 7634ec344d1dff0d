//! Trigger command registry.
//!
//! Maps command names to their [`EventCommand`] implementations, in
//! registration order.

use alloc::sync::Arc;
use alloc::string::ToString;
use alloc::vec::Vec;
use spin::Mutex;

use super::Error;
use super::command::EventCommand;

pub struct TriggerCommands {
    commands: Mutex<Vec<Arc<dyn EventCommand>>>,
}

impl TriggerCommands {
    pub const fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Register a command. Names must be unique.
    pub fn register(&self, cmd: Arc<dyn EventCommand>) -> Result<(), Error> {
        let mut commands = self.commands.lock();
        if commands.iter().any(|c| c.name() == cmd.name()) {
            return Err(Error::Busy(cmd.name().to_string()));
        }
        debug!("Registered trigger command '{}'", cmd.name());
        commands.push(cmd);
        Ok(())
    }

    /// Remove a command by name.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn EventCommand>, Error> {
        let mut commands = self.commands.lock();
        let pos = commands
            .iter()
            .position(|c| c.name() == name)
            .ok_or(Error::NotFound)?;
        debug!("Unregistered trigger command '{}'", name);
        Ok(commands.remove(pos))
    }

    /// Get a command by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn EventCommand>> {
        self.commands
            .lock()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// List all command names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.commands.lock().iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TriggerCommands {
    fn default() -> Self {
        Self::new()
    }
}
