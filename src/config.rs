//! Tunables of the trigger engine.

use alloc::string::{String, ToString};

use crate::hashtable::{self, HASH_BITS_MAX, HASH_TRIGGER_BITS};

/// Kernel command line parameter holding boot-time hash triggers.
pub const CMDLINE_PARAM: &str = "trace_event_hashtriggers";

/// Table size of boot-time hash triggers.
pub const EARLY_HASH_BITS: u32 = 12;

/// Boot arena budget, enough for one boot-time table.
pub const EARLY_ARENA_BYTES: usize = 2 * 2_621_440;

/// Maximum number of boot-time hash triggers.
pub const EARLY_HASHTRIGGERS_MAX: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Table size of `hash` triggers, in bits.
    pub hash_bits: u32,
    /// Table size of boot-time hash triggers, in bits.
    pub early_hash_bits: u32,
    pub early_arena_bytes: usize,
    pub max_early_triggers: usize,
    /// `;`-separated boot-time hash triggers.
    pub early_hashtriggers: Option<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            hash_bits: HASH_TRIGGER_BITS,
            early_hash_bits: EARLY_HASH_BITS,
            early_arena_bytes: EARLY_ARENA_BYTES,
            max_early_triggers: EARLY_HASHTRIGGERS_MAX,
            early_hashtriggers: None,
        }
    }
}

impl TriggerConfig {
    /// Defaults plus the boot-time triggers found on `cmdline`.
    ///
    /// The last occurrence of the parameter wins.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let early_hashtriggers = cmdline
            .split_whitespace()
            .filter_map(|arg| arg.split_once('='))
            .filter(|(key, _)| *key == CMDLINE_PARAM)
            .map(|(_, value)| value.to_string())
            .last();
        Self {
            early_hashtriggers,
            ..Self::default()
        }
    }

    /// Check table sizes.
    pub fn validate(&self) -> Result<(), hashtable::Error> {
        for bits in [self.hash_bits, self.early_hash_bits] {
            if bits == 0 || bits > HASH_BITS_MAX {
                return Err(hashtable::Error::InvalidBits(bits));
            }
        }
        Ok(())
    }
}
