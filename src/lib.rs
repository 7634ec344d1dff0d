//! AxVisor trace event triggers
//!
//! Event trigger commands and hash aggregation of trace events for the
//! AxVisor hypervisor.
//!
//! # Features
//!
//! - `snapshot` - `snapshot` trigger command (default)
//! - `stacktrace` - `stacktrace` trigger command (default)
//! - `early-hashtriggers` - boot-time hash triggers from the kernel command line (default)
//!
//! # Quick Start
//!
//! ```ignore
//! use axtrigger::event::{EventCall, EventField, FieldType};
//!
//! // Create the tracer (call once during boot)
//! let tracer = axtrigger::init(ops, TriggerConfig::from_cmdline(cmdline))?;
//!
//! // Describe an event
//! let file = tracer.add_event(
//!     EventCall::new("kmem", "kmalloc")
//!         .with_field(EventField::new("call_site", 8, 8, false, FieldType::Integer))
//!         .with_field(EventField::new("bytes_alloc", 32, 8, false, FieldType::Integer)),
//! );
//!
//! // Attach a trigger
//! tracer.write_trigger("kmem:kmalloc", "hash:call_site.sym:bytes_alloc:sort=bytes_alloc.descending")?;
//!
//! // Feed records from the tracepoint
//! tracer.trace(&file, &rec, |rec| ring_buffer_write(rec));
//!
//! // Read the aggregate back
//! print!("{}", tracer.show_triggers("kmem:kmalloc")?);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

pub mod trace_ops;

// =============================================================================
// Events and Triggers
// =============================================================================

pub mod config;

pub mod event;

pub mod hashtable;

pub mod triggers;

pub mod tracer;

#[cfg(feature = "early-hashtriggers")]
pub mod early;

// Re-export key types for convenience
pub use config::TriggerConfig;
pub use event::{EventCall, EventField, EventFile, FieldType, TraceArray};
pub use hashtable::{Error as HashError, HashTable};
pub use trace_ops::{EventFilter, StackTrace, TaskInfo, TraceOps};
pub use tracer::Tracer;
pub use triggers::{Error as TriggerError, EventCommand, TriggerData, TriggerOps, TriggerType};

#[cfg(feature = "early-hashtriggers")]
pub use early::EarlyHashTriggers;

// =============================================================================
// Initialization
// =============================================================================

/// Create the tracer.
///
/// This should be called once during kernel boot. The boot-time arena is
/// reserved here in one piece; use [`Tracer::with_boot_arena`] to hand over
/// a static buffer instead.
pub fn init(
    ops: alloc::sync::Arc<dyn TraceOps>,
    config: TriggerConfig,
) -> Result<Tracer, TriggerError> {
    info!("Initializing axtrigger...");
    info!("  - hash trigger tables: {} bits", config.hash_bits);

    #[cfg(feature = "snapshot")]
    info!("  - snapshot trigger enabled");

    #[cfg(feature = "stacktrace")]
    info!("  - stacktrace trigger enabled");

    #[cfg(feature = "early-hashtriggers")]
    info!(
        "  - boot-time hash triggers enabled ({} bytes of boot arena)",
        config.early_arena_bytes
    );

    let tracer = Tracer::new(ops, config)?;
    info!(
        "axtrigger initialization complete ({} trigger commands)",
        tracer.commands().len()
    );
    Ok(tracer)
}
