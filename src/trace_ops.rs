//! Kernel trace operations required by the trigger engine.
//!
//! The trigger engine never talks to the scheduler, the ring buffer or the
//! symbol table directly. Everything it needs from the surrounding kernel
//! goes through [`TraceOps`], which keeps the engine testable in user space
//! (see [`crate::platform::MockOps`]).

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::event::EventCall;

/// Maximum number of frames captured for a stacktrace key.
pub const HASH_STACKTRACE_DEPTH: usize = 16;

/// Frames skipped when capturing a stacktrace key (the trigger machinery itself).
pub const HASH_STACKTRACE_SKIP: usize = 3;

/// Length of a task command name, including the terminating NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Highest pid considered a regular task when saving command names.
pub const PID_MAX_DEFAULT: i32 = 0x8000;

/// Frames skipped by the `stacktrace` trigger command.
pub const STACK_SKIP: usize = 3;

/// A captured call stack of at most [`HASH_STACKTRACE_DEPTH`] frames.
///
/// Lives on the stack of the tracing context; capturing never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTrace {
    /// Return addresses, innermost first.
    pub entries: [usize; HASH_STACKTRACE_DEPTH],
    /// Number of valid frames in `entries`.
    pub nr_entries: usize,
    /// Frames to skip before recording.
    pub skip: usize,
}

impl StackTrace {
    /// Create an empty trace that will skip `skip` frames when filled.
    pub const fn new(skip: usize) -> Self {
        Self {
            entries: [0; HASH_STACKTRACE_DEPTH],
            nr_entries: 0,
            skip,
        }
    }

    /// Build a trace from explicit frames, truncated to the maximum depth.
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut trace = Self::new(0);
        let n = frames.len().min(HASH_STACKTRACE_DEPTH);
        trace.entries[..n].copy_from_slice(&frames[..n]);
        trace.nr_entries = n;
        trace
    }

    /// The valid frames.
    pub fn frames(&self) -> &[usize] {
        &self.entries[..self.nr_entries.min(HASH_STACKTRACE_DEPTH)]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::new(HASH_STACKTRACE_SKIP)
    }
}

/// The task running when an event fired.
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo {
    pub pid: i32,
    /// NUL-padded command name.
    pub comm: [u8; TASK_COMM_LEN],
}

impl TaskInfo {
    /// Create task info, truncating `comm` to fit.
    pub fn new(pid: i32, comm: &str) -> Self {
        let mut buf = [0u8; TASK_COMM_LEN];
        let n = comm.len().min(TASK_COMM_LEN - 1);
        buf[..n].copy_from_slice(&comm.as_bytes()[..n]);
        Self { pid, comm: buf }
    }
}

/// A compiled trigger filter.
///
/// Filter syntax belongs to the event framework; triggers only evaluate it.
pub trait EventFilter: Send + Sync {
    /// Whether `rec` satisfies the filter.
    fn matches(&self, rec: &[u8]) -> bool;
}

/// Filter compilation failure reported by the event framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError(pub String);

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid filter: {}", self.0)
    }
}

impl core::error::Error for FilterError {}

/// Kernel services used by triggers.
pub trait TraceOps: Send + Sync {
    /// Whether the global trace buffer is recording.
    fn tracing_is_on(&self) -> bool;

    /// Start recording into the trace buffer.
    fn tracing_on(&self);

    /// Stop recording into the trace buffer.
    fn tracing_off(&self);

    /// Allocate the snapshot buffer. Returns false when it cannot be allocated.
    fn alloc_snapshot(&self) -> bool;

    /// Swap the live buffer into the snapshot buffer.
    fn snapshot(&self);

    /// Write the current stack into the trace buffer.
    fn dump_stack(&self, skip: usize);

    /// Capture the current call stack into `trace`, honouring `trace.skip`.
    fn save_stack_trace(&self, trace: &mut StackTrace);

    /// The task that is currently running.
    fn current_task(&self) -> TaskInfo;

    /// Resolve a kernel address to `symbol+off/size`.
    fn lookup_symbol(&self, addr: u64) -> Option<String>;

    /// Resolve a syscall number to its name.
    fn syscall_name(&self, nr: u64) -> Option<String>;

    /// Compile a trigger filter expression for `call`.
    fn compile_filter(
        &self,
        call: &EventCall,
        expr: &str,
    ) -> Result<Arc<dyn EventFilter>, FilterError>;

    /// Disable local interrupts, returning the previous state.
    fn local_irq_save(&self) -> usize {
        0
    }

    /// Restore the interrupt state returned by [`TraceOps::local_irq_save`].
    fn local_irq_restore(&self, _flags: usize) {}
}

/// Keeps local interrupts disabled while alive.
///
/// Taken before any lock that a tracing context may also take.
pub struct IrqGuard<'a> {
    ops: &'a dyn TraceOps,
    flags: usize,
}

impl<'a> IrqGuard<'a> {
    pub fn new(ops: &'a dyn TraceOps) -> Self {
        let flags = ops.local_irq_save();
        Self { ops, flags }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.ops.local_irq_restore(self.flags);
    }
}
