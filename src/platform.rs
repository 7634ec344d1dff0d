//! Mock kernel services for testing.
//!
//! [`MockOps`] implements [`TraceOps`] with atomic counters and settable
//! state, so the whole trigger engine can run in user space.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::event::{EventCall, EventField};
use crate::trace_ops::{EventFilter, FilterError, StackTrace, TaskInfo, TraceOps};

// =============================================================================
// Mock Filter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

/// `<field> <op> <integer>` against a single scalar field.
struct MockFilter {
    field: EventField,
    op: CompareOp,
    rhs: i64,
}

impl EventFilter for MockFilter {
    fn matches(&self, rec: &[u8]) -> bool {
        let Some(lhs) = self.field.read_integer(rec) else {
            return false;
        };
        let lhs = lhs as i64;
        match self.op {
            CompareOp::Eq => lhs == self.rhs,
            CompareOp::Ne => lhs != self.rhs,
            CompareOp::Lt => lhs < self.rhs,
            CompareOp::Gt => lhs > self.rhs,
        }
    }
}

fn compile_mock_filter(call: &EventCall, expr: &str) -> Result<MockFilter, FilterError> {
    let mut tokens = expr.split_whitespace();
    let (Some(name), Some(op), Some(rhs), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(FilterError(expr.to_string()));
    };

    let field = call
        .find_field(name)
        .filter(|f| f.is_integer())
        .ok_or_else(|| FilterError(format!("no such field '{name}'")))?;
    let op = match op {
        "==" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        "<" => CompareOp::Lt,
        ">" => CompareOp::Gt,
        _ => return Err(FilterError(format!("unsupported operator '{op}'"))),
    };
    let rhs = rhs
        .parse::<i64>()
        .map_err(|_| FilterError(format!("bad operand '{rhs}'")))?;

    Ok(MockFilter {
        field: field.clone(),
        op,
        rhs,
    })
}

// =============================================================================
// Mock Operations
// =============================================================================

/// Settable in-memory kernel used by tests and host-side tooling.
pub struct MockOps {
    tracing_on: AtomicBool,
    snapshot_available: AtomicBool,
    snapshots: AtomicU64,
    stack_dumps: AtomicU64,
    irq_saves: AtomicUsize,
    irqs_off: AtomicBool,
    stack: Mutex<StackTrace>,
    task: Mutex<TaskInfo>,
    symbols: Mutex<BTreeMap<u64, String>>,
    syscalls: Mutex<BTreeMap<u64, String>>,
}

impl MockOps {
    /// Tracing on, snapshot buffer available, running as pid 1 `init`.
    pub fn new() -> Self {
        Self {
            tracing_on: AtomicBool::new(true),
            snapshot_available: AtomicBool::new(true),
            snapshots: AtomicU64::new(0),
            stack_dumps: AtomicU64::new(0),
            irq_saves: AtomicUsize::new(0),
            irqs_off: AtomicBool::new(false),
            stack: Mutex::new(StackTrace::new(0)),
            task: Mutex::new(TaskInfo::new(1, "init")),
            symbols: Mutex::new(BTreeMap::new()),
            syscalls: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_tracing(&self, on: bool) {
        self.tracing_on.store(on, Ordering::SeqCst);
    }

    /// Make the next snapshot buffer allocation succeed or fail.
    pub fn set_snapshot_available(&self, available: bool) {
        self.snapshot_available.store(available, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn stack_dump_count(&self) -> u64 {
        self.stack_dumps.load(Ordering::SeqCst)
    }

    /// Number of times interrupts were disabled by the engine.
    pub fn irq_save_count(&self) -> usize {
        self.irq_saves.load(Ordering::SeqCst)
    }

    /// Whether a saved interrupt state is still waiting to be restored.
    pub fn irqs_disabled(&self) -> bool {
        self.irqs_off.load(Ordering::SeqCst)
    }

    /// Frames returned by subsequent stack captures.
    pub fn set_stack(&self, frames: &[usize]) {
        *self.stack.lock() = StackTrace::from_frames(frames);
    }

    pub fn set_current_task(&self, pid: i32, comm: &str) {
        *self.task.lock() = TaskInfo::new(pid, comm);
    }

    pub fn add_symbol(&self, addr: u64, name: &str) {
        self.symbols.lock().insert(addr, name.to_string());
    }

    pub fn add_syscall(&self, nr: u64, name: &str) {
        self.syscalls.lock().insert(nr, name.to_string());
    }

    /// Convenience for building trait objects.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for MockOps {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceOps for MockOps {
    fn tracing_is_on(&self) -> bool {
        self.tracing_on.load(Ordering::SeqCst)
    }

    fn tracing_on(&self) {
        self.set_tracing(true);
    }

    fn tracing_off(&self) {
        self.set_tracing(false);
    }

    fn alloc_snapshot(&self) -> bool {
        self.snapshot_available.load(Ordering::SeqCst)
    }

    fn snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }

    fn dump_stack(&self, _skip: usize) {
        self.stack_dumps.fetch_add(1, Ordering::SeqCst);
    }

    fn save_stack_trace(&self, trace: &mut StackTrace) {
        let src = self.stack.lock();
        trace.entries = src.entries;
        trace.nr_entries = src.nr_entries;
    }

    fn current_task(&self) -> TaskInfo {
        *self.task.lock()
    }

    fn lookup_symbol(&self, addr: u64) -> Option<String> {
        self.symbols.lock().get(&addr).cloned()
    }

    fn syscall_name(&self, nr: u64) -> Option<String> {
        self.syscalls.lock().get(&nr).cloned()
    }

    fn compile_filter(
        &self,
        call: &EventCall,
        expr: &str,
    ) -> Result<Arc<dyn EventFilter>, FilterError> {
        let filter = compile_mock_filter(call, expr)?;
        Ok(Arc::new(filter))
    }

    fn local_irq_save(&self) -> usize {
        self.irq_saves.fetch_add(1, Ordering::SeqCst);
        self.irqs_off.swap(true, Ordering::SeqCst) as usize
    }

    fn local_irq_restore(&self, flags: usize) {
        self.irqs_off.store(flags != 0, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FieldType;

    fn call() -> EventCall {
        EventCall::new("sched", "sched_switch")
            .with_field(EventField::new("prev_pid", 0, 4, true, FieldType::Integer))
    }

    #[test]
    fn test_mock_filter_compares() {
        let ops = MockOps::new();
        let f = ops.compile_filter(&call(), "prev_pid == 7").unwrap();
        assert!(f.matches(&7i32.to_ne_bytes()));
        assert!(!f.matches(&8i32.to_ne_bytes()));

        let f = ops.compile_filter(&call(), "prev_pid < 0").unwrap();
        assert!(f.matches(&(-3i32).to_ne_bytes()));
    }

    #[test]
    fn test_mock_filter_rejects_garbage() {
        let ops = MockOps::new();
        assert!(ops.compile_filter(&call(), "prev_pid").is_err());
        assert!(ops.compile_filter(&call(), "nope == 1").is_err());
        assert!(ops.compile_filter(&call(), "prev_pid ~ 1").is_err());
    }

    #[test]
    fn test_mock_stack_capture() {
        let ops = MockOps::new();
        ops.set_stack(&[0x10, 0x20]);
        let mut trace = StackTrace::default();
        ops.save_stack_trace(&mut trace);
        assert_eq!(trace.frames(), &[0x10, 0x20]);
    }
}
