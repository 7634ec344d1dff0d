//! Integration tests for boot-time hash triggers.

#![cfg(feature = "early-hashtriggers")]

use std::mem::MaybeUninit;
use std::sync::Arc;

use axtrigger::event::{EventCall, EventField, FieldType};
use axtrigger::hashtable::BootArena;
use axtrigger::platform::MockOps;
use axtrigger::{EarlyHashTriggers, HashError, Tracer, TriggerConfig, TriggerError};

const KMALLOC_STACKS: &str =
    "kmem:kmalloc:hash:stacktrace:bytes_req.override,bytes_alloc.override";

fn config(spec: Option<&str>) -> TriggerConfig {
    TriggerConfig {
        early_hash_bits: 6,
        early_hashtriggers: spec.map(String::from),
        ..TriggerConfig::default()
    }
}

// =============================================================================
// Setup Tests
// =============================================================================

#[test]
fn test_setup_multiple() {
    let early = EarlyHashTriggers::new(&config(None));
    assert!(early.is_empty());

    let spec = format!("{KMALLOC_STACKS};kmem:mm_page_alloc:hash:stacktrace:hitcount;");
    assert_eq!(early.setup(&spec), Ok(2));
    assert_eq!(early.len(), 2);
    assert!(early.arena().used() > 0);

    let t = early.find("kmem:kmalloc").unwrap();
    assert_eq!(t.event_name(), "kmem:kmalloc");
    assert!(t.is_enabled());
    assert_eq!(t.table().vals().len(), 2);
    assert!(early.table("kmem:mm_page_alloc").unwrap().vals().is_empty());
    assert!(early.find("kmem:kfree").is_none());
}

#[test]
fn test_setup_stops_at_first_error() {
    let early = EarlyHashTriggers::new(&config(None));
    let spec = format!("{KMALLOC_STACKS};kmem:kfree:hist:stacktrace:hitcount;kmem:mm_page_alloc:hash:stacktrace:hitcount");
    assert_eq!(
        early.setup(&spec),
        Err(TriggerError::InvalidCommand("hist".into()))
    );
    assert_eq!(early.len(), 1);
    assert!(early.find("kmem:mm_page_alloc").is_none());
}

#[test]
fn test_setup_errors() {
    let early = EarlyHashTriggers::new(&config(None));
    assert_eq!(
        early.setup("kmem:kmalloc"),
        Err(TriggerError::InvalidArgument("kmem:kmalloc".into()))
    );
    assert_eq!(
        early.setup("kmem:kmalloc:hash:stacktrace"),
        Err(TriggerError::InvalidArgument("kmem:kmalloc:hash:stacktrace".into()))
    );
    // No event description: record fields cannot be resolved.
    assert_eq!(
        early.setup("kmem:kmalloc:hash:call_site:hitcount"),
        Err(TriggerError::Table(HashError::UnknownField("call_site".into())))
    );
    assert!(early.is_empty());
}

#[test]
fn test_tables_live_in_static_arena() {
    static mut ARENA: [MaybeUninit<u8>; 256 * 1024] = [MaybeUninit::uninit(); 256 * 1024];
    let arena = BootArena::from_static(unsafe { &mut *std::ptr::addr_of_mut!(ARENA) });
    let region = arena.addr_range();

    let tracer =
        Tracer::with_boot_arena(MockOps::shared(), config(Some(KMALLOC_STACKS)), arena).unwrap();
    assert_eq!(tracer.early().arena().capacity(), 256 * 1024);
    let table = tracer.early().table("kmem:kmalloc").unwrap();
    for r in table.storage_ranges().iter().filter(|r| !r.is_empty()) {
        assert!(region.start <= r.start && r.end <= region.end);
    }

    let ops = MockOps::new();
    ops.set_stack(&[0x10]);
    tracer.early().early_trace_kmalloc(&ops, 8, 16);
    assert_eq!(table.entries().next().unwrap().sum(1), 16);
}

#[test]
fn test_setup_limit() {
    let cfg = TriggerConfig {
        max_early_triggers: 1,
        ..config(None)
    };
    let early = EarlyHashTriggers::new(&cfg);
    assert_eq!(
        early.setup(&format!("{KMALLOC_STACKS};kmem:mm_page_alloc:hash:stacktrace:hitcount")),
        Err(TriggerError::NoSpace)
    );
    assert_eq!(early.len(), 1);
}

#[test]
fn test_setup_arena_exhausted() {
    let cfg = TriggerConfig {
        early_arena_bytes: 1024,
        ..config(None)
    };
    let early = EarlyHashTriggers::new(&cfg);
    assert_eq!(
        early.setup(KMALLOC_STACKS),
        Err(TriggerError::Table(HashError::NoMemory))
    );
    assert!(early.is_empty());
}

// =============================================================================
// Recording Tests
// =============================================================================

#[test]
fn test_allocator_hooks_record() {
    let ops = MockOps::new();
    let early = EarlyHashTriggers::new(&config(None));
    early
        .setup(&format!("{KMALLOC_STACKS};kmem:mm_page_alloc:hash:stacktrace:hitcount"))
        .unwrap();

    ops.set_stack(&[0x1000, 0x2000]);
    early.early_trace_kmalloc(&ops, 24, 32);
    early.early_trace_kmalloc(&ops, 100, 128);
    early.early_trace_mm_page_alloc(&ops);
    // No trigger configured for these.
    early.early_trace_kmem_cache_alloc(&ops, 8, 8);
    early.early_trace_mm_page_alloc_zone_locked(&ops);

    let table = early.table("kmem:kmalloc").unwrap();
    assert_eq!(table.total_hits(), 2);
    let e = table.entries().next().unwrap();
    assert_eq!(e.count(), 2);
    assert_eq!(e.sum(0), 124);
    assert_eq!(e.sum(1), 160);

    assert_eq!(early.table("kmem:mm_page_alloc").unwrap().total_hits(), 1);
    assert!(!early.record(&ops, "kmem:kmem_cache_alloc", None));
}

#[test]
fn test_disable_stops_recording() {
    let ops = MockOps::new();
    let early = EarlyHashTriggers::new(&config(None));
    early.setup(KMALLOC_STACKS).unwrap();

    early.early_trace_kmalloc(&ops, 1, 8);
    early.disable("kmem:kmalloc");
    assert!(early.early_event_enabled("kmem:kmalloc").is_none());
    early.early_trace_kmalloc(&ops, 1, 8);

    assert_eq!(early.table("kmem:kmalloc").unwrap().total_hits(), 1);
}

// =============================================================================
// Handover Tests
// =============================================================================

#[test]
fn test_live_hash_trigger_takes_over() {
    let ops = MockOps::shared();
    let tracer = Tracer::new(ops.clone(), config(Some(KMALLOC_STACKS))).unwrap();
    assert_eq!(tracer.early().len(), 1);

    ops.set_stack(&[0xabc]);
    tracer.early().early_trace_kmalloc(&*ops, 16, 16);

    let file = tracer.add_event(
        EventCall::new("kmem", "kmalloc")
            .with_field(EventField::new("bytes_req", 0, 8, false, FieldType::Integer)),
    );
    tracer
        .write_trigger("kmem:kmalloc", "hash:bytes_req:hitcount")
        .unwrap();
    assert!(tracer.early().early_event_enabled("kmem:kmalloc").is_none());

    // Further early hits are ignored.
    tracer.early().early_trace_kmalloc(&*ops, 16, 16);
    file.trace(&64u64.to_ne_bytes(), |_| {});

    assert_eq!(
        tracer.show_triggers("kmem:kmalloc").unwrap(),
        "hash:unlimited\n\
         Early kmem:kmalloc events:\n\
         key: stacktrace:\n         0xabc\n\tvals: count:1, bytes_req:16, bytes_alloc:16\n\
         Totals:\n    Hits: 1\n    Entries: 1\n    Dropped: 0\n\
         key: bytes_req:64\tvals: count:1\n\
         Totals:\n    Hits: 1\n    Entries: 1\n    Dropped: 0\n"
    );
}

#[test]
fn test_rejected_hash_write_keeps_early_trigger() {
    let tracer = Tracer::new(MockOps::shared(), config(None)).unwrap();
    tracer.add_event(
        EventCall::new("kmem", "kmalloc")
            .with_field(EventField::new("bytes_req", 0, 8, false, FieldType::Integer)),
    );
    tracer
        .write_trigger("kmem:kmalloc", "hash:bytes_req:hitcount")
        .unwrap();
    tracer.early().setup(KMALLOC_STACKS).unwrap();

    assert_eq!(
        tracer.write_trigger("kmem:kmalloc", "hash:bytes_req:hitcount"),
        Err(TriggerError::AlreadyExists)
    );
    assert!(tracer.early().early_event_enabled("kmem:kmalloc").is_some());

    assert!(
        tracer
            .write_trigger("kmem:kmalloc", "hash:bytes_req:hitcount if bytes_req >")
            .is_err()
    );
    assert!(tracer.early().early_event_enabled("kmem:kmalloc").is_some());
}

#[test]
fn test_bad_cmdline_does_not_fail_init() {
    let ops: Arc<MockOps> = MockOps::shared();
    let tracer = Tracer::new(ops, config(Some("kmem:kmalloc:bogus"))).unwrap();
    assert!(tracer.early().is_empty());
}

#[test]
fn test_default_budget_fits_one_table() {
    let ops = MockOps::shared();
    let cmdline = format!("quiet trace_event_hashtriggers={KMALLOC_STACKS}");
    let tracer = Tracer::new(ops, TriggerConfig::from_cmdline(&cmdline)).unwrap();
    assert_eq!(tracer.early().len(), 1);
    let table = tracer.early().table("kmem:kmalloc").unwrap();
    assert_eq!(table.bits(), 12);
}
