//! Integration tests for trigger commands.
//!
//! Tests parsing, attaching, firing and listing triggers through the
//! trigger file interface of [`Tracer`].

use std::sync::Arc;

use axtrigger::event::{EventCall, EventField, EventFile, FieldType, flags};
use axtrigger::platform::MockOps;
use axtrigger::triggers::TRIGGER_WRITE_MAX;
use axtrigger::{HashError, TraceOps, Tracer, TriggerConfig, TriggerError};

struct Fixture {
    ops: Arc<MockOps>,
    tracer: Tracer,
    kmalloc: Arc<EventFile>,
    switch: Arc<EventFile>,
    wakeup: Arc<EventFile>,
}

fn fixture() -> Fixture {
    let ops = MockOps::shared();
    let tracer = Tracer::new(ops.clone(), TriggerConfig::default()).unwrap();
    let kmalloc = tracer.add_event(
        EventCall::new("kmem", "kmalloc")
            .with_field(EventField::new("common_pid", 0, 4, true, FieldType::Integer))
            .with_field(EventField::new("pid", 4, 4, true, FieldType::Integer))
            .with_field(EventField::new("call_site", 8, 8, false, FieldType::Integer))
            .with_field(EventField::new("bytes_req", 16, 8, false, FieldType::Integer))
            .with_field(EventField::new("bytes_alloc", 24, 8, false, FieldType::Integer)),
    );
    let switch = tracer.add_event(
        EventCall::new("sched", "sched_switch")
            .with_field(EventField::new("common_pid", 0, 4, true, FieldType::Integer))
            .with_field(EventField::new("prev_pid", 4, 4, true, FieldType::Integer))
            .with_field(EventField::new("next_pid", 8, 4, true, FieldType::Integer)),
    );
    let wakeup = tracer.add_event(
        EventCall::new("sched", "sched_wakeup")
            .with_field(EventField::new("common_pid", 0, 4, true, FieldType::Integer))
            .with_field(EventField::new("pid", 4, 4, true, FieldType::Integer)),
    );
    Fixture {
        ops,
        tracer,
        kmalloc,
        switch,
        wakeup,
    }
}

fn kmalloc_rec(pid: i32, bytes_alloc: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    buf[4..8].copy_from_slice(&pid.to_ne_bytes());
    buf[24..32].copy_from_slice(&bytes_alloc.to_ne_bytes());
    buf
}

fn switch_rec(prev_pid: i32, next_pid: i32) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[4..8].copy_from_slice(&prev_pid.to_ne_bytes());
    buf[8..12].copy_from_slice(&next_pid.to_ne_bytes());
    buf
}

fn write(f: &Fixture, event: &str, cmd: &str) -> Result<usize, TriggerError> {
    f.tracer.write_trigger(event, cmd)
}

fn fire(file: &EventFile, rec: &[u8]) -> bool {
    file.trace(rec, |_| {})
}

// =============================================================================
// Trigger File Tests
// =============================================================================

#[test]
#[cfg(all(feature = "snapshot", feature = "stacktrace"))]
fn test_show_without_triggers_lists_commands() {
    let f = fixture();
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "# Available triggers:\n\
         # traceon traceoff snapshot stacktrace enable_event disable_event hash\n"
    );
}

#[test]
fn test_write_returns_length() {
    let f = fixture();
    let cmd = "traceoff\n";
    assert_eq!(write(&f, "sched:sched_switch", cmd), Ok(cmd.len()));
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "traceoff:unlimited\n"
    );
}

#[test]
fn test_blank_write_is_noop() {
    let f = fixture();
    assert_eq!(write(&f, "sched:sched_switch", "  \t\n"), Ok(0));
    assert!(f.switch.triggers().is_empty());
}

#[test]
fn test_write_too_long() {
    let f = fixture();
    let cmd = "a".repeat(TRIGGER_WRITE_MAX);
    assert_eq!(
        write(&f, "sched:sched_switch", &cmd),
        Err(TriggerError::TooLong(TRIGGER_WRITE_MAX))
    );
}

#[test]
fn test_unknown_event() {
    let f = fixture();
    assert_eq!(
        write(&f, "sched:nope", "traceon"),
        Err(TriggerError::NoSuchEvent("sched:nope".into()))
    );
    assert_eq!(
        f.tracer.show_triggers("nocolon").err(),
        Some(TriggerError::NoSuchEvent("nocolon".into()))
    );
}

#[test]
fn test_unknown_command() {
    let f = fixture();
    assert_eq!(
        write(&f, "sched:sched_switch", "bogus:3"),
        Err(TriggerError::InvalidCommand("bogus".into()))
    );
    assert_eq!(
        write(&f, "sched:sched_switch", "!bogus"),
        Err(TriggerError::InvalidCommand("bogus".into()))
    );
}

// =============================================================================
// traceon / traceoff Tests
// =============================================================================

#[test]
fn test_traceoff_fires() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff").unwrap();
    assert!(f.switch.has_flag(flags::TRIGGER_MODE));
    assert!(f.switch.is_soft_disabled());

    assert!(f.ops.tracing_is_on());
    // Soft-enabled for the trigger only: nothing is committed.
    assert!(!fire(&f.switch, &switch_rec(1, 2)));
    assert!(!f.ops.tracing_is_on());
}

#[test]
fn test_counted_traceon() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceon:2").unwrap();
    f.ops.set_tracing(false);

    fire(&f.switch, &switch_rec(1, 2));
    assert!(f.ops.tracing_is_on());
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "traceon:count=1\n"
    );

    // Already on: the count is not used up.
    fire(&f.switch, &switch_rec(1, 2));
    assert_eq!(f.switch.triggers()[0].count(), 1);

    f.ops.set_tracing(false);
    fire(&f.switch, &switch_rec(1, 2));
    assert!(f.ops.tracing_is_on());
    assert_eq!(f.switch.triggers()[0].count(), 0);

    f.ops.set_tracing(false);
    fire(&f.switch, &switch_rec(1, 2));
    assert!(!f.ops.tracing_is_on());
}

#[test]
fn test_count_bases() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff:0x10").unwrap();
    assert_eq!(f.switch.triggers()[0].count(), 16);
    write(&f, "sched:sched_switch", "!traceoff").unwrap();

    assert_eq!(
        write(&f, "sched:sched_switch", "traceoff:0x"),
        Err(TriggerError::InvalidArgument("0x".into()))
    );
}

#[test]
fn test_filtered_trigger() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff:3 if prev_pid == 7").unwrap();
    assert!(f.switch.has_flag(flags::TRIGGER_COND));
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "traceoff:count=3 if prev_pid == 7\n"
    );

    fire(&f.switch, &switch_rec(1, 2));
    assert!(f.ops.tracing_is_on());

    fire(&f.switch, &switch_rec(7, 2));
    assert!(!f.ops.tracing_is_on());
    assert_eq!(f.switch.triggers()[0].count(), 2);
}

#[test]
fn test_filter_without_count() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff if next_pid > 100").unwrap();
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "traceoff:unlimited if next_pid > 100\n"
    );
    fire(&f.switch, &switch_rec(1, 50));
    assert!(f.ops.tracing_is_on());
    fire(&f.switch, &switch_rec(1, 500));
    assert!(!f.ops.tracing_is_on());
}

#[test]
fn test_bad_filters() {
    let f = fixture();
    assert_eq!(
        write(&f, "sched:sched_switch", "traceoff when prev_pid == 1"),
        Err(TriggerError::InvalidArgument("when prev_pid == 1".into()))
    );
    assert_eq!(
        write(&f, "sched:sched_switch", "traceoff if"),
        Err(TriggerError::InvalidArgument("if".into()))
    );
    assert!(matches!(
        write(&f, "sched:sched_switch", "traceoff if nope == 1"),
        Err(TriggerError::Filter(_))
    ));
    assert!(f.switch.triggers().is_empty());
    assert_eq!(f.switch.flags(), 0);
}

#[test]
fn test_one_trigger_per_type() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff").unwrap();
    assert_eq!(
        write(&f, "sched:sched_switch", "traceon"),
        Err(TriggerError::AlreadyExists)
    );
    assert_eq!(f.switch.triggers().len(), 1);
    assert_eq!(f.switch.trigger_mode_refs(), 1);
}

#[test]
fn test_remove_trigger() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff if prev_pid == 1").unwrap();
    let data = f.switch.triggers()[0].clone();
    assert_eq!(data.ref_count(), 1);
    assert!(data.has_filter());

    write(&f, "sched:sched_switch", "!traceoff").unwrap();
    assert!(f.switch.triggers().is_empty());
    assert_eq!(data.ref_count(), 0);
    assert!(!data.has_filter());
    assert_eq!(f.switch.flags(), 0);
    assert_eq!(f.switch.trigger_mode_refs(), 0);

    // Removing again is not an error.
    assert!(write(&f, "sched:sched_switch", "!traceoff").is_ok());
}

#[test]
fn test_removed_trigger_no_longer_fires() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff").unwrap();
    write(&f, "sched:sched_switch", "!traceoff").unwrap();
    fire(&f.switch, &switch_rec(1, 2));
    assert!(f.ops.tracing_is_on());
}

#[test]
fn test_trigger_list_swap_disables_irqs() {
    let f = fixture();
    let before = f.ops.irq_save_count();

    write(&f, "sched:sched_switch", "traceoff").unwrap();
    assert_eq!(f.ops.irq_save_count(), before + 1);
    assert!(!f.ops.irqs_disabled());

    write(&f, "sched:sched_switch", "!traceoff").unwrap();
    assert_eq!(f.ops.irq_save_count(), before + 2);
    assert!(!f.ops.irqs_disabled());

    write(&f, "kmem:kmalloc", "traceon").unwrap();
    f.tracer.clear_event_triggers();
    assert!(!f.ops.irqs_disabled());
}

// =============================================================================
// snapshot / stacktrace Tests
// =============================================================================

#[test]
#[cfg(feature = "snapshot")]
fn test_snapshot_trigger() {
    let f = fixture();
    write(&f, "sched:sched_switch", "snapshot:1").unwrap();
    fire(&f.switch, &switch_rec(1, 2));
    fire(&f.switch, &switch_rec(1, 2));
    assert_eq!(f.ops.snapshot_count(), 1);
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "snapshot:count=0\n"
    );
}

#[test]
#[cfg(feature = "snapshot")]
fn test_snapshot_without_buffer() {
    let f = fixture();
    f.ops.set_snapshot_available(false);
    assert_eq!(
        write(&f, "sched:sched_switch", "snapshot"),
        Err(TriggerError::NotFound)
    );
    assert!(f.switch.triggers().is_empty());
    assert!(!f.switch.is_enabled());
}

#[test]
#[cfg(feature = "stacktrace")]
fn test_stacktrace_runs_after_commit() {
    let f = fixture();
    write(&f, "sched:sched_switch", "stacktrace").unwrap();
    assert!(f.switch.has_flag(flags::TRIGGER_COND));
    f.switch.enable_disable(true, false);

    let ops = f.ops.clone();
    let committed = f.switch.trace(&switch_rec(1, 2), |_| {
        assert_eq!(ops.stack_dump_count(), 0);
    });
    assert!(committed);
    assert_eq!(f.ops.stack_dump_count(), 1);
}

#[test]
#[cfg(feature = "stacktrace")]
fn test_stacktrace_respects_filter() {
    let f = fixture();
    write(&f, "sched:sched_switch", "stacktrace:5 if next_pid == 0").unwrap();
    fire(&f.switch, &switch_rec(1, 2));
    fire(&f.switch, &switch_rec(1, 0));
    assert_eq!(f.ops.stack_dump_count(), 1);
}

// =============================================================================
// enable_event / disable_event Tests
// =============================================================================

#[test]
fn test_enable_event() {
    let f = fixture();
    write(&f, "sched:sched_switch", "enable_event:sched:sched_wakeup").unwrap();
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "enable_event:sched:sched_wakeup:unlimited\n"
    );

    // The target is registered but soft-disabled until the trigger fires.
    assert!(f.wakeup.is_enabled());
    assert!(f.wakeup.is_soft_disabled());
    assert_eq!(f.wakeup.soft_mode_refs(), 1);
    assert!(!fire(&f.wakeup, &[0u8; 8]));

    fire(&f.switch, &switch_rec(1, 2));
    assert!(!f.wakeup.is_soft_disabled());
    assert!(fire(&f.wakeup, &[0u8; 8]));

    write(&f, "sched:sched_switch", "!enable_event:sched:sched_wakeup").unwrap();
    assert!(f.switch.triggers().is_empty());
    assert_eq!(f.wakeup.soft_mode_refs(), 0);
}

#[test]
fn test_counted_disable_event() {
    let f = fixture();
    write(&f, "sched:sched_switch", "disable_event:sched:sched_wakeup:1").unwrap();
    f.wakeup.enable_disable(true, false);
    assert!(!f.wakeup.is_soft_disabled());

    fire(&f.switch, &switch_rec(1, 2));
    assert!(f.wakeup.is_soft_disabled());
    assert_eq!(f.switch.triggers()[0].count(), 0);

    f.wakeup.enable_disable(true, false);
    fire(&f.switch, &switch_rec(1, 2));
    assert!(!f.wakeup.is_soft_disabled());
    assert_eq!(
        f.tracer.show_triggers("sched:sched_switch").unwrap(),
        "disable_event:sched:sched_wakeup:count=0\n"
    );
}

#[test]
fn test_enable_event_one_per_target() {
    let f = fixture();
    write(&f, "sched:sched_switch", "enable_event:sched:sched_wakeup").unwrap();
    assert_eq!(
        write(&f, "sched:sched_switch", "disable_event:sched:sched_wakeup"),
        Err(TriggerError::AlreadyExists)
    );
    assert_eq!(f.wakeup.soft_mode_refs(), 1);

    // A different target is fine.
    write(&f, "sched:sched_switch", "disable_event:kmem:kmalloc").unwrap();
    assert_eq!(f.switch.triggers().len(), 2);
    assert_eq!(f.switch.trigger_mode_refs(), 2);
}

#[test]
fn test_enable_event_errors() {
    let f = fixture();
    assert_eq!(
        write(&f, "sched:sched_switch", "enable_event"),
        Err(TriggerError::InvalidArgument("enable_event".into()))
    );
    assert_eq!(
        write(&f, "sched:sched_switch", "enable_event:sched"),
        Err(TriggerError::InvalidArgument("sched".into()))
    );
    assert_eq!(
        write(&f, "sched:sched_switch", "enable_event:sched:nope"),
        Err(TriggerError::NoSuchEvent("sched:nope".into()))
    );
    assert!(f.switch.triggers().is_empty());
}

// =============================================================================
// hash Tests
// =============================================================================

#[test]
fn test_hash_trigger_aggregates() {
    let f = fixture();
    write(&f, "kmem:kmalloc", "hash:pid:bytes_alloc").unwrap();

    // Soft-disabled: nothing committed, but the table still fills.
    assert!(!fire(&f.kmalloc, &kmalloc_rec(1, 10)));
    fire(&f.kmalloc, &kmalloc_rec(2, 5));
    fire(&f.kmalloc, &kmalloc_rec(1, 7));

    assert_eq!(
        f.tracer.show_triggers("kmem:kmalloc").unwrap(),
        "hash:unlimited\n\
         key: pid:2\tvals: count:1, bytes_alloc:5\n\
         key: pid:1\tvals: count:2, bytes_alloc:17\n\
         Totals:\n    Hits: 3\n    Entries: 2\n    Dropped: 0\n"
    );

    let data = f.kmalloc.triggers()[0].clone();
    let table = data.ops().hash_table().unwrap();
    assert_eq!(table.total_hits(), 3);
}

#[test]
fn test_hash_trigger_with_sort_and_filter() {
    let f = fixture();
    write(
        &f,
        "kmem:kmalloc",
        "hash:pid:bytes_alloc:sort=bytes_alloc.descending if pid != 3",
    )
    .unwrap();

    fire(&f.kmalloc, &kmalloc_rec(1, 10));
    fire(&f.kmalloc, &kmalloc_rec(2, 50));
    fire(&f.kmalloc, &kmalloc_rec(3, 99));

    assert_eq!(
        f.tracer.show_triggers("kmem:kmalloc").unwrap(),
        "hash:unlimited if pid != 3\n\
         key: pid:2\tvals: count:1, bytes_alloc:50\n\
         key: pid:1\tvals: count:1, bytes_alloc:10\n\
         Totals:\n    Hits: 2\n    Entries: 2\n    Dropped: 0\n"
    );
}

#[test]
fn test_hash_trigger_errors() {
    let f = fixture();
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash"),
        Err(TriggerError::InvalidArgument("hash".into()))
    );
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash:pid"),
        Err(TriggerError::InvalidArgument("pid".into()))
    );
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash:nope:hitcount"),
        Err(TriggerError::Table(HashError::UnknownField("nope".into())))
    );
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash:pid:hitcount:sort=pid:extra"),
        Err(TriggerError::InvalidArgument("pid:hitcount:sort=pid:extra".into()))
    );
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash:pid:hitcount:order=pid"),
        Err(TriggerError::Table(HashError::InvalidSortKey("order=pid".into())))
    );
    assert!(f.kmalloc.triggers().is_empty());
}

#[test]
fn test_hash_trigger_duplicate_and_remove() {
    let f = fixture();
    write(&f, "kmem:kmalloc", "hash:pid:hitcount").unwrap();
    assert_eq!(
        write(&f, "kmem:kmalloc", "hash:call_site:hitcount"),
        Err(TriggerError::AlreadyExists)
    );

    write(&f, "kmem:kmalloc", "!hash").unwrap();
    assert!(f.kmalloc.triggers().is_empty());
    assert_eq!(f.kmalloc.flags(), 0);
}

#[test]
fn test_hash_and_traceoff_together() {
    let f = fixture();
    write(&f, "kmem:kmalloc", "hash:pid:hitcount").unwrap();
    write(&f, "kmem:kmalloc", "traceoff").unwrap();

    // Listed most recent first.
    let shown = f.tracer.show_triggers("kmem:kmalloc").unwrap();
    assert!(shown.starts_with("traceoff:unlimited\nhash:unlimited\n"));

    fire(&f.kmalloc, &kmalloc_rec(4, 0));
    assert!(!f.ops.tracing_is_on());
    let data = f.kmalloc.triggers()[1].clone();
    assert_eq!(data.ops().hash_table().unwrap().total_entries(), 1);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_clear_event_triggers() {
    let f = fixture();
    write(&f, "sched:sched_switch", "traceoff").unwrap();
    write(&f, "sched:sched_switch", "enable_event:sched:sched_wakeup").unwrap();
    write(&f, "kmem:kmalloc", "hash:pid:hitcount").unwrap();

    f.tracer.clear_event_triggers();
    for file in [&f.switch, &f.kmalloc] {
        assert!(file.triggers().is_empty());
        assert_eq!(file.trigger_mode_refs(), 0);
        assert!(!file.has_flag(flags::TRIGGER_MODE));
    }
    assert_eq!(f.wakeup.soft_mode_refs(), 0);
}

#[test]
fn test_trace_without_triggers() {
    let f = fixture();
    // Not enabled at all.
    assert!(!fire(&f.switch, &switch_rec(1, 2)));
    f.switch.enable_disable(true, false);
    assert!(fire(&f.switch, &switch_rec(1, 2)));
}

#[test]
fn test_add_event_is_idempotent() {
    let f = fixture();
    let again = f.tracer.add_event(EventCall::new("kmem", "kmalloc"));
    assert!(Arc::ptr_eq(&again, &f.kmalloc));
    assert_eq!(f.tracer.events().len(), 3);
    assert!(Arc::ptr_eq(&f.tracer.event("kmem:kmalloc").unwrap(), &f.kmalloc));
}

// =============================================================================
// Error Conversion Tests
// =============================================================================

#[test]
fn test_error_to_axerror() {
    use axerrno::AxError;

    assert!(matches!(AxError::from(TriggerError::AlreadyExists), AxError::AlreadyExists));
    assert!(matches!(AxError::from(TriggerError::NotFound), AxError::NotFound));
    assert!(matches!(
        AxError::from(TriggerError::NoSuchEvent("a:b".into())),
        AxError::NotFound
    ));
    assert!(matches!(
        AxError::from(TriggerError::Busy("hash".into())),
        AxError::ResourceBusy
    ));
    assert!(matches!(
        AxError::from(TriggerError::Table(HashError::NoMemory)),
        AxError::NoMemory
    ));
    assert!(matches!(
        AxError::from(TriggerError::InvalidCommand("x".into())),
        AxError::InvalidInput
    ));
}

#[test]
fn test_error_messages() {
    assert_eq!(
        TriggerError::InvalidCommand("bogus".into()).to_string(),
        "Unknown trigger command: bogus"
    );
    assert_eq!(
        TriggerError::Table(HashError::MixedKey).to_string(),
        HashError::MixedKey.to_string()
    );
}
