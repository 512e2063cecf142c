//! Property-based tests for the tracing runtime
//!
//! Core properties:
//! 1. Well-nested start/finish sequences restore the stack top
//! 2. Frame ids per thread strictly increase and never repeat
//! 3. Caller id equals the id of the stack top at creation
//! 4. Catch restores exactly the snapshot, whatever was opened inside
//! 5. Log lines survive formatting and parsing

use calltrace::frame::{root, FrameId, MethodKind};
use calltrace::processor::{CollectingProcessor, EventKind, NullProcessor, TraceEvent};
use calltrace::thread::ThreadKey;
use calltrace::Tracer;
use proptest::prelude::*;
use std::sync::Arc;

fn null_tracer() -> Tracer {
    Tracer::new(Arc::new(NullProcessor))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_random_sequences_track_depth(ops in prop::collection::vec(any::<bool>(), 0..200)) {
        // Property: depth follows a model that never drops below zero, and
        // every finish at ROOT is counted as an underflow
        let tracer = null_tracer();
        let mut depth = 0usize;
        let mut underflows = 0u64;

        for start in ops {
            if start {
                tracer.on_call_start("P", "m", MethodKind::StaticCall, 1);
                depth += 1;
            } else {
                tracer.on_call_finish();
                if depth == 0 {
                    underflows += 1;
                } else {
                    depth -= 1;
                }
            }
            prop_assert_eq!(tracer.depth(), Some(depth));
        }
        prop_assert_eq!(tracer.stats().underflows, underflows);
    }

    #[test]
    fn prop_well_nested_sequences_return_to_root(shape in prop::collection::vec(0usize..6, 1..20)) {
        let tracer = null_tracer();
        let before = tracer.current_context().unwrap();

        for width in shape {
            for _ in 0..width {
                tracer.on_call_start("P", "m", MethodKind::InstanceCall, 1);
            }
            for _ in 0..width {
                tracer.on_call_finish();
            }
        }

        prop_assert!(Arc::ptr_eq(&tracer.current_context().unwrap(), &before));
        prop_assert!(Arc::ptr_eq(&before, root()));
    }

    #[test]
    fn prop_ids_strictly_increase(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let tracer = null_tracer();
        let mut last = FrameId::ROOT;

        for start in ops {
            if start {
                let top = tracer.current_context().unwrap();
                let frame = tracer
                    .on_call_start("P", "m", MethodKind::StaticCall, 1)
                    .unwrap();
                prop_assert!(frame.id() > last);
                prop_assert_eq!(frame.caller_id(), top.id());
                last = frame.id();
            } else {
                tracer.on_call_finish();
            }
        }
    }

    #[test]
    fn prop_catch_restores_snapshot(before in 0usize..20, inside in 0usize..50, throws in any::<bool>()) {
        let tracer = null_tracer();
        for _ in 0..before {
            tracer.on_call_start("Outer", "m", MethodKind::StaticCall, 1);
        }
        let snapshot = tracer.current_context().unwrap();

        for _ in 0..inside {
            tracer.on_call_start("Inner", "m", MethodKind::StaticCall, 2);
        }
        if throws {
            tracer.on_throw();
        }
        tracer.on_catch(&snapshot);

        prop_assert!(Arc::ptr_eq(&tracer.current_context().unwrap(), &snapshot));
        prop_assert_eq!(tracer.depth(), Some(before));
    }

    #[test]
    fn prop_event_lines_parse_back(
        owner in "[A-Za-z][A-Za-z0-9/$]{0,20}",
        method in "[a-z][A-Za-z0-9_]{0,12}",
        line in -1i32..100_000,
        depth in 0usize..5,
    ) {
        let collector = Arc::new(CollectingProcessor::new());
        let tracer = Tracer::new(collector.clone());
        for _ in 0..depth {
            tracer.on_call_start("Caller", "m", MethodKind::StaticCall, 0);
        }
        tracer.on_call_start(&owner, &method, MethodKind::InstanceCall, line);

        let events = collector.events_for(ThreadKey::current());
        let last = events.last().unwrap();
        prop_assert_eq!(last.kind, EventKind::CallStart);
        prop_assert_eq!(&last.callee, &format!("{}.{}", owner, method));

        let parsed: TraceEvent = last.to_string().parse().unwrap();
        prop_assert_eq!(&parsed, last);
    }
}
