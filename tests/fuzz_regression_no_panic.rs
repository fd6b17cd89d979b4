use std::panic::{AssertUnwindSafe, catch_unwind};

use tj::syntax::parse_trace;
use tj::trace::logger::{LogOptions, log_loop};
use tj::trace::verify::verify_loop;
use tj::trace::{OptConfig, TraceOptimizer};

// Inputs that once tripped the parser or the optimizer.
const CORPUS: &[&str] = &[
    "",
    "[",
    "loop",
    "[i0]",
    "[i0]\njump(",
    "[i0]\njump(i0, descr=)",
    "[i0]\ni1 = int_add(i0, 99999999999999999999999)\njump(i1)",
    "[i0]\nguard_true(i0) [i0] @",
    "[i0]\nguard_true(i0) [i0] @ [i0] [i0] [i0] [i9]\njump(i0)",
    "[p0]\np1 = same_as(p0)\njump(p1)",
    "[i0]\np1 = same_as(i0)\njump(i0)",
    "[i0]\nguard_value(i0, ConstPtr(1)) [i0]\njump(i0)",
    "[i0]\nguard_isnull(i0) [i0]\njump(i0)",
    "[f0]\nguard_true(f0) [f0]\njump(f0)",
    "[i0]\ni1 = call_pure(1, i0)\np2 = call_pure(1, i0)\njump(i1)",
    "[i0]\np1 = new(descr=T)\nsetfield_gc(p1, i0, descr=x)\np2 = getfield_gc(p1, descr=x)\njump(i0)",
    "[i0]\np1 = new(descr=T)\nsetfield_gc(p1, p1, descr=next)\njump(i0)",
    "[i0, i0]\njump(i0, i0)",
    "[i0]\njump(i0)\njump(i0)",
    "[i0]\ni1 = int_rshift(i0, -1)\njump(i1)",
    "[i0]\ni1 = int_lshift(1, 64)\njump(i1)",
    "[i0]\nguard_value(i0, 1) [i0]\njump(2)",
    "[i0]\ni1 = int_add(i0, 1)\nfinish(i1)",
    "[i0]\njump(i0, descr=Elsewhere)",
];

#[test]
fn corpus_never_panics() {
    let optimizer = TraceOptimizer::with_config(OptConfig::default());
    for src in CORPUS {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let Ok(trace) = parse_trace(src) else {
                return;
            };
            match optimizer.optimize_loop(trace) {
                Ok(lp) => {
                    assert!(verify_loop(&lp).is_ok(), "invalid result for {:?}", src);
                    let _ = log_loop(&lp, &LogOptions { guard_numbers: true, snapshots: true });
                    let _ = optimizer.optimize_loop(lp.to_trace());
                }
                Err(e) => assert!(!e.code.is_internal(), "{:?}: {}", src, e),
            }
        }));
        assert!(outcome.is_ok(), "pipeline panicked on {:?}", src);
    }
}

#[test]
fn malformed_traces_are_errors_not_panics() {
    let optimizer = TraceOptimizer::with_config(OptConfig::default());
    for src in [
        "[i0]\np1 = same_as(i0)\njump(i0)",
        "[i0]\nguard_value(i0, ConstPtr(1)) [i0]\njump(i0)",
        "[i0]\njump(i0)\njump(i0)",
    ] {
        let trace = parse_trace(src).unwrap();
        assert!(optimizer.optimize_loop(trace).is_err(), "{:?} must be rejected", src);
    }
}
