use std::sync::Arc;

use tj::error::TJCode;
use tj::syntax::parse_trace;
use tj::trace::logger::{LogOptions, log_body, log_trace};
use tj::trace::opcode::Opcode;
use tj::trace::verify::{verify_loop, verify_trace};
use tj::trace::{Arg, Const, Loop, OptConfig, OptStats, Trace, TraceOptimizer};

fn optimize(src: &str) -> (Loop, OptStats) {
    optimize_trace(parse_trace(src).expect("trace must parse"))
}

fn optimize_trace(trace: Trace) -> (Loop, OptStats) {
    let (lp, stats) = TraceOptimizer::with_config(OptConfig::default())
        .optimize_loop_with_stats(trace)
        .expect("optimization must succeed");
    verify_loop(&lp).expect("optimized loop must verify");
    (lp, stats)
}

fn opcodes(ops: &[tj::trace::Operation]) -> Vec<Opcode> {
    ops.iter().map(|op| op.opnum).collect()
}

fn assert_arity(lp: &Loop) {
    let jump = lp.jump().expect("peeled body must end in a jump");
    assert_eq!(jump.args.len(), lp.inputargs.len());
    if let Some(preamble) = &lp.preamble {
        let entry = preamble.operations.last().expect("preamble must not be empty");
        assert_eq!(entry.opnum, Opcode::Jump);
        assert_eq!(entry.args.len(), lp.inputargs.len());
    }
}

#[test]
fn add_loop_keeps_invariant_input() {
    let src = r#"
loop L
[i0, i1]
i2 = int_add(i0, i1)
jump(i2, i1)
"#;
    let trace = parse_trace(src).unwrap();
    let x = trace.inputargs[0];
    let y = trace.inputargs[1];
    let t1 = trace.operations[0].result.unwrap();

    let (lp, stats) = optimize(src);
    assert!(lp.is_peeled());
    assert_arity(&lp);

    let preamble = lp.preamble.as_ref().unwrap();
    assert_eq!(preamble.inputargs, vec![x, y]);
    assert_eq!(lp.inputargs, vec![t1, y]);

    assert_eq!(opcodes(&lp.operations), vec![Opcode::IntAdd, Opcode::Jump]);
    let t2 = lp.operations[0].result.unwrap();
    assert_ne!(t2, t1);
    assert_eq!(lp.operations[0].args, vec![Arg::Box(t1), Arg::Box(y)]);
    assert_eq!(lp.operations[1].args, vec![Arg::Box(t2), Arg::Box(y)]);
    assert_eq!(stats.fixup_inputs, 0);
    assert_eq!(stats.peeled, 1);
}

#[test]
fn cloned_guard_gets_relinked_snapshot() {
    let src = r#"
[i0, i1]
i2 = int_lt(i0, i1)
guard_true(i2) [i0] @ [i0] [i1]
i3 = int_add(i0, 1)
jump(i3, i1)
"#;
    let trace = parse_trace(src).unwrap();
    let original = trace.operations[1]
        .guard_descr()
        .and_then(|g| g.snapshot.clone())
        .unwrap();
    let original_number = trace.operations[1].guard_descr().unwrap().number;
    let y = trace.inputargs[1];
    let next_x = trace.operations[2].result.unwrap();

    let (lp, _) = optimize_trace(trace);
    assert_arity(&lp);
    assert_eq!(lp.inputargs, vec![next_x, y]);

    let preamble = lp.preamble.as_ref().unwrap();
    let pre_guard = preamble.operations.iter().find(|op| op.is_guard()).unwrap();
    let pre_snapshot = pre_guard.guard_descr().and_then(|g| g.snapshot.as_ref()).unwrap();
    assert!(Arc::ptr_eq(pre_snapshot, &original));

    let guard = lp.operations.iter().find(|op| op.is_guard()).unwrap();
    assert_eq!(guard.fail_args, Some(vec![Arg::Box(next_x)]));
    let descr = guard.guard_descr().unwrap();
    assert_ne!(descr.number, original_number);
    let snapshot = descr.snapshot.as_ref().unwrap();
    assert!(!Arc::ptr_eq(snapshot, &original));
    assert_eq!(snapshot.depth(), 2);
    let frames: Vec<_> = snapshot.frames().map(|f| f.boxes.clone()).collect();
    assert_eq!(frames, vec![vec![Arg::Box(next_x)], vec![Arg::Box(y)]]);
}

#[test]
fn loop_invariant_computation_is_hoisted_into_preamble() {
    let src = r#"
[i0, i1]
i2 = int_mul(i1, 3)
i3 = int_add(i0, i2)
jump(i3, i1)
"#;
    let trace = parse_trace(src).unwrap();
    let y = trace.inputargs[1];
    let scaled = trace.operations[0].result.unwrap();
    let sum = trace.operations[1].result.unwrap();

    let (lp, stats) = optimize(src);
    assert_arity(&lp);
    assert_eq!(opcodes(&lp.operations), vec![Opcode::IntAdd, Opcode::Jump]);
    assert_eq!(lp.inputargs, vec![sum, y, scaled]);
    assert_eq!(lp.operations[0].args, vec![Arg::Box(sum), Arg::Box(scaled)]);
    let jump = lp.jump().unwrap();
    assert_eq!(jump.args[1..], [Arg::Box(y), Arg::Box(scaled)]);
    assert_eq!(stats.fixup_inputs, 1);
    assert_eq!(stats.cse_hits, 1);
}

#[test]
fn guard_value_specializes_the_body() {
    let src = r#"
[i0, i1]
guard_value(i1, 7) [i0, i1]
i2 = int_add(i0, i1)
jump(i2, i1)
"#;
    let trace = parse_trace(src).unwrap();
    let t1 = trace.operations[1].result.unwrap();

    let (lp, stats) = optimize(src);
    assert_arity(&lp);
    assert_eq!(lp.inputargs, vec![t1]);
    assert_eq!(opcodes(&lp.operations), vec![Opcode::IntAdd, Opcode::Jump]);
    assert_eq!(lp.operations[0].args, vec![Arg::Box(t1), Arg::Const(Const::Int(7))]);
    assert!(stats.guards_removed >= 1);

    let preamble = lp.preamble.as_ref().unwrap();
    assert_eq!(
        opcodes(&preamble.operations),
        vec![Opcode::GuardValue, Opcode::IntAdd, Opcode::Jump]
    );
}

#[test]
fn allocation_inside_the_loop_disappears() {
    let src = r#"
[i0]
p1 = new(descr=Counter)
setfield_gc(p1, i0, descr=value)
i2 = getfield_gc(p1, descr=value)
i3 = int_add(i2, 1)
jump(i3)
"#;
    let (lp, stats) = optimize(src);
    assert_arity(&lp);
    let preamble = lp.preamble.as_ref().unwrap();
    assert_eq!(opcodes(&preamble.operations), vec![Opcode::IntAdd, Opcode::Jump]);
    assert_eq!(opcodes(&lp.operations), vec![Opcode::IntAdd, Opcode::Jump]);
    assert_eq!(stats.virtuals_created, 2);
    assert_eq!(stats.virtuals_forced, 0);
}

#[test]
fn allocation_escaping_through_the_jump_is_forced_per_iteration() {
    let src = r#"
[p0]
i1 = getfield_gc(p0, descr=value)
i2 = int_add(i1, 1)
p3 = new(descr=Counter)
setfield_gc(p3, i2, descr=value)
jump(p3)
"#;
    let trace = parse_trace(src).unwrap();
    let boxed = trace.operations[2].result.unwrap();

    let (lp, stats) = optimize(src);
    assert_arity(&lp);
    assert_eq!(lp.inputargs, vec![boxed]);
    assert_eq!(
        opcodes(&lp.operations),
        vec![
            Opcode::GetfieldGc,
            Opcode::IntAdd,
            Opcode::New,
            Opcode::SetfieldGc,
            Opcode::Jump
        ]
    );
    assert_eq!(lp.operations[0].args, vec![Arg::Box(boxed)]);
    let fresh = lp.operations[2].result.unwrap();
    assert_ne!(fresh, boxed);
    assert_eq!(lp.jump().unwrap().args, vec![Arg::Box(fresh)]);
    assert_eq!(stats.virtuals_forced, 2);
}

#[test]
fn repeeling_a_peeled_body_keeps_its_shape() {
    let src = r#"
[i0, i1]
i2 = int_lt(i0, i1)
guard_true(i2) [i0, i1]
i3 = int_add(i0, 1)
jump(i3, i1)
"#;
    let (lp, _) = optimize(src);
    let optimizer = TraceOptimizer::with_config(OptConfig::default());
    let mut current = lp;
    for _ in 0..3 {
        let (next, stats) = optimizer.optimize_loop_with_stats(current.to_trace()).unwrap();
        verify_loop(&next).unwrap();
        assert_arity(&next);
        assert_eq!(stats.peeled, 1);
        assert_eq!(opcodes(&next.operations), opcodes(&current.operations));
        assert_eq!(next.inputargs.len(), current.inputargs.len());
        current = next;
    }
}

#[test]
fn body_dump_reads_back_unchanged() {
    let src = r#"
loop Loop0
[i0, i1, p2]
i3 = int_lt(i0, i1)
guard_true(i3) [i0, p2]
i4 = getfield_gc(p2, descr=step)
i5 = int_add(i0, i4)
jump(i5, i1, p2, descr=Loop0)
"#;
    let (lp, _) = optimize(src);
    let dump = log_body(&lp, &LogOptions::default());
    let reread = parse_trace(&dump).unwrap();
    assert_eq!(log_trace(&reread), dump);
    assert_eq!(reread.inputargs.len(), lp.inputargs.len());
}

fn snapshot_frames(op: &tj::trace::Operation) -> Vec<Vec<Arg>> {
    let snapshot = op.guard_descr().and_then(|g| g.snapshot.as_ref()).unwrap();
    snapshot.frames().map(|f| f.boxes.clone()).collect()
}

fn assert_dump_reads_back(lp: &Loop) {
    let opts = LogOptions {
        snapshots: true,
        ..LogOptions::default()
    };
    let dump = log_body(lp, &opts);
    let reread = parse_trace(&dump).unwrap_or_else(|e| panic!("{}\n{}", e.message, dump));
    verify_trace(&reread).unwrap();
}

#[test]
fn body_snapshot_names_reused_preamble_value() {
    let src = r#"
[i0, i1]
i2 = int_mul(i1, 3)
i3 = int_lt(i0, i1)
guard_true(i3) [i0] @ [i0, i2]
i4 = int_add(i0, 1)
jump(i4, i1)
"#;
    let trace = parse_trace(src).unwrap();
    let scaled = trace.operations[0].result.unwrap();
    let next_x = trace.operations[3].result.unwrap();

    let (lp, stats) = optimize_trace(trace);
    assert_arity(&lp);
    assert_eq!(
        opcodes(&lp.operations),
        vec![Opcode::IntLt, Opcode::GuardTrue, Opcode::IntAdd, Opcode::Jump]
    );
    // The multiplication only survives in the snapshot, so it rides along
    // as an extra loop input.
    assert!(lp.inputargs.contains(&scaled));
    assert_eq!(stats.fixup_inputs, 1);
    assert_eq!(
        snapshot_frames(&lp.operations[1]),
        vec![vec![Arg::Box(next_x), Arg::Box(scaled)]]
    );
    assert_dump_reads_back(&lp);
}

#[test]
fn virtual_in_snapshot_is_forced_before_the_guard() {
    let src = r#"
[i0]
p1 = new(descr=Cell)
setfield_gc(p1, i0, descr=value)
i2 = int_lt(i0, 10)
guard_true(i2) [i0] @ [i0, p1]
i3 = int_add(i0, 1)
jump(i3)
"#;
    let (lp, stats) = optimize(src);
    assert_arity(&lp);
    let expected = vec![
        Opcode::IntLt,
        Opcode::New,
        Opcode::SetfieldGc,
        Opcode::GuardTrue,
        Opcode::IntAdd,
        Opcode::Jump,
    ];
    assert_eq!(opcodes(&lp.preamble.as_ref().unwrap().operations), expected);
    assert_eq!(opcodes(&lp.operations), expected);

    let cell = lp.operations[1].result.unwrap();
    assert_eq!(lp.operations[2].args, vec![Arg::Box(cell), Arg::Box(lp.inputargs[0])]);
    assert_eq!(
        snapshot_frames(&lp.operations[3]),
        vec![vec![Arg::Box(lp.inputargs[0]), Arg::Box(cell)]]
    );
    assert_eq!(stats.virtuals_forced, 2);
    assert_dump_reads_back(&lp);
}

#[test]
fn guard_failing_on_second_iteration_rejects_loop() {
    let trace = parse_trace("[i0]\nguard_value(i0, 1) [i0]\njump(2)").unwrap();
    let err = TraceOptimizer::with_config(OptConfig::default())
        .optimize_loop(trace)
        .unwrap_err();
    assert_eq!(err.code, TJCode::E2001);
}

#[test]
fn malformed_input_is_reported_not_optimized() {
    let trace = parse_trace("[i0, i1]\njump(i0)").unwrap();
    let err = TraceOptimizer::with_config(OptConfig::default())
        .optimize_loop(trace)
        .unwrap_err();
    assert_eq!(err.code, TJCode::E3001);
}

#[test]
fn finished_trace_is_not_peeled() {
    let (lp, stats) = optimize("[i0]\ni1 = int_add(i0, 1)\nfinish(i1)");
    assert!(!lp.is_peeled());
    assert_eq!(stats.peeled, 0);
    assert_eq!(opcodes(&lp.operations), vec![Opcode::IntAdd, Opcode::Finish]);
}

#[test]
fn disabling_unroll_keeps_a_single_pass() {
    let trace = parse_trace("[i0]\ni1 = int_add(i0, 1)\njump(i1)").unwrap();
    let cfg = OptConfig {
        unroll: false,
        ..OptConfig::default()
    };
    let lp = TraceOptimizer::with_config(cfg).optimize_loop(trace).unwrap();
    assert!(!lp.is_peeled());
    assert_eq!(lp.operations.len(), 2);
    verify_loop(&lp).unwrap();
}

#[test]
fn results_can_move_across_threads() {
    let trace = parse_trace("[i0, i1]\ni2 = int_add(i0, i1)\njump(i2, i1)").unwrap();
    let handle = std::thread::spawn(move || {
        TraceOptimizer::with_config(OptConfig::default()).optimize_loop(trace)
    });
    let lp = handle.join().unwrap().unwrap();
    assert!(lp.is_peeled());
}
