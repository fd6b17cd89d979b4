use crate::trace::def::{Arg, BoxRef, Descr, Loop, LoopToken, Operation, Trace};
use rustc_hash::FxHashMap;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub guard_numbers: bool,
    pub snapshots: bool,
}

/// Renders operations in the textual trace format. Boxes are renamed in
/// first-seen order so dumps stay stable across compilations.
pub struct LogOperations {
    memo: FxHashMap<BoxRef, usize>,
    opts: LogOptions,
    self_token: LoopToken,
    loop_name: String,
}

impl LogOperations {
    pub fn new(loop_name: &str, self_token: LoopToken, opts: LogOptions) -> Self {
        Self {
            memo: FxHashMap::default(),
            opts,
            self_token,
            loop_name: loop_name.to_string(),
        }
    }

    pub fn repr_of_box(&mut self, b: BoxRef) -> String {
        let next = self.memo.len();
        let n = *self.memo.entry(b).or_insert(next);
        format!("{}{}", b.kind.prefix(), n)
    }

    pub fn repr_of_arg(&mut self, arg: Arg) -> String {
        match arg {
            Arg::Box(b) => self.repr_of_box(b),
            Arg::Const(c) => format!("{:?}", c),
        }
    }

    fn repr_of_args(&mut self, args: &[Arg]) -> String {
        args.iter()
            .map(|a| self.repr_of_arg(*a))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn repr_of_descr(&self, descr: &Descr) -> Option<String> {
        match descr {
            Descr::Loop(t) if *t == self.self_token => Some(self.loop_name.clone()),
            Descr::Loop(t) => Some(t.to_string()),
            Descr::Guard(g) if self.opts.guard_numbers => Some(format!("<Guard{}>", g.number)),
            Descr::Guard(_) => None,
            Descr::Field(name) | Descr::Size(name) => Some(name.clone()),
        }
    }

    pub fn repr_of_op(&mut self, op: &Operation) -> String {
        let mut out = String::new();
        // Arguments are named before the result, matching definition order.
        let mut args = self.repr_of_args(&op.args);
        if let Some(descr) = op.descr.as_ref().and_then(|d| self.repr_of_descr(d)) {
            if !args.is_empty() {
                args.push_str(", ");
            }
            let _ = write!(args, "descr={}", descr);
        }
        if let Some(r) = op.result {
            let _ = write!(out, "{} = ", self.repr_of_box(r));
        }
        let _ = write!(out, "{}({})", op.opnum.name(), args);
        if let Some(fail_args) = &op.fail_args {
            let fa = self.repr_of_args(fail_args);
            let _ = write!(out, " [{}]", fa);
        }
        if self.opts.snapshots
            && let Some(snapshot) = op.guard_descr().and_then(|g| g.snapshot.as_ref())
        {
            out.push_str(" @");
            for frame in snapshot.frames() {
                let boxes = self.repr_of_args(&frame.boxes);
                let _ = write!(out, " [{}]", boxes);
            }
        }
        out
    }

    pub fn log_operations(&mut self, inputargs: &[BoxRef], operations: &[Operation]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "loop {}", self.loop_name);
        let inputs = inputargs
            .iter()
            .map(|b| self.repr_of_box(*b))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "[{}]", inputs);
        for op in operations {
            let line = self.repr_of_op(op);
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

pub fn log_trace(trace: &Trace) -> String {
    LogOperations::new(&trace.name, trace.token, LogOptions::default())
        .log_operations(&trace.inputargs, &trace.operations)
}

/// Preamble (if any) followed by the loop body. Both sections share one
/// naming memo, so a box keeps its name across the boundary.
pub fn log_loop(lp: &Loop, opts: &LogOptions) -> String {
    let mut logger = LogOperations::new(&lp.name, lp.token, *opts);
    let mut out = String::new();
    if let Some(preamble) = &lp.preamble {
        let _ = writeln!(out, "# preamble: {} ops", preamble.operations.len());
        out.push_str(&logger.log_operations(&preamble.inputargs, &preamble.operations));
        let _ = writeln!(out, "# loop: {} ops", lp.operations.len());
    }
    out.push_str(&logger.log_operations(&lp.inputargs, &lp.operations));
    out
}

/// Only the body section of a loop, re-readable on its own.
pub fn log_body(lp: &Loop, opts: &LogOptions) -> String {
    LogOperations::new(&lp.name, lp.token, *opts).log_operations(&lp.inputargs, &lp.operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::def::{Const, Kind};
    use crate::trace::opcode::Opcode;

    #[test]
    fn renders_ops_with_first_seen_names() {
        let mut t = Trace::new("Loop0");
        t.pool.fresh_box(Kind::Int);
        let x = t.input(Kind::Int);
        let p = t.input(Kind::Ref);
        let s = t.record(Opcode::IntAdd, vec![Arg::Box(x), Arg::Const(Const::Int(-2))], Kind::Int);
        t.record_guard(Opcode::GuardNonnull, vec![Arg::Box(p)], vec![Arg::Box(s)]);
        t.close_loop(vec![Arg::Box(s), Arg::Const(Const::Ref(0))]);

        let text = log_trace(&t);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "loop Loop0",
                "[i0, p1]",
                "i2 = int_add(i0, -2)",
                "guard_nonnull(p1) [i2]",
                "jump(i2, ConstPtr(0), descr=Loop0)",
            ]
        );
    }

    #[test]
    fn guard_numbers_and_snapshots_are_optional() {
        let mut t = Trace::new("L");
        let x = t.input(Kind::Int);
        t.record_guard(Opcode::GuardTrue, vec![Arg::Box(x)], vec![Arg::Box(x)]);
        let opts = LogOptions {
            guard_numbers: true,
            snapshots: true,
        };
        let mut logger = LogOperations::new("L", t.token, opts);
        logger.repr_of_box(x);
        let line = logger.repr_of_op(&t.operations[0]);
        assert_eq!(line, "guard_true(i0, descr=<Guard0>) [i0] @ [i0]");
    }
}
