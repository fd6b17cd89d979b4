use crate::ensure;
use crate::error::{Stage, TJ, TJCode, TJException};
use crate::trace::def::{Arg, BoxRef, Descr, Operation, Preamble};
use crate::trace::opcode::Opcode;
use crate::trace::opt::{Optimization, Optimizer, classify};
use crate::trace::snapshot::SnapshotRelinker;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

/// Loop peeling. The first pass over the trace becomes the preamble; the
/// closing jump triggers a second, renamed pass over a copy of the trace
/// which becomes the loop body. Values the body reads from the preamble
/// are threaded through as extra loop inputs.
#[derive(Default)]
pub struct TraceUnroller {
    cloned_operations: Vec<Operation>,
    // Box of one iteration -> box of the next.
    argmap: FxHashMap<BoxRef, Arg>,
    relinker: SnapshotRelinker,
}

impl TraceUnroller {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_preamble(&mut self, jump: Operation, opt: &mut Optimizer) -> TJ<()> {
        let jump_args = jump.args;
        for arg in &jump_args {
            let vid = opt.getvalue(*arg);
            opt.force_box(vid);
        }
        let mut preamble_ops = std::mem::take(&mut opt.newoperations);
        opt.sink_snapshots = SnapshotRelinker::sharing();
        opt.exception_might_have_happened = false;
        debug!(target: "tj::unroll", ops = preamble_ops.len(), "preamble closed");

        let loop_args = opt.inputargs.clone();
        let loop_operations = std::mem::take(&mut self.cloned_operations);
        let inputargs =
            self.inline(loop_operations, &loop_args, &jump_args, &preamble_ops, opt)?;

        let entry_args = inputargs.iter().map(|b| Arg::Box(*b)).collect();
        preamble_ops.push(
            Operation::new(Opcode::Jump, entry_args, None).with_descr(Descr::Loop(opt.token)),
        );
        opt.preamble = Some(Preamble {
            inputargs: loop_args,
            operations: preamble_ops,
        });
        opt.inputargs = inputargs;
        Ok(())
    }

    fn inline(
        &mut self,
        loop_operations: Vec<Operation>,
        loop_args: &[BoxRef],
        jump_args: &[Arg],
        preamble: &[Operation],
        opt: &mut Optimizer,
    ) -> TJ<Vec<BoxRef>> {
        ensure!(
            loop_args.len() == jump_args.len(),
            "TJ.ICE",
            TJCode::ICE9001,
            Stage::Unroll,
            "jump carries {} arguments but the loop has {} inputs",
            jump_args.len(),
            loop_args.len()
        );
        self.argmap = loop_args
            .iter()
            .copied()
            .zip(jump_args.iter().copied())
            .collect();
        self.relinker = SnapshotRelinker::new();
        let marked = classify::mark_fromstart(opt, loop_args, preamble);

        let mut inputargs = Vec::with_capacity(jump_args.len());
        let mut seen = FxHashSet::default();
        for arg in jump_args {
            let vid = opt.getvalue(*arg);
            if let Arg::Box(b) = opt.force_box(vid)
                && seen.insert(b)
            {
                inputargs.push(b);
            }
        }
        debug!(
            target: "tj::unroll",
            fromstart = marked,
            inputs = inputargs.len(),
            "peeling loop body"
        );

        for mut newop in loop_operations {
            newop.args = self.inline_args(&newop.args)?;
            if let Some(fail_args) = newop.fail_args.take() {
                newop.fail_args = Some(self.inline_args(&fail_args)?);
            }
            if let Some(old) = newop.result {
                let new = opt.pool.clone_box(old);
                newop.result = Some(new);
                self.argmap.insert(old, Arg::Box(new));
            }
            if let Some(descr) = newop.guard_descr_mut() {
                let argmap = &self.argmap;
                descr.snapshot = self
                    .relinker
                    .relink(descr.snapshot.as_ref(), |a| inline_snapshot_arg(argmap, a));
                descr.number = opt.pool.fresh_guard_number();
            }
            if newop.opnum == Opcode::Jump && newop.loop_token() == Some(opt.token) {
                let mut args = Vec::with_capacity(inputargs.len());
                for b in &inputargs {
                    let next = self.lookup(*b)?;
                    let vid = opt.getvalue(next);
                    args.push(opt.force_box(vid));
                }
                newop.args = args;
            }
            trace!(target: "tj::unroll", opnum = newop.opnum.name(), "inlined");
            opt.emit_operation(newop)?;
        }

        self.fixup(inputargs, opt)
    }

    fn lookup(&self, b: BoxRef) -> TJ<Arg> {
        self.argmap.get(&b).copied().ok_or_else(|| {
            TJException::ice(Stage::Unroll, format!("{:?} has no value in the next iteration", b))
        })
    }

    fn inline_args(&self, args: &[Arg]) -> TJ<Vec<Arg>> {
        args.iter()
            .map(|a| match a {
                Arg::Box(b) => self.lookup(*b),
                Arg::Const(_) => Ok(*a),
            })
            .collect()
    }

    /// Every from-start value the body reads must arrive through the jump.
    /// Adding one may force another, so this runs to a fixed point.
    fn fixup(&mut self, mut inputargs: Vec<BoxRef>, opt: &mut Optimizer) -> TJ<Vec<BoxRef>> {
        let Some(mut jump) = opt.newoperations.pop() else {
            return Err(TJException::ice(Stage::Unroll, "peeled body is empty"));
        };
        ensure!(
            jump.opnum == Opcode::Jump,
            "TJ.ICE",
            TJCode::ICE9001,
            Stage::Unroll,
            "peeled body ends in {} instead of a jump",
            jump.opnum.name()
        );

        let mut seen: FxHashSet<BoxRef> = inputargs.iter().copied().collect();
        let mut worklist: Vec<BoxRef> = opt
            .newoperations
            .iter()
            .flat_map(Operation::used_args)
            .chain(jump.args.iter().copied())
            .filter_map(Arg::as_box)
            .collect();
        let mut scanned = opt.newoperations.len();
        let mut added = 0;

        let mut i = 0;
        while i < worklist.len() {
            let b = worklist[i];
            i += 1;
            let Some(vid) = opt.values.lookup(b) else {
                continue;
            };
            if !opt.values.get(vid).fromstart {
                continue;
            }
            // A value that became constant inside the body may already have
            // been emitted under its box.
            let fb = match opt.force_box(vid) {
                Arg::Box(fb) => fb,
                Arg::Const(_) => b,
            };
            if !seen.insert(fb) {
                continue;
            }
            let next = self.lookup(fb)?;
            let nvid = opt.getvalue(next);
            let next = opt.force_box(nvid);
            debug!(
                target: "tj::unroll",
                input = ?fb,
                next = ?next,
                "from-start value added to loop inputs"
            );
            inputargs.push(fb);
            jump.args.push(next);
            added += 1;

            if let Arg::Box(nb) = next {
                worklist.push(nb);
            }
            let emitted = &opt.newoperations[scanned..];
            worklist.extend(
                emitted
                    .iter()
                    .flat_map(Operation::used_args)
                    .filter_map(Arg::as_box),
            );
            scanned = opt.newoperations.len();
        }

        opt.stats.fixup_inputs += added;
        opt.newoperations.push(jump);
        Ok(inputargs)
    }
}

fn inline_snapshot_arg(argmap: &FxHashMap<BoxRef, Arg>, a: Arg) -> Arg {
    match a {
        Arg::Box(b) => argmap.get(&b).copied().unwrap_or(a),
        Arg::Const(_) => a,
    }
}

impl Optimization for TraceUnroller {
    fn name(&self) -> &'static str {
        "unroll"
    }

    fn setup(&mut self, opt: &mut Optimizer) {
        self.cloned_operations = opt.operations.clone();
    }

    fn propagate_forward(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        if op.opnum == Opcode::Jump && op.loop_token() == Some(opt.token) {
            return self.close_preamble(op, opt);
        }
        opt.emit_operation(op)
    }
}
