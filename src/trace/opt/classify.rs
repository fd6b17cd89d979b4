use crate::trace::def::{Arg, BoxRef, Operation};
use crate::trace::opt::Optimizer;
use crate::trace::opt::value::OptValue;

/// A value may be reused by the peeled body instead of being recomputed when
/// it already has a concrete box before the loop starts. Constants need no
/// input slot and virtuals are cheaper to rebuild than to carry.
pub fn is_safe_to_force(v: &OptValue) -> bool {
    !v.is_constant() && !v.is_virtual()
}

/// Marks every value that exists when the preamble closes as from-start:
/// original loop inputs, preamble results and recorded pure operations.
/// Values created afterwards stay fresh. Returns how many were marked.
pub fn mark_fromstart(opt: &mut Optimizer, loop_args: &[BoxRef], preamble: &[Operation]) -> usize {
    for b in loop_args {
        opt.getvalue(Arg::Box(*b));
    }
    for op in preamble {
        if let Some(r) = op.result {
            opt.getvalue(Arg::Box(r));
        }
    }
    let mut marked = 0;
    for v in opt.values.iter_mut() {
        v.fromstart = is_safe_to_force(v);
        if v.fromstart {
            marked += 1;
        }
    }
    marked
}
