use crate::error::TJ;
use crate::trace::def::{Arg, Const, Operation};
use crate::trace::opcode::Opcode;
use crate::trace::opt::{Optimization, Optimizer};
use tracing::trace;

/// Allocation removal. Objects allocated in the trace stay virtual while
/// only their fields are touched; anything else forces them.
#[derive(Default)]
pub struct TraceVirtualizer;

impl TraceVirtualizer {
    pub fn new() -> Self {
        Self
    }

    fn optimize_new(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        if op.result.is_none() {
            return opt.emit_operation(op);
        }
        if let Some(vid) = opt.values.make_virtual(op) {
            trace!(target: "tj::virtualize", value = vid, "allocation made virtual");
            opt.stats.virtuals_created += 1;
        }
        Ok(())
    }

    fn optimize_setfield(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let (Some(target), Some(value), Some(name)) =
            (op.args.first().copied(), op.args.get(1).copied(), op.descr_name())
        else {
            return opt.emit_operation(op);
        };
        let tvid = opt.getvalue(target);
        if !opt.values.get(tvid).is_virtual() {
            return opt.emit_operation(op);
        }
        let vvid = opt.getvalue(value);
        opt.values.setfield(tvid, name, vvid);
        Ok(())
    }

    fn optimize_getfield(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let (Some(target), Some(result), Some(name)) =
            (op.args.first().copied(), op.result, op.descr_name())
        else {
            return opt.emit_operation(op);
        };
        let tvid = opt.getvalue(target);
        if !opt.values.get(tvid).is_virtual() {
            return opt.emit_operation(op);
        }
        match opt.values.getfield(tvid, name) {
            Some(fvid) if opt.values.get(fvid).box_.kind() != result.kind => {
                return opt.emit_operation(op);
            }
            Some(fvid) => opt.values.make_equal_to(result, fvid),
            None => {
                // Fresh objects are zero-initialized.
                let vid = opt.getvalue(Arg::Box(result));
                opt.values.make_constant(vid, Const::zero(result.kind));
            }
        }
        Ok(())
    }
}

impl Optimization for TraceVirtualizer {
    fn name(&self) -> &'static str {
        "virtualize"
    }

    fn propagate_forward(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        match op.opnum {
            Opcode::New => self.optimize_new(op, opt),
            Opcode::SetfieldGc => self.optimize_setfield(op, opt),
            Opcode::GetfieldGc | Opcode::GetfieldGcPure => self.optimize_getfield(op, opt),
            _ => opt.emit_operation(op),
        }
    }
}
