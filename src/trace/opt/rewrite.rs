use crate::bail;
use crate::error::{Stage, TJ, TJCode};
use crate::trace::def::{Arg, Const, Kind, Operation};
use crate::trace::opcode::Opcode;
use crate::trace::opt::{Optimization, Optimizer, PureKey};
use tracing::trace;

/// Constant folding, CSE of pure operations and guard elimination.
#[derive(Default)]
pub struct TraceRewriter;

impl TraceRewriter {
    pub fn new() -> Self {
        Self
    }

    fn optimize_guard_bool(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let Some(arg) = op.args.first().copied() else {
            return opt.emit_operation(op);
        };
        let expect = op.opnum == Opcode::GuardTrue;
        let vid = opt.getvalue(arg);
        if let Some(c) = opt.values.get(vid).get_constant() {
            if c.is_true() == expect {
                opt.stats.guards_removed += 1;
                return Ok(());
            }
            bail!(
                "TJ.OptError",
                TJCode::E2001,
                Stage::Opt,
                "{}({:?}) always fails",
                op.opnum.name(),
                c
            );
        }
        opt.emit_operation(op)?;
        if arg.kind() == Kind::Int {
            opt.values.make_constant(vid, Const::Int(i64::from(expect)));
        }
        Ok(())
    }

    fn optimize_guard_value(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let (Some(arg), Some(Arg::Const(expected))) =
            (op.args.first().copied(), op.args.get(1).copied())
        else {
            return opt.emit_operation(op);
        };
        let vid = opt.getvalue(arg);
        if let Some(c) = opt.values.get(vid).get_constant() {
            if c == expected {
                opt.stats.guards_removed += 1;
                return Ok(());
            }
            bail!(
                "TJ.OptError",
                TJCode::E2001,
                Stage::Opt,
                "guard_value expects {:?} but the value is always {:?}",
                expected,
                c
            );
        }
        opt.emit_operation(op)?;
        opt.values.make_constant(vid, expected);
        Ok(())
    }

    fn optimize_guard_null(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let Some(arg) = op.args.first().copied() else {
            return opt.emit_operation(op);
        };
        let want_nonnull = op.opnum == Opcode::GuardNonnull;
        let vid = opt.getvalue(arg);
        let v = opt.values.get(vid);
        let known_nonnull = v.is_nonnull();
        let known_null = v.get_constant().is_some_and(|c| !c.is_true());
        if (want_nonnull && known_nonnull) || (!want_nonnull && known_null) {
            opt.stats.guards_removed += 1;
            return Ok(());
        }
        if known_nonnull || known_null {
            bail!(
                "TJ.OptError",
                TJCode::E2001,
                Stage::Opt,
                "{}({:?}) always fails",
                op.opnum.name(),
                arg
            );
        }
        opt.emit_operation(op)?;
        if want_nonnull {
            opt.values.make_nonnull(vid);
        } else {
            opt.values.make_constant(vid, Const::zero(arg.kind()));
        }
        Ok(())
    }

    fn optimize_guard_class(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let (Some(arg), Some(Arg::Const(cls))) = (op.args.first().copied(), op.args.get(1).copied())
        else {
            return opt.emit_operation(op);
        };
        let vid = opt.getvalue(arg);
        match opt.values.get(vid).known_class {
            Some(known) if known == cls => {
                opt.stats.guards_removed += 1;
                return Ok(());
            }
            Some(known) => bail!(
                "TJ.OptError",
                TJCode::E2001,
                Stage::Opt,
                "guard_class expects {:?} but the class is always {:?}",
                cls,
                known
            ),
            None => {}
        }
        opt.emit_operation(op)?;
        let v = opt.values.get_mut(vid);
        v.known_class = Some(cls);
        opt.values.make_nonnull(vid);
        Ok(())
    }

    fn optimize_guard_no_exception(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        if !opt.exception_might_have_happened {
            opt.stats.guards_removed += 1;
            return Ok(());
        }
        opt.emit_operation(op)?;
        opt.exception_might_have_happened = false;
        Ok(())
    }

    fn optimize_pure(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        let Some(result) = op.result else {
            return opt.emit_operation(op);
        };

        let consts: Option<Vec<Const>> = op.args.iter().map(|a| opt.get_constant(*a)).collect();
        if let Some(consts) = consts
            && let Some(c) = fold(op.opnum, &consts)
        {
            trace!(target: "tj::rewrite", opnum = op.opnum.name(), value = ?c, "folded");
            let vid = opt.getvalue(Arg::Box(result));
            opt.values.make_constant(vid, c);
            opt.stats.folded += 1;
            return Ok(());
        }

        let mut args = Vec::with_capacity(op.args.len());
        for a in &op.args {
            let vid = opt.getvalue(*a);
            let v = opt.values.get(vid);
            if v.is_virtual() {
                return opt.emit_operation(op);
            }
            args.push(v.box_);
        }
        let key = PureKey {
            opnum: op.opnum,
            args,
            descr: op.descr_name().map(str::to_string),
            kind: result.kind,
        };
        if let Some(&vid) = opt.pure_operations.get(&key) {
            trace!(target: "tj::rewrite", opnum = op.opnum.name(), "reused pure operation");
            opt.values.make_equal_to(result, vid);
            opt.stats.cse_hits += 1;
            return Ok(());
        }
        let vid = opt.getvalue(Arg::Box(result));
        opt.pure_operations.insert(key, vid);
        opt.emit_operation(op)
    }
}

impl Optimization for TraceRewriter {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn propagate_forward(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()> {
        match op.opnum {
            Opcode::GuardTrue | Opcode::GuardFalse => self.optimize_guard_bool(op, opt),
            Opcode::GuardValue => self.optimize_guard_value(op, opt),
            Opcode::GuardNonnull | Opcode::GuardIsnull => self.optimize_guard_null(op, opt),
            Opcode::GuardClass => self.optimize_guard_class(op, opt),
            Opcode::GuardNoException => self.optimize_guard_no_exception(op, opt),
            Opcode::SameAs => match (op.result, op.args.first().copied()) {
                (Some(r), Some(src)) => {
                    let vid = opt.getvalue(src);
                    opt.values.make_equal_to(r, vid);
                    Ok(())
                }
                _ => opt.emit_operation(op),
            },
            Opcode::Call => {
                opt.exception_might_have_happened = true;
                opt.emit_operation(op)
            }
            // call_pure has no fold rule; it is only CSE'd.
            _ if op.opnum.is_always_pure() => self.optimize_pure(op, opt),
            _ => opt.emit_operation(op),
        }
    }
}

fn fold(opnum: Opcode, args: &[Const]) -> Option<Const> {
    let int = |i: usize| args.get(i).and_then(Const::as_int);
    let float = |i: usize| args.get(i).and_then(Const::as_float);
    let bool_ = |b: bool| Some(Const::Int(i64::from(b)));
    match opnum {
        Opcode::IntAdd => Some(Const::Int(int(0)?.wrapping_add(int(1)?))),
        Opcode::IntSub => Some(Const::Int(int(0)?.wrapping_sub(int(1)?))),
        Opcode::IntMul => Some(Const::Int(int(0)?.wrapping_mul(int(1)?))),
        Opcode::IntAnd => Some(Const::Int(int(0)? & int(1)?)),
        Opcode::IntOr => Some(Const::Int(int(0)? | int(1)?)),
        Opcode::IntXor => Some(Const::Int(int(0)? ^ int(1)?)),
        Opcode::IntLshift => {
            let n = u32::try_from(int(1)?).ok().filter(|n| *n < 64)?;
            Some(Const::Int(int(0)?.wrapping_shl(n)))
        }
        Opcode::IntRshift => {
            let n = u32::try_from(int(1)?).ok().filter(|n| *n < 64)?;
            Some(Const::Int(int(0)? >> n))
        }
        Opcode::IntLt => bool_(int(0)? < int(1)?),
        Opcode::IntLe => bool_(int(0)? <= int(1)?),
        Opcode::IntEq => bool_(int(0)? == int(1)?),
        Opcode::IntNe => bool_(int(0)? != int(1)?),
        Opcode::IntGt => bool_(int(0)? > int(1)?),
        Opcode::IntGe => bool_(int(0)? >= int(1)?),
        Opcode::IntNeg => Some(Const::Int(int(0)?.wrapping_neg())),
        Opcode::IntIsTrue => bool_(int(0)? != 0),
        Opcode::FloatAdd => Some(Const::float(float(0)? + float(1)?)),
        Opcode::FloatSub => Some(Const::float(float(0)? - float(1)?)),
        Opcode::FloatMul => Some(Const::float(float(0)? * float(1)?)),
        Opcode::FloatNeg => Some(Const::float(-float(0)?)),
        Opcode::FloatLt => bool_(float(0)? < float(1)?),
        _ => None,
    }
}
