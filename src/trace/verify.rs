use crate::trace::def::{Arg, BoxRef, Descr, Kind, Loop, LoopToken, Operation, Trace};
use crate::trace::opcode::Opcode;
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    MissingTerminator,
    MisplacedTerminator {
        index: usize,
    },
    DuplicateInput(BoxRef),
    DuplicateResult {
        index: usize,
        value: BoxRef,
    },
    UseBeforeDef {
        index: usize,
        value: BoxRef,
    },
    BadArity {
        index: usize,
        opcode: Opcode,
        expected: usize,
        got: usize,
    },
    MissingResult {
        index: usize,
        opcode: Opcode,
    },
    UnexpectedResult {
        index: usize,
        opcode: Opcode,
    },
    ResultKind {
        index: usize,
        expected: Kind,
        got: Kind,
    },
    ArgKind {
        index: usize,
        opcode: Opcode,
    },
    GuardWithoutDescr {
        index: usize,
    },
    GuardWithoutFailArgs {
        index: usize,
    },
    JumpWithoutToken {
        index: usize,
    },
    JumpArity {
        expected: usize,
        got: usize,
    },
    JumpKind {
        position: usize,
        expected: Kind,
        got: Kind,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::MissingTerminator => write!(f, "Trace does not end in jump or finish"),
            VerifyError::MisplacedTerminator { index } => {
                write!(f, "Terminator at op {} is not the last operation", index)
            }
            VerifyError::DuplicateInput(b) => write!(f, "Input {:?} listed twice", b),
            VerifyError::DuplicateResult { index, value } => {
                write!(f, "Op {} redefines {:?}", index, value)
            }
            VerifyError::UseBeforeDef { index, value } => {
                write!(f, "Use before def at op {}: {:?}", index, value)
            }
            VerifyError::BadArity {
                index,
                opcode,
                expected,
                got,
            } => write!(
                f,
                "Op {} ({}) has wrong arg count. Expected {}, got {}",
                index,
                opcode.name(),
                expected,
                got
            ),
            VerifyError::MissingResult { index, opcode } => {
                write!(f, "Op {} ({}) has no result box", index, opcode.name())
            }
            VerifyError::UnexpectedResult { index, opcode } => {
                write!(f, "Op {} ({}) cannot produce a result", index, opcode.name())
            }
            VerifyError::ResultKind {
                index,
                expected,
                got,
            } => write!(
                f,
                "Op {} produces {:?} into a {:?} box",
                index, expected, got
            ),
            VerifyError::ArgKind { index, opcode } => {
                write!(f, "Op {} ({}) mixes argument kinds", index, opcode.name())
            }
            VerifyError::GuardWithoutDescr { index } => {
                write!(f, "Guard at op {} has no guard descriptor", index)
            }
            VerifyError::GuardWithoutFailArgs { index } => {
                write!(f, "Guard at op {} has no fail-args", index)
            }
            VerifyError::JumpWithoutToken { index } => {
                write!(f, "Jump at op {} has no loop token", index)
            }
            VerifyError::JumpArity { expected, got } => write!(
                f,
                "Jump has wrong arg count. Expected {}, got {}",
                expected, got
            ),
            VerifyError::JumpKind {
                position,
                expected,
                got,
            } => write!(
                f,
                "Jump arg {} is {:?} but the loop input is {:?}",
                position, got, expected
            ),
        }
    }
}

pub fn verify_trace(trace: &Trace) -> Result<(), VerifyError> {
    verify_ops(&trace.inputargs, &trace.operations, trace.token, &trace.inputargs)
}

/// Checks the preamble (which jumps into the body) and the body (which
/// jumps to itself). No box may be defined by both.
pub fn verify_loop(lp: &Loop) -> Result<(), VerifyError> {
    if let Some(preamble) = &lp.preamble {
        verify_ops(&preamble.inputargs, &preamble.operations, lp.token, &lp.inputargs)?;
        let defined: FxHashSet<BoxRef> = preamble
            .operations
            .iter()
            .filter_map(|op| op.result)
            .collect();
        for (index, op) in lp.operations.iter().enumerate() {
            if let Some(r) = op.result
                && defined.contains(&r)
            {
                return Err(VerifyError::DuplicateResult { index, value: r });
            }
        }
    }
    verify_ops(&lp.inputargs, &lp.operations, lp.token, &lp.inputargs)
}

/// `target_inputs` are the inputs a jump to `token` lands on.
pub fn verify_ops(
    inputargs: &[BoxRef],
    ops: &[Operation],
    token: LoopToken,
    target_inputs: &[BoxRef],
) -> Result<(), VerifyError> {
    let mut defined = FxHashSet::default();
    for b in inputargs {
        if !defined.insert(*b) {
            return Err(VerifyError::DuplicateInput(*b));
        }
    }

    let check_use = |defined: &FxHashSet<BoxRef>, index: usize, arg: Arg| match arg {
        Arg::Box(b) if !defined.contains(&b) => Err(VerifyError::UseBeforeDef { index, value: b }),
        _ => Ok(()),
    };

    let last = ops.len().checked_sub(1).ok_or(VerifyError::MissingTerminator)?;
    for (index, op) in ops.iter().enumerate() {
        if op.opnum.is_final() && index != last {
            return Err(VerifyError::MisplacedTerminator { index });
        }
        if let Some(expected) = op.opnum.arity()
            && op.args.len() != expected
        {
            return Err(VerifyError::BadArity {
                index,
                opcode: op.opnum,
                expected,
                got: op.args.len(),
            });
        }
        for arg in op.used_args() {
            check_use(&defined, index, arg)?;
        }
        // Both sides of these become interchangeable to the optimizer.
        let same_kind = match (op.opnum, op.args.as_slice(), op.result) {
            (Opcode::GuardValue, [a, b], _) => a.kind() == b.kind(),
            (Opcode::SameAs, [a], Some(r)) => a.kind() == r.kind,
            _ => true,
        };
        if !same_kind {
            return Err(VerifyError::ArgKind {
                index,
                opcode: op.opnum,
            });
        }

        if op.is_guard() {
            if !matches!(op.descr, Some(Descr::Guard(_))) {
                return Err(VerifyError::GuardWithoutDescr { index });
            }
            if op.fail_args.is_none() {
                return Err(VerifyError::GuardWithoutFailArgs { index });
            }
        }

        match op.result {
            Some(_) if !op.opnum.has_result() => {
                return Err(VerifyError::UnexpectedResult {
                    index,
                    opcode: op.opnum,
                });
            }
            Some(r) => {
                if let Some(expected) = op.opnum.result_kind()
                    && expected != r.kind
                {
                    return Err(VerifyError::ResultKind {
                        index,
                        expected,
                        got: r.kind,
                    });
                }
                if !defined.insert(r) {
                    return Err(VerifyError::DuplicateResult { index, value: r });
                }
            }
            None if op.opnum.has_result()
                && !matches!(op.opnum, Opcode::Call | Opcode::CallPure) =>
            {
                return Err(VerifyError::MissingResult {
                    index,
                    opcode: op.opnum,
                });
            }
            None => {}
        }
    }

    let terminator = &ops[last];
    match terminator.opnum {
        Opcode::Finish => Ok(()),
        Opcode::Jump => {
            let Some(target) = terminator.loop_token() else {
                return Err(VerifyError::JumpWithoutToken { index: last });
            };
            if target != token {
                return Ok(());
            }
            if terminator.args.len() != target_inputs.len() {
                return Err(VerifyError::JumpArity {
                    expected: target_inputs.len(),
                    got: terminator.args.len(),
                });
            }
            for (position, (arg, input)) in terminator.args.iter().zip(target_inputs).enumerate() {
                if arg.kind() != input.kind {
                    return Err(VerifyError::JumpKind {
                        position,
                        expected: input.kind,
                        got: arg.kind(),
                    });
                }
            }
            Ok(())
        }
        _ => Err(VerifyError::MissingTerminator),
    }
}
