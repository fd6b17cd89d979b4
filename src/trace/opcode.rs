use crate::trace::def::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Pure integer arithmetic
    IntAdd,
    IntSub,
    IntMul,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    IntNeg,
    IntIsTrue,

    // Pure float arithmetic
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatNeg,
    FloatLt,

    // Other pure operations
    SameAs,
    ArraylenGc,
    GetfieldGcPure,
    CallPure,

    // Guards
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardNonnull,
    GuardIsnull,
    GuardClass,
    GuardNoException,

    // Heap and calls
    New,
    GetfieldGc,
    SetfieldGc,
    Call,

    // Control
    DebugMergePoint,
    Jump,
    Finish,
}

const ALL: &[Opcode] = &[
    Opcode::IntAdd,
    Opcode::IntSub,
    Opcode::IntMul,
    Opcode::IntAnd,
    Opcode::IntOr,
    Opcode::IntXor,
    Opcode::IntLshift,
    Opcode::IntRshift,
    Opcode::IntLt,
    Opcode::IntLe,
    Opcode::IntEq,
    Opcode::IntNe,
    Opcode::IntGt,
    Opcode::IntGe,
    Opcode::IntNeg,
    Opcode::IntIsTrue,
    Opcode::FloatAdd,
    Opcode::FloatSub,
    Opcode::FloatMul,
    Opcode::FloatNeg,
    Opcode::FloatLt,
    Opcode::SameAs,
    Opcode::ArraylenGc,
    Opcode::GetfieldGcPure,
    Opcode::CallPure,
    Opcode::GuardTrue,
    Opcode::GuardFalse,
    Opcode::GuardValue,
    Opcode::GuardNonnull,
    Opcode::GuardIsnull,
    Opcode::GuardClass,
    Opcode::GuardNoException,
    Opcode::New,
    Opcode::GetfieldGc,
    Opcode::SetfieldGc,
    Opcode::Call,
    Opcode::DebugMergePoint,
    Opcode::Jump,
    Opcode::Finish,
];

impl Opcode {
    pub fn all() -> &'static [Opcode] {
        ALL
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::IntAdd => "int_add",
            Self::IntSub => "int_sub",
            Self::IntMul => "int_mul",
            Self::IntAnd => "int_and",
            Self::IntOr => "int_or",
            Self::IntXor => "int_xor",
            Self::IntLshift => "int_lshift",
            Self::IntRshift => "int_rshift",
            Self::IntLt => "int_lt",
            Self::IntLe => "int_le",
            Self::IntEq => "int_eq",
            Self::IntNe => "int_ne",
            Self::IntGt => "int_gt",
            Self::IntGe => "int_ge",
            Self::IntNeg => "int_neg",
            Self::IntIsTrue => "int_is_true",
            Self::FloatAdd => "float_add",
            Self::FloatSub => "float_sub",
            Self::FloatMul => "float_mul",
            Self::FloatNeg => "float_neg",
            Self::FloatLt => "float_lt",
            Self::SameAs => "same_as",
            Self::ArraylenGc => "arraylen_gc",
            Self::GetfieldGcPure => "getfield_gc_pure",
            Self::CallPure => "call_pure",
            Self::GuardTrue => "guard_true",
            Self::GuardFalse => "guard_false",
            Self::GuardValue => "guard_value",
            Self::GuardNonnull => "guard_nonnull",
            Self::GuardIsnull => "guard_isnull",
            Self::GuardClass => "guard_class",
            Self::GuardNoException => "guard_no_exception",
            Self::New => "new",
            Self::GetfieldGc => "getfield_gc",
            Self::SetfieldGc => "setfield_gc",
            Self::Call => "call",
            Self::DebugMergePoint => "debug_merge_point",
            Self::Jump => "jump",
            Self::Finish => "finish",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Fixed argument count, or `None` for variadic operations.
    pub fn arity(self) -> Option<usize> {
        match self {
            Self::IntAdd
            | Self::IntSub
            | Self::IntMul
            | Self::IntAnd
            | Self::IntOr
            | Self::IntXor
            | Self::IntLshift
            | Self::IntRshift
            | Self::IntLt
            | Self::IntLe
            | Self::IntEq
            | Self::IntNe
            | Self::IntGt
            | Self::IntGe
            | Self::FloatAdd
            | Self::FloatSub
            | Self::FloatMul
            | Self::FloatLt
            | Self::GuardValue
            | Self::GuardClass
            | Self::SetfieldGc => Some(2),
            Self::IntNeg
            | Self::IntIsTrue
            | Self::FloatNeg
            | Self::SameAs
            | Self::ArraylenGc
            | Self::GetfieldGcPure
            | Self::GetfieldGc
            | Self::GuardTrue
            | Self::GuardFalse
            | Self::GuardNonnull
            | Self::GuardIsnull => Some(1),
            Self::New | Self::GuardNoException => Some(0),
            Self::CallPure | Self::Call | Self::DebugMergePoint | Self::Jump | Self::Finish => {
                None
            }
        }
    }

    /// Kind of the produced box, `None` for operations without a result.
    /// Calls return whatever their result box says.
    pub fn result_kind(self) -> Option<Kind> {
        match self {
            Self::IntAdd
            | Self::IntSub
            | Self::IntMul
            | Self::IntAnd
            | Self::IntOr
            | Self::IntXor
            | Self::IntLshift
            | Self::IntRshift
            | Self::IntLt
            | Self::IntLe
            | Self::IntEq
            | Self::IntNe
            | Self::IntGt
            | Self::IntGe
            | Self::IntNeg
            | Self::IntIsTrue
            | Self::FloatLt
            | Self::ArraylenGc => Some(Kind::Int),
            Self::FloatAdd | Self::FloatSub | Self::FloatMul | Self::FloatNeg => {
                Some(Kind::Float)
            }
            Self::New => Some(Kind::Ref),
            _ => None,
        }
    }

    pub fn has_result(self) -> bool {
        !self.is_guard()
            && !matches!(
                self,
                Self::SetfieldGc | Self::DebugMergePoint | Self::Jump | Self::Finish
            )
    }

    pub fn is_guard(self) -> bool {
        matches!(
            self,
            Self::GuardTrue
                | Self::GuardFalse
                | Self::GuardValue
                | Self::GuardNonnull
                | Self::GuardIsnull
                | Self::GuardClass
                | Self::GuardNoException
        )
    }

    /// Result depends only on the arguments; safe to fold and CSE.
    pub fn is_always_pure(self) -> bool {
        matches!(
            self,
            Self::IntAdd
                | Self::IntSub
                | Self::IntMul
                | Self::IntAnd
                | Self::IntOr
                | Self::IntXor
                | Self::IntLshift
                | Self::IntRshift
                | Self::IntLt
                | Self::IntLe
                | Self::IntEq
                | Self::IntNe
                | Self::IntGt
                | Self::IntGe
                | Self::IntNeg
                | Self::IntIsTrue
                | Self::FloatAdd
                | Self::FloatSub
                | Self::FloatMul
                | Self::FloatNeg
                | Self::FloatLt
                | Self::SameAs
                | Self::ArraylenGc
                | Self::GetfieldGcPure
                | Self::CallPure
        )
    }

    /// No observable effect when executed; may still read the heap.
    pub fn has_no_side_effect(self) -> bool {
        self.is_always_pure() || matches!(self, Self::GetfieldGc | Self::New)
    }

    pub fn is_allocation(self) -> bool {
        matches!(self, Self::New)
    }

    pub fn can_raise(self) -> bool {
        matches!(self, Self::Call)
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Jump | Self::Finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for op in Opcode::all() {
            assert_eq!(Opcode::from_name(op.name()), Some(*op));
        }
        assert_eq!(Opcode::from_name("int_frobnicate"), None);
    }

    #[test]
    fn guards_have_no_result() {
        for op in Opcode::all() {
            if op.is_guard() {
                assert!(!op.has_result(), "{} must not produce a box", op.name());
                assert!(!op.is_always_pure(), "{} must not be CSE'd", op.name());
            }
        }
    }
}
