use crate::trace::opcode::Opcode;
use crate::trace::snapshot::Snapshot;
use std::fmt;
use std::sync::Arc;

pub type BoxId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Ref,
    Float,
}

impl Kind {
    pub fn prefix(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Ref => 'p',
            Self::Float => 'f',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Int),
            'p' => Some(Self::Ref),
            'f' => Some(Self::Float),
            _ => None,
        }
    }
}

/// A run-time value that is not known while compiling. Two boxes are the
/// same value only if they have the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxRef {
    pub id: BoxId,
    pub kind: Kind,
}

impl fmt::Debug for BoxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

/// A compile-time value, compared by value. Floats keep their bit pattern so
/// that constants stay hashable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Const {
    Int(i64),
    Ref(u64),
    Float(u64),
}

impl Const {
    pub fn float(v: f64) -> Self {
        Self::Float(v.to_bits())
    }

    pub fn zero(kind: Kind) -> Self {
        match kind {
            Kind::Int => Self::Int(0),
            Kind::Ref => Self::Ref(0),
            Kind::Float => Self::float(0.0),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Self::Int(_) => Kind::Int,
            Self::Ref(_) => Kind::Ref,
            Self::Float(_) => Kind::Float,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Self::Int(v) => *v != 0,
            Self::Ref(addr) => *addr != 0,
            Self::Float(bits) => f64::from_bits(*bits) != 0.0,
        }
    }
}

impl fmt::Debug for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Ref(addr) => write!(f, "ConstPtr({})", addr),
            Self::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    Box(BoxRef),
    Const(Const),
}

impl Arg {
    pub fn as_box(self) -> Option<BoxRef> {
        match self {
            Self::Box(b) => Some(b),
            Self::Const(_) => None,
        }
    }

    pub fn as_const(self) -> Option<Const> {
        match self {
            Self::Const(c) => Some(c),
            Self::Box(_) => None,
        }
    }

    pub fn is_const(self) -> bool {
        matches!(self, Self::Const(_))
    }

    pub fn kind(self) -> Kind {
        match self {
            Self::Box(b) => b.kind,
            Self::Const(c) => c.kind(),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Box(b) => b.fmt(f),
            Self::Const(c) => c.fmt(f),
        }
    }
}

impl From<BoxRef> for Arg {
    fn from(b: BoxRef) -> Self {
        Self::Box(b)
    }
}

impl From<Const> for Arg {
    fn from(c: Const) -> Self {
        Self::Const(c)
    }
}

/// Identity of a compiled loop. Jumps name their target through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopToken(pub u32);

impl fmt::Display for LoopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loop{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardDescr {
    pub number: u32,
    pub snapshot: Option<Arc<Snapshot>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descr {
    Loop(LoopToken),
    Guard(GuardDescr),
    Field(String),
    Size(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub opnum: Opcode,
    pub args: Vec<Arg>,
    pub result: Option<BoxRef>,
    pub descr: Option<Descr>,
    // Only guards carry fail-args.
    pub fail_args: Option<Vec<Arg>>,
}

impl Operation {
    pub fn new(opnum: Opcode, args: Vec<Arg>, result: Option<BoxRef>) -> Self {
        Self {
            opnum,
            args,
            result,
            descr: None,
            fail_args: None,
        }
    }

    pub fn with_descr(mut self, descr: Descr) -> Self {
        self.descr = Some(descr);
        self
    }

    pub fn with_fail_args(mut self, fail_args: Vec<Arg>) -> Self {
        self.fail_args = Some(fail_args);
        self
    }

    pub fn is_guard(&self) -> bool {
        self.opnum.is_guard()
    }

    pub fn loop_token(&self) -> Option<LoopToken> {
        match &self.descr {
            Some(Descr::Loop(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn guard_descr(&self) -> Option<&GuardDescr> {
        match &self.descr {
            Some(Descr::Guard(d)) => Some(d),
            _ => None,
        }
    }

    pub fn guard_descr_mut(&mut self) -> Option<&mut GuardDescr> {
        match &mut self.descr {
            Some(Descr::Guard(d)) => Some(d),
            _ => None,
        }
    }

    /// Name of a field or size descriptor, used to key pure operations.
    pub fn descr_name(&self) -> Option<&str> {
        match &self.descr {
            Some(Descr::Field(name)) | Some(Descr::Size(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Arguments, fail-args and snapshot entries: everything a backend has to
    /// keep alive.
    pub fn used_args(&self) -> impl Iterator<Item = Arg> + '_ {
        let frames = self
            .guard_descr()
            .and_then(|g| g.snapshot.as_deref())
            .into_iter()
            .flat_map(|s| s.frames())
            .flat_map(|f| f.boxes.iter());
        self.args
            .iter()
            .chain(self.fail_args.iter().flatten())
            .chain(frames)
            .copied()
    }
}

/// Allocator for box ids, guard numbers and loop tokens of one compilation.
#[derive(Debug, Clone, Default)]
pub struct BoxPool {
    next_box: BoxId,
    next_guard: u32,
    next_token: u32,
}

impl BoxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_box(&mut self, kind: Kind) -> BoxRef {
        let id = self.next_box;
        self.next_box += 1;
        BoxRef { id, kind }
    }

    /// Same kind, new identity.
    pub fn clone_box(&mut self, b: BoxRef) -> BoxRef {
        self.fresh_box(b.kind)
    }

    pub fn fresh_guard_number(&mut self) -> u32 {
        let n = self.next_guard;
        self.next_guard += 1;
        n
    }

    pub fn fresh_token(&mut self) -> LoopToken {
        let n = self.next_token;
        self.next_token += 1;
        LoopToken(n)
    }
}

/// A recorded loop as handed over by the tracer: inputs, a flat operation
/// list, and (normally) a final jump back to `token`.
#[derive(Debug, Clone)]
pub struct Trace {
    pub name: String,
    pub token: LoopToken,
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
    pub pool: BoxPool,
}

impl Trace {
    pub fn new(name: impl Into<String>) -> Self {
        let mut pool = BoxPool::new();
        let token = pool.fresh_token();
        Self {
            name: name.into(),
            token,
            inputargs: Vec::new(),
            operations: Vec::new(),
            pool,
        }
    }

    pub fn input(&mut self, kind: Kind) -> BoxRef {
        let b = self.pool.fresh_box(kind);
        self.inputargs.push(b);
        b
    }

    pub fn record(&mut self, opnum: Opcode, args: Vec<Arg>, kind: Kind) -> BoxRef {
        let result = self.pool.fresh_box(kind);
        self.operations
            .push(Operation::new(opnum, args, Some(result)));
        result
    }

    pub fn record_with_descr(
        &mut self,
        opnum: Opcode,
        args: Vec<Arg>,
        kind: Option<Kind>,
        descr: Descr,
    ) -> Option<BoxRef> {
        let result = kind.map(|k| self.pool.fresh_box(k));
        self.operations
            .push(Operation::new(opnum, args, result).with_descr(descr));
        result
    }

    /// Records a guard whose snapshot is a single frame holding the fail-args.
    pub fn record_guard(&mut self, opnum: Opcode, args: Vec<Arg>, fail_args: Vec<Arg>) {
        let snapshot = Snapshot::new(None, fail_args.clone());
        self.record_guard_with_snapshot(opnum, args, fail_args, Some(snapshot));
    }

    pub fn record_guard_with_snapshot(
        &mut self,
        opnum: Opcode,
        args: Vec<Arg>,
        fail_args: Vec<Arg>,
        snapshot: Option<Arc<Snapshot>>,
    ) {
        let number = self.pool.fresh_guard_number();
        self.operations.push(
            Operation::new(opnum, args, None)
                .with_descr(Descr::Guard(GuardDescr { number, snapshot }))
                .with_fail_args(fail_args),
        );
    }

    /// Appends the jump back to this trace's own header.
    pub fn close_loop(&mut self, args: Vec<Arg>) {
        self.operations
            .push(Operation::new(Opcode::Jump, args, None).with_descr(Descr::Loop(self.token)));
    }
}

#[derive(Debug, Clone)]
pub struct Preamble {
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
}

/// Result of optimizing a trace. When peeling happened, `preamble` runs once
/// and ends with a jump into `operations`, which loops on `inputargs`.
#[derive(Debug, Clone)]
pub struct Loop {
    pub name: String,
    pub token: LoopToken,
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
    pub preamble: Option<Preamble>,
    pub pool: BoxPool,
}

impl Loop {
    pub fn is_peeled(&self) -> bool {
        self.preamble.is_some()
    }

    pub fn jump(&self) -> Option<&Operation> {
        self.operations
            .last()
            .filter(|op| op.opnum == Opcode::Jump)
    }

    /// The peeled body seen as a fresh recording, for retracing an
    /// already-optimized loop.
    pub fn to_trace(&self) -> Trace {
        Trace {
            name: self.name.clone(),
            token: self.token,
            inputargs: self.inputargs.clone(),
            operations: self.operations.clone(),
            pool: self.pool.clone(),
        }
    }
}
