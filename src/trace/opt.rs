use crate::error::{Stage, TJ, TJCode, TJCtx, TJException};
use crate::trace::def::{
    Arg, BoxPool, BoxRef, Const, Kind, Loop, LoopToken, Operation, Preamble, Trace,
};
use crate::trace::logger;
use crate::trace::opcode::Opcode;
use crate::trace::snapshot::SnapshotRelinker;
use crate::trace::verify;
use crate::utils::{env_bool, env_usize};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

pub mod classify;
pub mod rewrite;
pub mod unroll;
pub mod value;
pub mod virtualize;

use value::{ValueId, ValueTable};

/// One stage of the emission pipeline. A pass receives every operation the
/// stage before it emitted and passes on what it keeps through
/// `Optimizer::emit_operation`.
pub trait Optimization {
    fn name(&self) -> &'static str;

    fn setup(&mut self, _opt: &mut Optimizer) {}

    fn propagate_forward(&mut self, op: Operation, opt: &mut Optimizer) -> TJ<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptConfig {
    pub unroll: bool,
    pub rewrite: bool,
    pub virtuals: bool,
    pub verify: bool,
    pub max_trace_ops: usize,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            unroll: true,
            rewrite: true,
            virtuals: true,
            verify: false,
            max_trace_ops: 100_000,
        }
    }
}

impl OptConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            unroll: env_bool("TJ_UNROLL", d.unroll),
            rewrite: !env_bool("TJ_DISABLE_REWRITE", !d.rewrite),
            virtuals: !env_bool("TJ_DISABLE_VIRTUALS", !d.virtuals),
            verify: env_bool("TJ_VERIFY_EACH_PHASE", d.verify),
            max_trace_ops: env_usize("TJ_MAX_TRACE_OPS", d.max_trace_ops),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptStats {
    pub ops_in: usize,
    pub ops_out: usize,
    pub preamble_ops: usize,
    pub body_ops: usize,
    pub inputargs: usize,
    pub fixup_inputs: usize,
    pub folded: usize,
    pub cse_hits: usize,
    pub guards_removed: usize,
    pub virtuals_created: usize,
    pub virtuals_forced: usize,
    pub peeled: usize,
}

impl OptStats {
    pub fn accumulate(&mut self, other: Self) {
        self.ops_in += other.ops_in;
        self.ops_out += other.ops_out;
        self.preamble_ops += other.preamble_ops;
        self.body_ops += other.body_ops;
        self.inputargs += other.inputargs;
        self.fixup_inputs += other.fixup_inputs;
        self.folded += other.folded;
        self.cse_hits += other.cse_hits;
        self.guards_removed += other.guards_removed;
        self.virtuals_created += other.virtuals_created;
        self.virtuals_forced += other.virtuals_forced;
        self.peeled += other.peeled;
    }
}

/// Key of an always-pure operation after its arguments were forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PureKey {
    pub opnum: Opcode,
    pub args: Vec<Arg>,
    pub descr: Option<String>,
    pub kind: Kind,
}

/// State of one optimizer invocation: the value table, the sink the passes
/// write into and the pass chain itself.
pub struct Optimizer {
    pub pool: BoxPool,
    pub token: LoopToken,
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
    pub values: ValueTable,
    pub pure_operations: FxHashMap<PureKey, ValueId>,
    pub newoperations: Vec<Operation>,
    pub exception_might_have_happened: bool,
    pub preamble: Option<Preamble>,
    pub stats: OptStats,
    // Snapshot chains already rewritten by the sink for the current list.
    pub sink_snapshots: SnapshotRelinker,
    passes: Vec<Option<Box<dyn Optimization>>>,
    cursor: usize,
}

impl Optimizer {
    pub fn new(trace: Trace, cfg: OptConfig) -> Self {
        let mut passes: Vec<Option<Box<dyn Optimization>>> = Vec::new();
        if cfg.unroll {
            passes.push(Some(Box::new(unroll::TraceUnroller::new())));
        }
        if cfg.rewrite {
            passes.push(Some(Box::new(rewrite::TraceRewriter::new())));
        }
        if cfg.virtuals {
            passes.push(Some(Box::new(virtualize::TraceVirtualizer::new())));
        }
        Self::with_passes(trace, passes)
    }

    pub fn with_passes(trace: Trace, passes: Vec<Option<Box<dyn Optimization>>>) -> Self {
        let stats = OptStats {
            ops_in: trace.operations.len(),
            ..OptStats::default()
        };
        Self {
            pool: trace.pool,
            token: trace.token,
            inputargs: trace.inputargs,
            operations: trace.operations,
            values: ValueTable::new(),
            pure_operations: FxHashMap::default(),
            newoperations: Vec::new(),
            exception_might_have_happened: false,
            preamble: None,
            stats,
            sink_snapshots: SnapshotRelinker::sharing(),
            passes,
            cursor: 0,
        }
    }

    pub fn propagate_all_forward(&mut self) -> TJ<()> {
        for i in 0..self.passes.len() {
            let Some(mut pass) = self.passes[i].take() else {
                return Err(TJException::ice(Stage::Opt, format!("pass #{} missing at setup", i)));
            };
            pass.setup(self);
            self.passes[i] = Some(pass);
        }
        let ops = std::mem::take(&mut self.operations);
        for op in ops {
            self.send(0, op)?;
        }
        Ok(())
    }

    /// Hands `op` to the pass after the one currently running.
    pub fn emit_operation(&mut self, op: Operation) -> TJ<()> {
        self.send(self.cursor + 1, op)
    }

    fn send(&mut self, stage: usize, op: Operation) -> TJ<()> {
        if stage >= self.passes.len() {
            self.emit_to_sink(op);
            return Ok(());
        }
        let Some(mut pass) = self.passes[stage].take() else {
            return Err(TJException::ice(
                Stage::Opt,
                format!("pass #{} re-entered while it was running", stage),
            ));
        };
        let saved = self.cursor;
        self.cursor = stage;
        let res = pass.propagate_forward(op, self).ctx(pass.name(), None);
        self.cursor = saved;
        self.passes[stage] = Some(pass);
        res
    }

    /// Appends `op` to the current list after replacing every box it reads,
    /// snapshot entries included, by the box its value lives in. Virtuals
    /// reached this way are forced in front of `op`.
    fn emit_to_sink(&mut self, mut op: Operation) {
        for arg in op.args.iter_mut() {
            *arg = self.forwarded(*arg);
        }
        if let Some(fail_args) = op.fail_args.as_mut() {
            for arg in fail_args.iter_mut() {
                *arg = self.forwarded(*arg);
            }
        }
        if let Some(descr) = op.guard_descr_mut() {
            let values = &mut self.values;
            let out = &mut self.newoperations;
            descr.snapshot = self
                .sink_snapshots
                .relink(descr.snapshot.as_ref(), |a| forward_arg(values, out, a));
        }
        trace!(target: "tj::sink", opnum = op.opnum.name(), "emit");
        self.newoperations.push(op);
    }

    fn forwarded(&mut self, arg: Arg) -> Arg {
        forward_arg(&mut self.values, &mut self.newoperations, arg)
    }

    pub fn getvalue(&mut self, arg: Arg) -> ValueId {
        self.values.getvalue(arg)
    }

    pub fn get_constant(&mut self, arg: Arg) -> Option<Const> {
        let vid = self.getvalue(arg);
        self.values.get(vid).get_constant()
    }

    /// Materializes a value into the current output list.
    pub fn force_box(&mut self, vid: ValueId) -> Arg {
        self.values.force_box(vid, &mut self.newoperations)
    }

    pub fn finish(self, name: String) -> (Loop, OptStats) {
        let mut stats = self.stats;
        stats.preamble_ops = self.preamble.as_ref().map_or(0, |p| p.operations.len());
        stats.body_ops = self.newoperations.len();
        stats.ops_out = stats.preamble_ops + stats.body_ops;
        stats.inputargs = self.inputargs.len();
        stats.virtuals_forced = self.values.forced;
        stats.peeled = usize::from(self.preamble.is_some());
        let lp = Loop {
            name,
            token: self.token,
            inputargs: self.inputargs,
            operations: self.newoperations,
            preamble: self.preamble,
            pool: self.pool,
        };
        (lp, stats)
    }
}

fn forward_arg(values: &mut ValueTable, out: &mut Vec<Operation>, arg: Arg) -> Arg {
    match arg {
        Arg::Box(b) => match values.lookup(b) {
            Some(vid) => values.force_box(vid, out),
            None => arg,
        },
        Arg::Const(_) => arg,
    }
}

pub struct TraceOptimizer {
    cfg: OptConfig,
}

impl Default for TraceOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceOptimizer {
    pub fn new() -> Self {
        Self {
            cfg: OptConfig::from_env(),
        }
    }

    pub fn with_config(cfg: OptConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &OptConfig {
        &self.cfg
    }

    fn verify_or_panic(lp: &Loop, stage: &str) {
        if let Err(e) = verify::verify_loop(lp) {
            panic!("Trace Verification Failed at {}: {}\nLoop: {}", stage, e, lp.name);
        }
    }

    pub fn optimize_loop(&self, trace: Trace) -> TJ<Loop> {
        self.optimize_loop_with_stats(trace).map(|(lp, _)| lp)
    }

    pub fn optimize_loop_with_stats(&self, trace: Trace) -> TJ<(Loop, OptStats)> {
        if trace.operations.len() > self.cfg.max_trace_ops {
            warn!(
                target: "tj::opt",
                ops = trace.operations.len(),
                limit = self.cfg.max_trace_ops,
                "trace too long, giving up"
            );
            return Err(TJException::new(
                "TJ.OptError",
                TJCode::E2001,
                Stage::Opt,
                format!(
                    "trace has {} operations, the limit is {}",
                    trace.operations.len(),
                    self.cfg.max_trace_ops
                ),
            )
            .note("raise TJ_MAX_TRACE_OPS to optimize longer traces"));
        }
        if let Err(e) = verify::verify_trace(&trace) {
            return Err(TJException::new(
                "TJ.VerifyError",
                TJCode::E3001,
                Stage::Verify,
                format!("malformed input trace: {}", e),
            ));
        }
        if tracing::enabled!(target: "tj::jit-log-noopt-loop", tracing::Level::DEBUG) {
            debug!(target: "tj::jit-log-noopt-loop", "\n{}", logger::log_trace(&trace));
        }

        let name = trace.name.clone();
        let mut opt = Optimizer::new(trace, self.cfg);
        if let Err(e) = opt.propagate_all_forward() {
            warn!(target: "tj::opt", loop_name = %name, error = %e, "optimization abandoned");
            return Err(e);
        }
        let (lp, stats) = opt.finish(name);

        if self.cfg.verify {
            Self::verify_or_panic(&lp, "End");
        }
        if tracing::enabled!(target: "tj::jit-log-opt-loop", tracing::Level::DEBUG) {
            let dump = logger::log_loop(&lp, &logger::LogOptions::default());
            debug!(target: "tj::jit-log-opt-loop", "\n{}", dump);
        }
        debug!(
            target: "tj::opt",
            loop_name = %lp.name,
            ops_in = stats.ops_in,
            ops_out = stats.ops_out,
            peeled = lp.is_peeled(),
            "loop optimized"
        );
        Ok((lp, stats))
    }
}
