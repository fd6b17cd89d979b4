#![no_main]

use libfuzzer_sys::fuzz_target;
use tj::syntax::parse_trace;
use tj::trace::logger::{self, LogOptions};
use tj::trace::verify::verify_loop;
use tj::trace::{OptConfig, TraceOptimizer};

fuzz_target!(|data: &[u8]| {
    let Ok(src) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(trace) = parse_trace(src) else {
        return;
    };

    let optimizer = TraceOptimizer::with_config(OptConfig::default());
    let lp = match optimizer.optimize_loop(trace) {
        Ok(lp) => lp,
        Err(e) if e.code.is_internal() => panic!("internal error on a verified trace: {}", e),
        Err(_) => return,
    };
    if let Err(e) = verify_loop(&lp) {
        panic!("optimized loop failed verification: {}", e);
    }
    let _ = logger::log_loop(&lp, &LogOptions { guard_numbers: true, snapshots: true });

    if lp.is_peeled() {
        let _ = optimizer.optimize_loop(lp.to_trace());
    }
});
