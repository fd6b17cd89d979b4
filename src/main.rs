use std::env;
use std::fs;
use std::io::{IsTerminal, Read};
use std::time::{Duration, Instant};
use tj::error::TJ;
use tj::syntax::parse_trace;
use tj::trace::logger::{self, LogOptions};
use tj::trace::{Loop, OptConfig, OptStats, TraceOptimizer};
use tracing_subscriber::EnvFilter;

struct CliLog {
    color: bool,
    detailed: bool,
}

impl CliLog {
    fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();
        let no_color = env::var_os("NO_COLOR").is_some();
        let force_color = env::var_os("TJ_FORCE_COLOR").is_some();
        let force_verbose = env::var_os("TJ_VERBOSE_LOG").is_some();
        Self {
            color: ((is_tty && !no_color) || (force_color && !no_color)),
            detailed: is_tty || force_verbose,
        }
    }

    fn style(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{}m{}\x1b[0m", code, text)
        } else {
            text.to_string()
        }
    }

    fn dim(&self, text: &str) -> String {
        self.style("2", text)
    }

    fn red_bold(&self, text: &str) -> String {
        self.style("1;91", text)
    }

    fn yellow_bold(&self, text: &str) -> String {
        self.style("1;93", text)
    }

    fn green_bold(&self, text: &str) -> String {
        self.style("1;92", text)
    }

    fn cyan_bold(&self, text: &str) -> String {
        self.style("1;96", text)
    }

    fn magenta_bold(&self, text: &str) -> String {
        self.style("1;95", text)
    }

    fn white_bold(&self, text: &str) -> String {
        self.style("1;97", text)
    }

    // Progress goes to stderr; stdout carries only the dump.
    fn banner(&self, input: &str) {
        if !self.detailed {
            return;
        }
        eprintln!("{} {}", self.yellow_bold("[+]"), self.red_bold("TJ trace optimizer"));
        eprintln!(
            " {} {}",
            self.dim("└─"),
            self.white_bold(&format!("Input: {}", input))
        );
    }

    fn step_start(&self, idx: usize, total: usize, title: &str, detail: &str) -> Instant {
        if self.detailed {
            let tag = format!("[{}/{}]", idx, total);
            eprintln!(
                "{} {} {} {}",
                self.cyan_bold("=>"),
                self.magenta_bold(&tag),
                self.red_bold(&format!("{:<16}", title)),
                self.yellow_bold(detail)
            );
        }
        Instant::now()
    }

    fn step_line_ok(&self, detail: &str) {
        if self.detailed {
            eprintln!("   {} {}", self.green_bold("✓"), self.white_bold(detail));
        }
    }

    fn success(&self, total: Duration) {
        if self.detailed {
            eprintln!(
                "{} {}",
                self.green_bold("✔"),
                self.green_bold(&format!("Optimized in {}", format_duration(total)))
            );
        }
    }

    fn error(&self, msg: &str) {
        eprintln!("{} {}", self.red_bold("x"), self.red_bold(msg));
    }
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

struct CliOptions {
    input_path: String,
    output_path: Option<String>,
    cfg: OptConfig,
    log: LogOptions,
    repeel: usize,
    stats: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TJ_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    let code = cmd_optimize(&args[1..]);
    if code != 0 {
        std::process::exit(code);
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  tj <trace-file|-> [options]");
    eprintln!("Options:");
    eprintln!("  -o <file>          Write the optimized dump to <file>");
    eprintln!("  --no-unroll        Do not peel the loop");
    eprintln!("  --no-virtuals      Disable allocation removal");
    eprintln!("  --no-rewrite       Disable folding, CSE and guard elimination");
    eprintln!("  --verify           Verify input and result after every phase");
    eprintln!("  --snapshots        Print guard snapshot chains");
    eprintln!("  --guard-numbers    Print guard descriptors");
    eprintln!("  --repeel <n>       Peel the resulting body <n> more times");
    eprintln!("  --stats            Print optimizer statistics");
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut opts = CliOptions {
        input_path: String::new(),
        output_path: None,
        cfg: OptConfig::from_env(),
        log: LogOptions::default(),
        repeel: 0,
        stats: false,
    };
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-o" => {
                i += 1;
                let path = args.get(i).ok_or("Missing output file after -o")?;
                opts.output_path = Some(path.clone());
            }
            "--no-unroll" => opts.cfg.unroll = false,
            "--no-virtuals" => opts.cfg.virtuals = false,
            "--no-rewrite" => opts.cfg.rewrite = false,
            "--verify" => opts.cfg.verify = true,
            "--snapshots" => opts.log.snapshots = true,
            "--guard-numbers" => opts.log.guard_numbers = true,
            "--stats" => opts.stats = true,
            "--repeel" => {
                i += 1;
                let n = args.get(i).ok_or("Missing count after --repeel")?;
                opts.repeel = n
                    .parse()
                    .map_err(|_| format!("Invalid --repeel count '{}'", n))?;
            }
            "-" => opts.input_path = arg.to_string(),
            _ if arg.starts_with('-') => return Err(format!("Unknown option '{}'", arg)),
            _ => opts.input_path = arg.to_string(),
        }
        i += 1;
    }
    if opts.input_path.is_empty() {
        return Err("Missing input trace".to_string());
    }
    Ok(opts)
}

fn read_input(path: &str) -> std::io::Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        fs::read_to_string(path)
    }
}

fn cmd_optimize(args: &[String]) -> i32 {
    let ui = CliLog::new();
    let opts = match parse_args(args) {
        Ok(o) => o,
        Err(msg) => {
            ui.error(&msg);
            print_usage();
            return 1;
        }
    };

    let input = match read_input(&opts.input_path) {
        Ok(s) => s,
        Err(e) => {
            ui.error(&format!(
                "Failed to read input file '{}': {}",
                opts.input_path, e
            ));
            return 1;
        }
    };

    ui.banner(&opts.input_path);
    let started = Instant::now();
    match optimize(&ui, &opts, &input) {
        Ok((lp, stats)) => {
            let dump = logger::log_loop(&lp, &opts.log);
            if let Some(out_path) = &opts.output_path {
                if let Err(e) = fs::write(out_path, &dump) {
                    ui.error(&format!("Failed to write output file '{}': {}", out_path, e));
                    return 1;
                }
            } else {
                print!("{}", dump);
            }
            if opts.stats {
                print_stats(&stats);
            }
            ui.success(started.elapsed());
            0
        }
        Err(e) => {
            e.display(Some(&input), Some(&opts.input_path));
            1
        }
    }
}

fn optimize(ui: &CliLog, opts: &CliOptions, input: &str) -> TJ<(Loop, OptStats)> {
    let total = 2 + opts.repeel;
    let t = ui.step_start(1, total, "Parse", &opts.input_path);
    let trace = parse_trace(input)?;
    ui.step_line_ok(&format!(
        "{} inputs, {} ops ({})",
        trace.inputargs.len(),
        trace.operations.len(),
        format_duration(t.elapsed())
    ));

    let optimizer = TraceOptimizer::with_config(opts.cfg);
    let t = ui.step_start(2, total, "Optimize", if opts.cfg.unroll { "peel" } else { "no peel" });
    let (mut lp, mut stats) = optimizer.optimize_loop_with_stats(trace)?;
    ui.step_line_ok(&format!(
        "{} -> {} ops ({})",
        stats.ops_in,
        stats.ops_out,
        format_duration(t.elapsed())
    ));

    for round in 0..opts.repeel {
        let t = ui.step_start(3 + round, total, "Re-peel", &format!("round {}", round + 1));
        let (next, next_stats) = optimizer.optimize_loop_with_stats(lp.to_trace())?;
        stats.accumulate(next_stats);
        lp = next;
        ui.step_line_ok(&format!(
            "{} body ops ({})",
            lp.operations.len(),
            format_duration(t.elapsed())
        ));
    }

    Ok((lp, stats))
}

fn print_stats(stats: &OptStats) {
    println!("# stats");
    println!("#   ops in/out      {} / {}", stats.ops_in, stats.ops_out);
    println!("#   preamble/body   {} / {}", stats.preamble_ops, stats.body_ops);
    println!("#   loop inputs     {} (+{} from fixup)", stats.inputargs, stats.fixup_inputs);
    println!("#   folded          {}", stats.folded);
    println!("#   cse hits        {}", stats.cse_hits);
    println!("#   guards removed  {}", stats.guards_removed);
    println!(
        "#   virtuals        {} created, {} forced",
        stats.virtuals_created, stats.virtuals_forced
    );
    println!("#   peeled          {}", stats.peeled);
}
