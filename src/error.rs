use crate::utils::Span;
use std::env;
use std::fmt;
use std::io::IsTerminal;

pub type TJ<T> = Result<T, TJException>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TJCode {
    E0001,   // Unexpected Token
    E0002,   // Unknown Opcode
    E1001,   // Undefined Box
    E1002,   // Box Redefined
    E1003,   // Kind Mismatch
    E2001,   // Invalid Loop
    E3001,   // Verification Failure
    ICE9001, // Internal Compiler Error
}

impl TJCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E0001 => "E0001",
            Self::E0002 => "E0002",
            Self::E1001 => "E1001",
            Self::E1002 => "E1002",
            Self::E1003 => "E1003",
            Self::E2001 => "E2001",
            Self::E3001 => "E3001",
            Self::ICE9001 => "ICE9001",
        }
    }

    /// Internal errors abort the loop; the caller keeps interpreting it.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::ICE9001)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lex,
    Parse,
    Opt,
    Unroll,
    Verify,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub span: Option<Span>,
}

#[derive(Debug, Clone)]
pub struct TJException {
    pub module: &'static str,
    pub message: String,
    pub code: TJCode,
    pub stage: Stage,
    pub span: Option<Span>,
    pub stacktrace: Vec<Frame>,
    pub notes: Vec<String>,
    pub related: Vec<TJException>,
}

impl TJException {
    pub fn new(module: &'static str, code: TJCode, stage: Stage, msg: impl Into<String>) -> Self {
        Self {
            module,
            message: msg.into(),
            code,
            stage,
            span: None,
            stacktrace: Vec::new(),
            notes: Vec::new(),
            related: Vec::new(),
        }
    }

    pub fn ice(stage: Stage, msg: impl Into<String>) -> Self {
        Self::new("TJ.ICE", TJCode::ICE9001, stage, msg)
    }

    pub fn aggregate(
        module: &'static str,
        code: TJCode,
        stage: Stage,
        msg: impl Into<String>,
        related: Vec<TJException>,
    ) -> Self {
        let mut out = Self::new(module, code, stage, msg);
        out.related = related;
        out
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn push_frame(mut self, name: impl Into<String>, span: Option<Span>) -> Self {
        self.stacktrace.push(Frame {
            name: name.into(),
            span,
        });
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn display(&self, source: Option<&str>, file: Option<&str>) {
        let color = color_enabled_stderr();
        let palette = palette_for_module(self.module);
        let code_color = palette_for_tj_code(self.code.as_str(), palette.code);
        let file = file.unwrap_or("TJ");
        let at = if let Some(span) = self.span {
            format!("{}:{}:{}", file, span.start_line, span.start_col)
        } else {
            file.to_string()
        };
        eprintln!(
            "{}",
            style(
                color,
                palette.header,
                &format!("** ({}) {}", self.module, self.message),
            )
        );
        eprintln!(
            "{}",
            style(
                color,
                code_color,
                &format!("    error[{}]: {}", self.code.as_str(), self.message),
            )
        );
        eprintln!(
            "{}",
            style(
                color,
                palette.at,
                &format!("    at {} ({})", at, self.stage_name()),
            )
        );

        if !self.related.is_empty() {
            eprintln!(
                "{}",
                style(
                    color,
                    "1;93",
                    &format!("    found {} error(s)", self.related.len()),
                )
            );
            for (i, child) in self.related.iter().enumerate() {
                eprintln!(
                    "{}",
                    style(
                        color,
                        "1;93",
                        &format!("    [{}] ------------------------------", i + 1),
                    )
                );
                child.display(source, Some(file));
            }
            return;
        }

        if let Some(src) = source
            && let Some(span) = self.span
        {
            self.show_snippet(src, span, color);
        }

        if !self.stacktrace.is_empty() {
            eprintln!("{}", style(color, "1;95", "    stacktrace:"));
            for frame in self.stacktrace.iter().rev() {
                if let Some(span) = frame.span {
                    eprintln!(
                        "{}",
                        style(
                            color,
                            "2",
                            &format!(
                                "      (tj) {} at {}:{}:{}",
                                frame.name, file, span.start_line, span.start_col
                            ),
                        )
                    );
                } else {
                    eprintln!(
                        "{}",
                        style(color, "2", &format!("      (tj) {}", frame.name))
                    );
                }
            }
        }
        for n in &self.notes {
            eprintln!("{}", style(color, palette.hint, &format!("hint: {}", n)));
        }
    }

    fn stage_name(&self) -> &'static str {
        match self.stage {
            Stage::Lex => "Lex",
            Stage::Parse => "Parse",
            Stage::Opt => "Opt",
            Stage::Unroll => "Unroll",
            Stage::Verify => "Verify",
        }
    }

    fn show_snippet(&self, source: &str, span: Span, color: bool) {
        let lines: Vec<&str> = source.lines().collect();
        if span.start_line > 0 && span.start_line as usize <= lines.len() {
            let line_idx = (span.start_line - 1) as usize;
            let line = lines[line_idx];
            eprintln!(
                "{}",
                style(color, "2", &format!("{:>4} | {}", span.start_line, line))
            );
            let indent = " ".repeat(span.start_col as usize + 6);
            let caret = format!("{}^", indent);
            eprintln!(
                "{}",
                style(color, palette_for_module(self.module).caret, &caret)
            );
        }
    }
}

impl fmt::Display for TJException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) error[{}]: {}",
            self.module,
            self.code.as_str(),
            self.message
        )
    }
}

impl std::error::Error for TJException {}

struct ErrorPalette {
    header: &'static str,
    code: &'static str,
    at: &'static str,
    caret: &'static str,
    hint: &'static str,
}

fn palette_for_module(module: &str) -> ErrorPalette {
    if module.contains("ParseError") || module.contains("LexError") {
        ErrorPalette {
            header: "1;95",
            code: "1;35",
            at: "1;96",
            caret: "1;95",
            hint: "1;92",
        }
    } else if module.contains("OptError") {
        ErrorPalette {
            header: "1;96",
            code: "1;36",
            at: "1;96",
            caret: "1;96",
            hint: "1;92",
        }
    } else if module.contains("VerifyError") {
        ErrorPalette {
            header: "1;93",
            code: "1;33",
            at: "1;96",
            caret: "1;93",
            hint: "1;92",
        }
    } else if module.contains("ICE") {
        ErrorPalette {
            header: "1;97;41",
            code: "1;97;41",
            at: "1;96",
            caret: "1;97;41",
            hint: "1;92",
        }
    } else {
        ErrorPalette {
            header: "1;91",
            code: "1;93",
            at: "1;96",
            caret: "1;91",
            hint: "1;92",
        }
    }
}

fn palette_for_tj_code<'a>(code: &'a str, fallback: &'a str) -> &'a str {
    if code.starts_with("ICE") {
        "1;97;41"
    } else if code.starts_with("E0") {
        "1;35"
    } else if code.starts_with("E1") {
        "1;33"
    } else if code.starts_with("E2") {
        "1;31"
    } else {
        fallback
    }
}

fn color_enabled_stderr() -> bool {
    let no_color = env::var_os("NO_COLOR").is_some();
    let force_color = env::var_os("TJ_FORCE_COLOR").is_some();
    let is_tty = std::io::stderr().is_terminal();
    (is_tty && !no_color) || (force_color && !no_color)
}

fn style(color: bool, code: &str, text: &str) -> String {
    if color {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

#[macro_export]
macro_rules! bail {
    ($mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::TJException::new($mod, $code, $stage, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::TJException::new($mod, $code, $stage, format!($($arg)*)))
        }
    };
}

#[macro_export]
macro_rules! bail_at {
    ($span:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::TJException::new($mod, $code, $stage, format!($($arg)*)).at($span))
    };
}

#[macro_export]
macro_rules! ensure_at {
    ($cond:expr, $span:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::TJException::new($mod, $code, $stage, format!($($arg)*)).at($span))
        }
    };
}

pub trait TJCtx<T> {
    fn ctx(self, name: &'static str, span: Option<Span>) -> TJ<T>;
}

impl<T> TJCtx<T> for TJ<T> {
    fn ctx(self, name: &'static str, span: Option<Span>) -> TJ<T> {
        self.map_err(|e| e.push_frame(name, span))
    }
}
