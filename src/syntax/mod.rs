pub mod lex;
pub mod parse;
pub mod token;

use crate::error::TJ;
use crate::trace::def::Trace;

pub fn parse_trace(src: &str) -> TJ<Trace> {
    parse::Parser::new(src).parse_trace()
}
