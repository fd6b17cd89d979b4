#![no_main]

use libfuzzer_sys::fuzz_target;
use tj::syntax::parse::Parser;

fuzz_target!(|data: &[u8]| {
    let Ok(src) = std::str::from_utf8(data) else {
        return;
    };
    let mut parser = Parser::new(src);
    let _ = parser.parse_trace();
});
