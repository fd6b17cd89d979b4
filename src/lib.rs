pub mod error;
pub mod syntax;
pub mod trace;
pub mod utils;
