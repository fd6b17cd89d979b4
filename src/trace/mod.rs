pub mod def;
pub mod logger;
pub mod opcode;
pub mod opt;
pub mod snapshot;
pub mod verify;

pub use def::*;
pub use opt::{OptConfig, OptStats, TraceOptimizer};
