mod control;
mod negotiator;

pub use control::*;
pub use negotiator::*;
