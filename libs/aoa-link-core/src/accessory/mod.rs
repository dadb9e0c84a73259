mod descriptor;
mod identity;

pub use descriptor::*;
pub use identity::*;
