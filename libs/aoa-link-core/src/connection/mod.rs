mod backend;
mod manager;

pub use backend::*;
pub use manager::*;
