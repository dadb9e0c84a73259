mod backend;
mod bulk;
pub mod discovery;
pub mod error;

pub use backend::*;
pub use bulk::*;
