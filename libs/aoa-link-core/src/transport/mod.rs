mod buffer_pool;
mod channel;
mod envelope;
mod handler;
mod transporter;

pub use buffer_pool::*;
pub use channel::*;
pub use envelope::*;
pub use handler::*;
pub use transporter::*;
