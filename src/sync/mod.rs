//! Synchronous PostgreSQL client.

mod conn;
mod notifies;
mod pipeline;
mod wait;

pub use conn::Conn;
pub use notifies::Notifies;
pub use pipeline::Pipeline;
