//! Asynchronous PostgreSQL client using Tokio.

mod conn;
mod notifies;
mod pipeline;
mod wait;

pub use conn::Conn;
pub use notifies::Notifies;
pub use pipeline::Pipeline;
