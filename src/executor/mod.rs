//! Executors for work that does not need a document bundle

mod scheduled;
mod unbounded;

pub use scheduled::{ScheduledExecutor, ScheduledTask};
pub use unbounded::UnboundedExecutor;
