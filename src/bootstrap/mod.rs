mod server;
mod shutdown;

pub use server::{Running, Server};
pub use shutdown::{DrainGuard, ShutdownManager, ShutdownState};
