//! In-process delivery service
//!
//! Moves bytes over HTTP itself instead of delegating to the agent. Used when
//! no agent is installed and as the backend of the integration tests.

mod arbiter;
mod manager;
mod rate_limiter;
mod transfer;

pub use arbiter::*;
pub use manager::*;
pub use rate_limiter::*;
pub(crate) use transfer::{Transfer, TransferTask};
