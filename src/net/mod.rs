//! Socket transport and readiness polling.
mod socket;
mod readiness;
mod timed;

pub use socket::Socket;
pub use readiness::Readiness;
pub use timed::{Timed, timed};
