//! Turn-taking session logic and the async coordinator that drives it.

pub mod coordinator;
pub mod messages;
pub mod session;
pub mod transcript;
