//! mailflow: rule-driven mailbox processing core.

pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod store;
