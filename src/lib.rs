//! pubgate - HTTP publish gateway with pooled broker connections and bounded retry

pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod gateway;
pub mod pool;
pub mod publish;

pub use crate::core::Core;
pub use crate::config::Config;
pub use crate::publish::{ErrorKind, PublishOutcome, PublishRequest, Publisher, RetryPolicy};
