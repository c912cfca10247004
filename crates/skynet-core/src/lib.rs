pub mod config;
pub mod error;
pub mod limiter;
pub mod types;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use limiter::SlidingWindowLimiter;
