//! Types shared across the ratekeeper crates: the error enum and the YAML
//! configuration model.

pub mod config;
pub mod error;

pub use config::{AppConfig, EndpointConfig, LimiterConfig, RateLimitConfig};
pub use error::{RatekeeperError, RatekeeperResult};
