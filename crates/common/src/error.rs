use thiserror::Error;

#[derive(Debug, Error)]
pub enum RatekeeperError {
    #[error("token rate should not be negative")]
    NegativeTokenRate,

    #[error("token rate {token_rate} with burst size {burst_size} overflows the token counter")]
    TokenRateOverflow { token_rate: f64, burst_size: u64 },

    #[error("invalid limiter option: {0}")]
    InvalidOption(String),

    #[error("failed to spawn sweeper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type RatekeeperResult<T> = Result<T, RatekeeperError>;
