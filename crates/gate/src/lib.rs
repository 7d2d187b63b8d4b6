//! Per-endpoint rate limiting on top of [`RateLimiter`].
//!
//! Each configured endpoint owns a limiter keyed by client. Requests are
//! routed to an endpoint by the longest matching path prefix; paths that
//! match nothing share the default limiter.

use ratekeeper_common::{AppConfig, RatekeeperResult};
use ratekeeper_rate_limit::RateLimiter;
use tracing::{debug, info};

/// Outcome of [`EndpointLimiters::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Over the limit of the named endpoint (`default` for unmatched paths).
    Limited { endpoint: String },
}

struct Endpoint {
    name: String,
    path_prefix: String,
    limiter: RateLimiter,
}

pub struct EndpointLimiters {
    endpoints: Vec<Endpoint>,
    default: RateLimiter,
}

impl EndpointLimiters {
    /// Build one limiter per endpoint plus the default limiter.
    pub fn from_config(config: &AppConfig) -> RatekeeperResult<Self> {
        let default = RateLimiter::from_config(&config.default, &config.limiter)?;

        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let limit = config.limit_for(endpoint);
            info!(
                endpoint = %endpoint.name,
                path_prefix = %endpoint.path_prefix,
                token_rate = limit.token_rate,
                burst_size = limit.burst_size,
                "endpoint rate limit configured"
            );
            endpoints.push(Endpoint {
                name: endpoint.name.clone(),
                path_prefix: endpoint.path_prefix.clone(),
                limiter: RateLimiter::from_config(&limit, &config.limiter)?,
            });
        }

        Ok(Self {
            endpoints,
            default,
        })
    }

    fn find_endpoint(&self, path: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| path.starts_with(&e.path_prefix))
            .max_by_key(|e| e.path_prefix.len())
    }

    /// Check a request from `client` against the endpoint serving `path`.
    pub fn check(&self, path: &str, client: &str) -> Decision {
        let (name, limiter) = match self.find_endpoint(path) {
            Some(endpoint) => (endpoint.name.as_str(), &endpoint.limiter),
            None => ("default", &self.default),
        };

        if limiter.allow(client) {
            Decision::Allowed
        } else {
            debug!(endpoint = name, client, path, "request rate limited");
            Decision::Limited {
                endpoint: name.to_string(),
            }
        }
    }

    /// Stop background eviction on every limiter.
    pub fn close(&self) {
        self.default.close();
        for endpoint in &self.endpoints {
            endpoint.limiter.close();
        }
    }
}
