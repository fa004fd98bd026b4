//! Route lookup.
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order, ties broken by longer path prefix
//! - Explicit no-match rather than silent default

use std::sync::Arc;

use crate::config::{RateLimitConfig, RouteConfig};
use crate::routing::matcher::{AllOf, HostMatcher, Matcher, PathPrefixMatcher, RequestTarget};
use crate::security::rate_limit::{BucketParams, RateLimiter};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub backend_group: String,
    pub priority: u32,
    /// Limiter applied before forwarding; `None` bypasses rate limiting.
    pub limiter: Option<Arc<RateLimiter>>,
    matcher: AllOf,
    prefix_len: usize,
}

impl Route {
    pub fn matches(&self, target: &RequestTarget<'_>) -> bool {
        self.matcher.matches(target)
    }
}

/// Ordered set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Compile routes. Returns the table and every distinct limiter it uses, for sweeping.
    pub fn from_config(
        routes: &[RouteConfig],
        rate_limit: &RateLimitConfig,
    ) -> (Self, Vec<Arc<RateLimiter>>) {
        let shared = Arc::new(RateLimiter::from_config(rate_limit));
        let mut limiters = Vec::new();
        let mut shared_used = false;

        let mut compiled: Vec<Route> = routes
            .iter()
            .map(|config| {
                let limiter = if !rate_limit.enabled || !config.rate_limited {
                    None
                } else if let Some(params) = config.rate_limit {
                    let limiter =
                        Arc::new(RateLimiter::with_params(BucketParams::from(params), rate_limit));
                    limiters.push(limiter.clone());
                    Some(limiter)
                } else {
                    shared_used = true;
                    Some(shared.clone())
                };

                let prefix = PathPrefixMatcher::new(config.path_prefix.clone());
                let prefix_len = prefix.len();
                let mut matchers: Vec<Box<dyn Matcher>> = vec![Box::new(prefix)];
                if let Some(host) = &config.host {
                    matchers.push(Box::new(HostMatcher::new(host.clone())));
                }

                Route {
                    name: config.name.clone(),
                    backend_group: config.backend_group.clone(),
                    priority: config.priority,
                    limiter,
                    matcher: AllOf::new(matchers),
                    prefix_len,
                }
            })
            .collect();

        // stable sort keeps file order for full ties
        compiled.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.prefix_len.cmp(&a.prefix_len))
        });

        if shared_used {
            limiters.insert(0, shared);
        }
        (Self { routes: compiled }, limiters)
    }

    /// First route matching the request, in priority order.
    pub fn match_request(&self, host: Option<&str>, path: &str) -> Option<&Route> {
        let target = RequestTarget::new(host, path);
        self.routes.iter().find(|r| r.matches(&target))
    }

    /// Backend groups referenced by any route.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.backend_group.as_str())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
