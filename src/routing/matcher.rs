//! Route matching logic.
//!
//! # Design Decisions
//! - Host matching is case-insensitive and ignores the port
//! - Path matching is case-sensitive and segment-aware: `/api` matches `/api` and
//!   `/api/users`, never `/apiary`
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

/// The parts of a request that routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> RequestTarget<'a> {
    pub fn new(host: Option<&'a str>, path: &'a str) -> Self {
        Self { host, path }
    }
}

/// A single match condition.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn matches(&self, target: &RequestTarget<'_>) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    host: String,
}

impl HostMatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
        }
    }
}

fn strip_port(host: &str) -> &str {
    // bracketed IPv6 literal keeps its colons
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

impl Matcher for HostMatcher {
    fn matches(&self, target: &RequestTarget<'_>) -> bool {
        target
            .host
            .map(|h| strip_port(h).eq_ignore_ascii_case(&self.host))
            .unwrap_or(false)
    }
}

/// Matches whole leading path segments.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.len() > 1 && prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, target: &RequestTarget<'_>) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match target.path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// All conditions must hold.
#[derive(Debug, Default)]
pub struct AllOf {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AllOf {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AllOf {
    fn matches(&self, target: &RequestTarget<'_>) -> bool {
        self.matchers.iter().all(|m| m.matches(target))
    }
}
