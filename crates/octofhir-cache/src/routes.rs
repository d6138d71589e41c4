//! Named invalidation domains.
//!
//! Lets callers say "drop everything about appointments" without knowing
//! which tags or key shapes the cached data uses.

use std::collections::HashMap;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::pattern::Glob;

/// What one domain name expands to, with its key globs compiled.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRoute {
    pub tags: Vec<String>,
    pub patterns: Vec<Glob>,
}

impl ResolvedRoute {
    pub fn pattern_sources(&self) -> Vec<String> {
        self.patterns.iter().map(|g| g.as_str().to_string()).collect()
    }
}

/// Static routing table built from `cache.invalidation_routes`.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRoutes {
    routes: HashMap<String, ResolvedRoute>,
}

impl InvalidationRoutes {
    /// Compile every configured route. Fails on a malformed glob.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut routes = HashMap::with_capacity(config.invalidation_routes.len());
        for (domain, route) in &config.invalidation_routes {
            let patterns = route
                .patterns
                .iter()
                .map(|p| Glob::new(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    CacheError::config(format!("cache.invalidation_routes.{domain}: {e}"))
                })?;
            routes.insert(
                domain.clone(),
                ResolvedRoute {
                    tags: route.tags.clone(),
                    patterns,
                },
            );
        }
        Ok(Self { routes })
    }

    /// Expand a domain name. Unknown domains act as a tag of the same name.
    pub fn resolve(&self, domain: &str) -> ResolvedRoute {
        match self.routes.get(domain) {
            Some(route) => route.clone(),
            None => ResolvedRoute {
                tags: vec![domain.to_string()],
                patterns: Vec::new(),
            },
        }
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.routes.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
