//! Route entries and the ordered route table

use crate::config::RouteConfig;
use crate::{GatewayError, Result};
use std::cmp::Ordering;
use tracing::warn;
use url::Url;

/// A single path-prefix to upstream mapping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    prefix: String,
    upstream: Url,
    auth_required: Option<bool>,
}

impl RouteEntry {
    /// Create an entry, normalizing the prefix to end with `/`
    pub fn new(path_prefix: &str, upstream: &str, auth_required: Option<bool>) -> Result<Self> {
        let prefix = normalize_prefix(path_prefix)?;
        let upstream = Url::parse(upstream)
            .map_err(|e| GatewayError::Config(format!("invalid upstream {:?}: {}", upstream, e)))?;

        match upstream.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GatewayError::Config(format!(
                    "unsupported upstream scheme {:?} for {}",
                    other, prefix
                )))
            }
        }
        if upstream.host_str().is_none() {
            return Err(GatewayError::Config(format!("upstream for {} has no host", prefix)));
        }

        Ok(Self {
            prefix,
            upstream,
            auth_required,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn auth_required(&self) -> Option<bool> {
        self.auth_required
    }

    /// Per-route setting, falling back to the gateway-wide default
    pub fn effective_auth(&self, default: bool) -> bool {
        self.auth_required.unwrap_or(default)
    }

    /// Check whether a request path falls under this prefix
    pub fn matches(&self, path: &str) -> bool {
        if path.starts_with(&self.prefix) {
            return true;
        }
        // `/app` addresses the `/app/` subtree
        let bare = &self.prefix[..self.prefix.len() - 1];
        !bare.is_empty() && path == bare
    }

    /// Build the upstream URL for a request path and optional query
    ///
    /// The full inbound path is appended to the upstream base path; the
    /// prefix is not stripped.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.upstream.path().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let mut target = format!(
            "{}://{}{}",
            self.upstream.scheme(),
            authority(&self.upstream),
            base
        );
        target.push_str(&path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    fn specificity_cmp(&self, other: &Self) -> Ordering {
        other
            .prefix
            .len()
            .cmp(&self.prefix.len())
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// Normalize a configured path prefix to a leading and trailing `/`
pub fn normalize_prefix(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Config("route path prefix is empty".to_string()));
    }

    let mut prefix = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    Ok(prefix)
}

/// Immutable, specificity-ordered set of routes
///
/// Entries are sorted by prefix length descending, then lexicographically, so
/// the first match is always the most specific one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        let mut deduped: Vec<RouteEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if deduped.iter().any(|e| e.prefix == entry.prefix) {
                warn!(prefix = %entry.prefix, "Duplicate route prefix, keeping the first definition");
                continue;
            }
            deduped.push(entry);
        }
        deduped.sort_by(|a, b| a.specificity_cmp(b));
        Self { entries: deduped }
    }

    /// Build a table from configuration, skipping invalid entries
    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let entries = routes
            .iter()
            .filter_map(|route| {
                match RouteEntry::new(&route.path_prefix, &route.upstream, route.auth_required) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(path = %route.path_prefix, error = %e, "Skipping invalid route");
                        None
                    }
                }
            })
            .collect();
        Self::new(entries)
    }

    /// Find the most specific entry matching the path
    pub fn lookup(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.matches(path))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prefix: &str, upstream: &str) -> RouteEntry {
        RouteEntry::new(prefix, upstream, None).unwrap()
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix("/app").unwrap(), "/app/");
        assert_eq!(normalize_prefix("/app/").unwrap(), "/app/");
        assert_eq!(normalize_prefix("app").unwrap(), "/app/");
        assert_eq!(normalize_prefix("/").unwrap(), "/");
        assert!(normalize_prefix("  ").is_err());
    }

    #[test]
    fn test_invalid_upstreams_rejected() {
        assert!(RouteEntry::new("/a", "not a url", None).is_err());
        assert!(RouteEntry::new("/a", "ftp://files.example.com", None).is_err());
        assert!(RouteEntry::new("", "http://backend", None).is_err());
    }

    #[test]
    fn test_match_path() {
        let route = entry("/app", "http://backend:9000");
        assert!(route.matches("/app/x"));
        assert!(route.matches("/app/"));
        assert!(route.matches("/app"));
        assert!(!route.matches("/application"));
        assert!(!route.matches("/other"));

        let root = entry("/", "http://backend:9000");
        assert!(root.matches("/anything"));
        assert!(root.matches("/"));
    }

    #[test]
    fn test_longest_prefix_wins_regardless_of_order() {
        let orders = [
            vec![entry("/notebooks/", "http://short"), entry("/notebooks/abc/", "http://long")],
            vec![entry("/notebooks/abc/", "http://long"), entry("/notebooks/", "http://short")],
        ];
        for entries in orders {
            let table = RouteTable::new(entries);
            let hit = table.lookup("/notebooks/abc/x").unwrap();
            assert_eq!(hit.prefix(), "/notebooks/abc/");
            assert_eq!(hit.upstream().host_str(), Some("long"));
            assert_eq!(table.lookup("/notebooks/xyz").unwrap().prefix(), "/notebooks/");
        }
    }

    #[test]
    fn test_equal_length_ties_are_lexicographic() {
        let table = RouteTable::new(vec![
            entry("/a/cc", "http://cc"),
            entry("/a/bb", "http://bb"),
            entry("/a", "http://a"),
        ]);
        let prefixes: Vec<&str> = table.entries().iter().map(|e| e.prefix()).collect();
        assert_eq!(prefixes, vec!["/a/bb/", "/a/cc/", "/a/"]);
    }

    #[test]
    fn test_duplicate_prefix_keeps_first() {
        let table = RouteTable::new(vec![entry("/dup", "http://first"), entry("/dup/", "http://second")]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("/dup/x").unwrap().upstream().host_str(), Some("first"));
    }

    #[test]
    fn test_from_config_skips_invalid_routes() {
        let routes = vec![
            RouteConfig {
                path_prefix: String::new(),
                upstream: "http://x".to_string(),
                auth_required: None,
            },
            RouteConfig {
                path_prefix: "/bad".to_string(),
                upstream: "::::".to_string(),
                auth_required: None,
            },
            RouteConfig {
                path_prefix: "/good".to_string(),
                upstream: "http://good:8080".to_string(),
                auth_required: Some(false),
            },
        ];
        let table = RouteTable::from_config(&routes);
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].auth_required(), Some(false));
    }

    #[test]
    fn test_target_url_keeps_full_path() {
        let route = entry("/app", "http://backend:9000");
        assert_eq!(route.target_url("/app/x", None), "http://backend:9000/app/x");
        assert_eq!(
            route.target_url("/app/x", Some("a=1&b=2")),
            "http://backend:9000/app/x?a=1&b=2"
        );

        let based = entry("/app", "https://backend/base/");
        assert_eq!(based.target_url("/app/x", Some("")), "https://backend/base/app/x");
    }

    #[test]
    fn test_effective_auth_defers_to_default() {
        assert!(entry("/a", "http://a").effective_auth(true));
        assert!(!entry("/a", "http://a").effective_auth(false));
        let explicit = RouteEntry::new("/a", "http://a", Some(false)).unwrap();
        assert!(!explicit.effective_auth(true));
    }
}
