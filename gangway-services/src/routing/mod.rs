//! Host + path-prefix routing table.
//!
//! Host precedence: exact match, then `*.domain` wildcard (one extra label),
//! then the catch-all service. Path precedence within the matched host:
//! longest matching prefix, where a prefix only matches at a `/` boundary
//! (`/apiary` does not match `/api`). Per-host path matching is a
//! [`matchit::Router`], rebuilt on mutation; mutations are rare, lookups are
//! per-request.
use std::collections::HashMap;

use tracing::warn;

#[derive(Clone)]
struct RouteTarget {
    name: String,
    prefix: String,
}

struct Binding<T> {
    hosts: Vec<String>,
    prefixes: Vec<String>,
    value: T,
}

pub struct ServiceMap<T> {
    slots: HashMap<String, Binding<T>>,
    exact: HashMap<String, matchit::Router<RouteTarget>>,
    wildcard: HashMap<String, matchit::Router<RouteTarget>>,
    fallback: Option<matchit::Router<RouteTarget>>,
}

impl<T> Default for ServiceMap<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            fallback: None,
        }
    }
}

impl<T> ServiceMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a service binding. Hosts and prefixes must be
    /// normalized; conflicts are expected to have been rejected with
    /// [`check_availability`](Self::check_availability) beforehand.
    pub fn insert(&mut self, name: String, hosts: Vec<String>, prefixes: Vec<String>, value: T) {
        self.slots.insert(
            name,
            Binding {
                hosts,
                prefixes,
                value,
            },
        );
        self.reindex();
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let binding = self.slots.remove(name)?;
        self.reindex();
        Some(binding.value)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.slots.get(name).map(|b| &b.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.slots.iter().map(|(name, b)| (name, &b.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.values().map(|b| &b.value)
    }

    /// Resolve a request to `(service, matched prefix)`.
    pub fn resolve(&self, host: &str, path: &str) -> Option<(&T, &str)> {
        let target = self
            .lookup_exact(host, path)
            .or_else(|| self.lookup_wildcard(host, path))
            .or_else(|| self.lookup(self.fallback.as_ref()?, path))?;
        let binding = self.slots.get(&target.name)?;
        Some((&binding.value, target.prefix.as_str()))
    }

    /// The first service (other than `name`) already claiming one of the
    /// given `(host, prefix)` pairs.
    pub fn check_availability(
        &self,
        name: &str,
        hosts: &[String],
        prefixes: &[String],
    ) -> Option<&str> {
        let claimed = hosts_or_catch_all(hosts);
        for (other, binding) in &self.slots {
            if other == name {
                continue;
            }
            let owned = hosts_or_catch_all(&binding.hosts);
            let host_overlap = claimed.iter().any(|h| owned.contains(h));
            if host_overlap
                && prefixes
                    .iter()
                    .any(|p| binding.prefixes.iter().any(|o| o == p))
            {
                return Some(other.as_str());
            }
        }
        None
    }

    fn lookup_exact(&self, host: &str, path: &str) -> Option<&RouteTarget> {
        self.lookup(self.exact.get(host)?, path)
    }

    fn lookup_wildcard(&self, host: &str, path: &str) -> Option<&RouteTarget> {
        // A wildcard covers exactly one label: strip the first label and the
        // remainder must equal the registered suffix.
        let (label, suffix) = host.split_once('.')?;
        if label.is_empty() {
            return None;
        }
        self.lookup(self.wildcard.get(suffix)?, path)
    }

    fn lookup<'a>(&self, router: &'a matchit::Router<RouteTarget>, path: &str) -> Option<&'a RouteTarget> {
        router.at(path).ok().map(|m| m.value)
    }

    fn reindex(&mut self) {
        self.exact.clear();
        self.wildcard.clear();
        self.fallback = None;

        for (name, binding) in &self.slots {
            for host in hosts_or_catch_all(&binding.hosts) {
                let router = if host.is_empty() {
                    self.fallback.get_or_insert_with(matchit::Router::new)
                } else if let Some(suffix) = host.strip_prefix("*.") {
                    self.wildcard.entry(suffix.to_string()).or_default()
                } else {
                    self.exact.entry(host.clone()).or_default()
                };
                for prefix in &binding.prefixes {
                    let target = RouteTarget {
                        name: name.clone(),
                        prefix: prefix.clone(),
                    };
                    // `/api` claims `/api`, `/api/` and everything below,
                    // but never `/apiary`.
                    let mut patterns = vec![prefix.clone()];
                    if prefix == "/" {
                        patterns.push("/{*rest}".to_string());
                    } else {
                        patterns.push(format!("{prefix}/"));
                        patterns.push(format!("{prefix}/{{*rest}}"));
                    }
                    for pattern in patterns {
                        if let Err(e) = router.insert(&pattern, target.clone()) {
                            warn!(host = %host, pattern = %pattern, "route pattern rejected: {e}");
                        }
                    }
                }
            }
        }
    }
}

fn hosts_or_catch_all(hosts: &[String]) -> Vec<String> {
    if hosts.is_empty() {
        vec![String::new()]
    } else {
        hosts.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(
        entries: &[(&'static str, &[&'static str], &[&'static str])],
    ) -> ServiceMap<&'static str> {
        let mut map = ServiceMap::new();
        for (name, hosts, prefixes) in entries {
            map.insert(
                name.to_string(),
                hosts.iter().map(|s| s.to_string()).collect(),
                prefixes.iter().map(|s| s.to_string()).collect(),
                *name,
            );
        }
        map
    }

    #[test]
    fn host_precedence_exact_wildcard_catch_all() {
        let map = map_of(&[
            ("s1", &["example.com"], &["/"]),
            ("s2", &["*.example.com"], &["/"]),
            ("s3", &[], &["/"]),
        ]);
        assert_eq!(map.resolve("example.com", "/").unwrap().0, &"s1");
        assert_eq!(map.resolve("x.example.com", "/").unwrap().0, &"s2");
        assert_eq!(map.resolve("y.other", "/").unwrap().0, &"s3");
        // Wildcards cover exactly one label.
        assert_eq!(map.resolve("a.b.example.com", "/").unwrap().0, &"s3");
    }

    #[test]
    fn longest_prefix_wins() {
        let map = map_of(&[
            ("root", &["example.com"], &["/"]),
            ("api", &["example.com"], &["/api"]),
            ("special", &["example.com"], &["/api/special"]),
        ]);
        let (svc, prefix) = map.resolve("example.com", "/api/special/x").unwrap();
        assert_eq!((svc, prefix), (&"special", "/api/special"));
        assert_eq!(map.resolve("example.com", "/api/other").unwrap().0, &"api");
        assert_eq!(map.resolve("example.com", "/api").unwrap().0, &"api");
        assert_eq!(map.resolve("example.com", "/other").unwrap().0, &"root");
    }

    #[test]
    fn prefix_requires_segment_boundary() {
        let map = map_of(&[
            ("root", &["example.com"], &["/"]),
            ("api", &["example.com"], &["/api"]),
        ]);
        assert_eq!(map.resolve("example.com", "/apiary").unwrap().0, &"root");
        assert_eq!(map.resolve("example.com", "/api/").unwrap().0, &"api");
    }

    #[test]
    fn no_match_without_catch_all() {
        let map = map_of(&[("s1", &["example.com"], &["/"])]);
        assert!(map.resolve("other.com", "/").is_none());
    }

    #[test]
    fn availability_reports_conflicting_service() {
        let map = map_of(&[
            ("s1", &["example.com"], &["/"]),
            ("s2", &["example.com"], &["/api"]),
        ]);
        // Same name re-deploy is not a conflict.
        assert_eq!(
            map.check_availability("s1", &["example.com".into()], &["/".into()]),
            None
        );
        assert_eq!(
            map.check_availability("s3", &["example.com".into()], &["/".into()]),
            Some("s1")
        );
        assert_eq!(
            map.check_availability("s3", &["example.com".into()], &["/admin".into()]),
            None
        );
        // Catch-all conflicts with catch-all only.
        assert_eq!(map.check_availability("s3", &[], &["/".into()]), None);
    }

    #[test]
    fn removal_drops_routes() {
        let mut map = map_of(&[
            ("s1", &["example.com"], &["/"]),
            ("s2", &[], &["/"]),
        ]);
        assert_eq!(map.resolve("example.com", "/").unwrap().0, &"s1");
        map.remove("s1");
        assert_eq!(map.resolve("example.com", "/").unwrap().0, &"s2");
    }
}
