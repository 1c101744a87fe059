use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{util::duration_ms, ControlError};

pub const ROOT_PATH_PREFIX: &str = "/";

/// Routing and TLS options of one deployed service.
///
/// `normalize` must run before the options are used for routing, conflict
/// checking or persistence; it canonicalizes hosts and path prefixes and
/// rejects invalid patterns with the admin-visible error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Exact domains or `*.domain` wildcards. Empty means this service is
    /// the default catch-all.
    pub hosts: Vec<String>,
    /// Path prefixes claimed on the matched hosts; defaults to `["/"]`.
    pub path_prefixes: Vec<String>,
    pub tls_enabled: bool,
    pub tls_redirect: bool,
    pub tls_certificate_path: Option<PathBuf>,
    pub tls_private_key_path: Option<PathBuf>,
    pub acme_directory: Option<String>,
    pub acme_cache_path: Option<PathBuf>,
    pub error_page_path: Option<PathBuf>,
    /// Remove the matched path prefix before forwarding upstream.
    pub strip_prefix: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            path_prefixes: Vec::new(),
            tls_enabled: false,
            // Effective only with tls_enabled; serving plaintext next to
            // TLS is the exception, so redirecting is the default.
            tls_redirect: true,
            tls_certificate_path: None,
            tls_private_key_path: None,
            acme_directory: None,
            acme_cache_path: None,
            error_page_path: None,
            strip_prefix: false,
        }
    }
}

impl ServiceOptions {
    /// Canonicalize hosts and prefixes in place.
    ///
    /// Hosts are lowercased and validated; prefixes get a leading `/` check
    /// and trailing `/` removal (except the root prefix). Duplicates are
    /// dropped, relative order is kept.
    pub fn normalize(&mut self) -> Result<(), ControlError> {
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let host = host.trim().to_ascii_lowercase();
            if host.is_empty() {
                continue;
            }
            if !valid_host_pattern(&host) {
                return Err(ControlError::InvalidHostPattern(host));
            }
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        self.hosts = hosts;

        if self.path_prefixes.is_empty() {
            self.path_prefixes = vec![ROOT_PATH_PREFIX.to_string()];
        }
        let mut prefixes = Vec::with_capacity(self.path_prefixes.len());
        for prefix in &self.path_prefixes {
            let mut prefix = prefix.trim().to_string();
            if !prefix.starts_with('/') || prefix.contains(['?', '#', '*']) {
                return Err(ControlError::InvalidPathPrefix(prefix));
            }
            while prefix.len() > 1 && prefix.ends_with('/') {
                prefix.pop();
            }
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        self.path_prefixes = prefixes;

        if self.uses_automatic_tls() && self.hosts.iter().any(|h| h.starts_with("*.")) {
            return Err(ControlError::AutomaticTlsDoesNotSupportWildcards);
        }
        Ok(())
    }

    /// Whether this service is the host catch-all.
    pub fn is_catch_all(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Whether the service claims the root path prefix.
    pub fn owns_root_path(&self) -> bool {
        self.path_prefixes.iter().any(|p| p == ROOT_PATH_PREFIX)
    }

    /// TLS with neither a static certificate pair nor explicit opt-out means
    /// certificates come from the ACME cache source.
    pub fn uses_automatic_tls(&self) -> bool {
        self.tls_enabled && (self.tls_certificate_path.is_none() || self.tls_private_key_path.is_none())
    }

    /// Whether the service has any TLS-related option set explicitly.
    /// Services without explicit TLS inherit from a root-path sibling on the
    /// same host.
    pub fn tls_explicit(&self) -> bool {
        self.tls_enabled
            || self.tls_certificate_path.is_some()
            || self.tls_private_key_path.is_some()
            || self.acme_directory.is_some()
    }
}

/// Per-upstream behavior of a service's targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOptions {
    pub health_check: HealthCheckConfig,
    /// Upper bound on waiting for upstream response headers.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    pub buffer_requests: bool,
    pub buffer_responses: bool,
    /// Bytes kept in memory per buffered body before spilling to disk.
    pub max_memory_buffer_size: u64,
    /// Hard cap on a buffered request body; 0 means unlimited.
    pub max_request_body_size: u64,
    /// Hard cap on a buffered response body; 0 means unlimited.
    pub max_response_body_size: u64,
    pub log_request_headers: Vec<String>,
    pub log_response_headers: Vec<String>,
    /// Trust and extend incoming `X-Forwarded-*` headers instead of
    /// replacing them.
    pub forward_headers: bool,
    /// Rewrite `Set-Cookie` paths to stay under the stripped prefix.
    pub scope_cookie_paths: bool,
    /// How long a client keeps hitting writers after a write.
    #[serde(with = "duration_ms")]
    pub writer_affinity_timeout: Duration,
    pub readers_accept_websockets: bool,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            health_check: Default::default(),
            response_timeout: Duration::from_secs(30),
            buffer_requests: false,
            buffer_responses: false,
            max_memory_buffer_size: 1 << 20,
            max_request_body_size: 0,
            max_response_body_size: 0,
            log_request_headers: Vec::new(),
            log_response_headers: Vec::new(),
            forward_headers: false,
            scope_cookie_paths: false,
            writer_affinity_timeout: Duration::from_secs(10),
            readers_accept_websockets: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Host header override for probes.
    pub host: Option<String>,
    /// Probe a different port than the traffic port.
    pub port: Option<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/up".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            host: None,
            port: None,
        }
    }
}

/// Match a request host against a normalized pattern: either exact or a
/// `*.domain` wildcard covering exactly one extra label.
pub fn host_matches_pattern(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.strip_suffix(suffix) {
            Some(rest) => {
                let rest = match rest.strip_suffix('.') {
                    Some(rest) => rest,
                    None => return false,
                };
                !rest.is_empty() && !rest.contains('.')
            }
            None => false,
        },
        None => pattern == host,
    }
}

fn valid_host_pattern(host: &str) -> bool {
    let rest = host.strip_prefix("*.").unwrap_or(host);
    if rest.is_empty() || rest.contains('*') || rest.len() > 253 {
        return false;
    }
    rest.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_defaults_to_root_prefix() {
        let mut opts = ServiceOptions {
            hosts: vec!["Example.COM".to_string()],
            ..Default::default()
        };
        opts.normalize().unwrap();
        assert_eq!(opts.hosts, vec!["example.com"]);
        assert_eq!(opts.path_prefixes, vec!["/"]);
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        let mut opts = ServiceOptions {
            path_prefixes: vec!["/api/".to_string(), "/api".to_string(), "/".to_string()],
            ..Default::default()
        };
        opts.normalize().unwrap();
        assert_eq!(opts.path_prefixes, vec!["/api", "/"]);
    }

    #[test]
    fn normalize_rejects_bad_host() {
        for bad in ["exa mple.com", "foo.*.com", "-x.com", "a..b"] {
            let mut opts = ServiceOptions {
                hosts: vec![bad.to_string()],
                ..Default::default()
            };
            assert!(opts.normalize().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn normalize_rejects_wildcard_with_automatic_tls() {
        let mut opts = ServiceOptions {
            hosts: vec!["*.example.com".to_string()],
            tls_enabled: true,
            ..Default::default()
        };
        assert_eq!(
            opts.normalize(),
            Err(ControlError::AutomaticTlsDoesNotSupportWildcards)
        );

        // A static pair makes the wildcard fine.
        opts.tls_certificate_path = Some("cert.pem".into());
        opts.tls_private_key_path = Some("key.pem".into());
        opts.normalize().unwrap();
    }

    #[test]
    fn wildcard_matches_single_label() {
        assert!(host_matches_pattern("*.example.com", "app.example.com"));
        assert!(!host_matches_pattern("*.example.com", "example.com"));
        assert!(!host_matches_pattern("*.example.com", "a.b.example.com"));
        assert!(!host_matches_pattern("*.example.com", "xexample.com"));
        assert!(host_matches_pattern("example.com", "example.com"));
        assert!(!host_matches_pattern("example.com", "www.example.com"));
    }
}
