use gangway_core::{
    config::{ServiceOptions, TargetOptions},
    ControlError,
};
use gangway_services::{proxy::pause::PauseState, routing::ServiceMap};
use serde::{Deserialize, Serialize};

/// Writers plus optional readers of one balancer slot, by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSet {
    pub writers: Vec<String>,
    #[serde(default)]
    pub readers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutSplit {
    pub percentage: u8,
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseSpec {
    pub state: PauseState,
    pub message: Option<String>,
}

impl Default for PauseSpec {
    fn default() -> Self {
        Self {
            state: PauseState::Running,
            message: None,
        }
    }
}

/// The declarative description of one deployed service: what the snapshot
/// stores and what worker commands are derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub options: ServiceOptions,
    pub target_options: TargetOptions,
    pub active: TargetSet,
    #[serde(default)]
    pub rollout: Option<TargetSet>,
    #[serde(default)]
    pub rollout_split: Option<RolloutSplit>,
    #[serde(default)]
    pub pause: PauseSpec,
}

/// Control-plane view of the routing table. Conflict checking and host
/// indexing reuse the same [`ServiceMap`] the workers route with.
#[derive(Default)]
pub struct Registry {
    map: ServiceMap<ServiceSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains(name)
    }

    pub fn upsert(&mut self, spec: ServiceSpec) {
        self.map.insert(
            spec.name.clone(),
            spec.options.hosts.clone(),
            spec.options.path_prefixes.clone(),
            spec,
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<ServiceSpec> {
        self.map.remove(name)
    }

    /// Admin-facing conflict check: another service claiming one of these
    /// `(host, prefix)` pairs fails the deploy.
    pub fn check_availability(
        &self,
        name: &str,
        options: &ServiceOptions,
    ) -> Result<(), ControlError> {
        match self
            .map
            .check_availability(name, &options.hosts, &options.path_prefixes)
        {
            Some(other) => Err(ControlError::HostInUse(other.to_string())),
            None => Ok(()),
        }
    }

    /// Service names in stable order; "first service" semantics (default
    /// TLS host, listings) all derive from this.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.iter().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }

    /// Options with sibling TLS inheritance applied: a service without
    /// explicit TLS settings sharing a host with a TLS-enabled root-path
    /// sibling serves (and redirects) TLS the way the sibling does.
    pub fn effective_options(&self, name: &str) -> Option<ServiceOptions> {
        let spec = self.get(name)?;
        Some(self.effective_for(name, &spec.options))
    }

    /// Same inheritance, for a spec not (yet) in the registry.
    pub fn effective_for(&self, name: &str, options: &ServiceOptions) -> ServiceOptions {
        let mut effective = options.clone();
        if options.tls_explicit() || options.owns_root_path() {
            return effective;
        }
        for (other_name, other) in self.map.iter() {
            if other_name == name || !other.options.owns_root_path() {
                continue;
            }
            let shared_host = options
                .hosts
                .iter()
                .any(|h| other.options.hosts.contains(h));
            if shared_host && other.options.tls_enabled {
                effective.tls_enabled = true;
                effective.tls_redirect = other.options.tls_redirect;
                break;
            }
        }
        effective
    }

    /// The first host of the first TLS-enabled service, used when a client
    /// sends no SNI at all.
    pub fn default_tls_host(&self) -> Option<String> {
        for name in self.sorted_names() {
            if let Some(options) = self.effective_options(&name) {
                if options.tls_enabled {
                    if let Some(host) = options.hosts.first() {
                        return Some(host.clone());
                    }
                }
            }
        }
        None
    }

    pub fn specs(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, hosts: &[&str], prefixes: &[&str]) -> ServiceSpec {
        let mut options = ServiceOptions {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            path_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        options.normalize().unwrap();
        ServiceSpec {
            name: name.to_string(),
            options,
            target_options: TargetOptions::default(),
            active: TargetSet {
                writers: vec!["web-1:80".to_string()],
                readers: vec![],
            },
            rollout: None,
            rollout_split: None,
            pause: PauseSpec::default(),
        }
    }

    #[test]
    fn conflicts_are_detected_per_host_and_prefix() {
        let mut registry = Registry::new();
        registry.upsert(spec("web", &["example.com"], &["/"]));

        let taken = spec("other", &["example.com"], &["/"]);
        assert_eq!(
            registry.check_availability("other", &taken.options),
            Err(ControlError::HostInUse("web".to_string()))
        );
        let free = spec("other", &["example.com"], &["/api"]);
        assert!(registry.check_availability("other", &free.options).is_ok());
        // Re-deploying under the same name is never a conflict.
        let same = spec("web", &["example.com"], &["/"]);
        assert!(registry.check_availability("web", &same.options).is_ok());
    }

    #[test]
    fn sibling_inherits_tls_from_root_path_owner() {
        let mut registry = Registry::new();
        let mut root = spec("root", &["example.com"], &["/"]);
        root.options.tls_enabled = true;
        root.options.tls_redirect = true;
        registry.upsert(root);
        registry.upsert(spec("api", &["example.com"], &["/api"]));

        let effective = registry.effective_options("api").unwrap();
        assert!(effective.tls_enabled);
        assert!(effective.tls_redirect);

        // Removing the root sibling reverts the inheritance.
        registry.remove("root");
        let effective = registry.effective_options("api").unwrap();
        assert!(!effective.tls_enabled);
    }

    #[test]
    fn explicit_tls_options_are_not_overridden() {
        let mut registry = Registry::new();
        let mut root = spec("root", &["example.com"], &["/"]);
        root.options.tls_enabled = true;
        registry.upsert(root);

        let mut api = spec("api", &["example.com"], &["/api"]);
        api.options.tls_certificate_path = Some("own-cert.pem".into());
        api.options.tls_private_key_path = Some("own-key.pem".into());
        registry.upsert(api);

        let effective = registry.effective_options("api").unwrap();
        assert!(!effective.tls_enabled);
    }

    #[test]
    fn default_tls_host_is_first_by_name() {
        let mut registry = Registry::new();
        let mut b = spec("b-web", &["b.example.com"], &["/"]);
        b.options.tls_enabled = true;
        let mut a = spec("a-web", &["a.example.com"], &["/"]);
        a.options.tls_enabled = true;
        registry.upsert(b);
        registry.upsert(a);
        assert_eq!(registry.default_tls_host().as_deref(), Some("a.example.com"));
    }
}
