use std::path::Path;

use gangway_core::{util::write_file_atomic, AnyResult};
use serde::{Deserialize, Serialize};

use crate::registry::{Registry, ServiceSpec};

pub const SNAPSHOT_VERSION: u32 = 1;

/// The durable encoding of the routing table: self-describing, versioned,
/// rewritten wholesale after every successful mutation.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub services: Vec<ServiceSpec>,
}

impl StateSnapshot {
    pub fn capture(registry: &Registry) -> Self {
        let mut services: Vec<ServiceSpec> = registry.specs().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            version: SNAPSHOT_VERSION,
            services,
        }
    }
}

/// Missing file means a fresh instance, not an error.
pub fn load(path: &Path) -> AnyResult<Option<StateSnapshot>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot: StateSnapshot = serde_json::from_slice(&content)?;
    if snapshot.version != SNAPSHOT_VERSION {
        gangway_core::bail_into!("unsupported state file version {}", snapshot.version);
    }
    Ok(Some(snapshot))
}

pub fn save(path: &Path, snapshot: &StateSnapshot) -> AnyResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_vec_pretty(snapshot)?;
    write_file_atomic(path, &encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use gangway_core::config::{ServiceOptions, TargetOptions};
    use gangway_services::proxy::pause::PauseState;

    use super::*;
    use crate::registry::{PauseSpec, RolloutSplit, TargetSet};

    fn sample_registry() -> Registry {
        let mut registry = Registry::new();
        let mut options = ServiceOptions {
            hosts: vec!["example.com".to_string()],
            tls_enabled: true,
            tls_certificate_path: Some("cert.pem".into()),
            tls_private_key_path: Some("key.pem".into()),
            ..Default::default()
        };
        options.normalize().unwrap();
        registry.upsert(ServiceSpec {
            name: "web".to_string(),
            options,
            target_options: TargetOptions::default(),
            active: TargetSet {
                writers: vec!["web-1:3000".to_string(), "web-2:3000".to_string()],
                readers: vec!["web-ro:3000".to_string()],
            },
            rollout: Some(TargetSet {
                writers: vec!["web-next:3000".to_string()],
                readers: vec![],
            }),
            rollout_split: Some(RolloutSplit {
                percentage: 25,
                allowlist: vec!["00001".to_string()],
            }),
            pause: PauseSpec {
                state: PauseState::Stopped,
                message: Some("maintenance".to_string()),
            },
        });
        registry
    }

    #[test]
    fn snapshot_roundtrip_preserves_specs() {
        let registry = sample_registry();
        let snapshot = StateSnapshot::capture(&registry);

        let dir = std::env::temp_dir().join(format!(
            "gangway-snapshot-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        save(&path, &snapshot).unwrap();
        let restored = load(&path).unwrap().unwrap();
        assert_eq!(restored.version, SNAPSHOT_VERSION);
        assert_eq!(restored.services.len(), 1);

        let spec = &restored.services[0];
        assert_eq!(spec.name, "web");
        assert_eq!(spec.active.writers.len(), 2);
        assert_eq!(spec.active.readers, vec!["web-ro:3000".to_string()]);
        assert_eq!(spec.rollout.as_ref().unwrap().writers.len(), 1);
        assert_eq!(spec.rollout_split.as_ref().unwrap().percentage, 25);
        assert_eq!(spec.pause.state, PauseState::Stopped);
        assert_eq!(spec.pause.message.as_deref(), Some("maintenance"));
        assert!(spec.options.tls_enabled);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_no_state() {
        let missing = std::env::temp_dir().join("gangway-no-such-state.json");
        assert!(load(&missing).unwrap().is_none());
    }
}
