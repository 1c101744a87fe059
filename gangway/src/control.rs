use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use futures_util::lock::Mutex;
use gangway_core::{
    bail_into,
    config::{ServiceOptions, TargetOptions},
    orchestrator::WorkerFleet,
    AnyResult, ControlError,
};
use gangway_services::{
    command::RouterCommand,
    proxy::{error_pages::ErrorPages, pause::PauseState, service::Slot},
    tls::{CachedCertSource, CertEntry, CertSource, CertStore, StaticCertSource},
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    registry::{PauseSpec, Registry, RolloutSplit, ServiceSpec, TargetSet},
    snapshot::{self, StateSnapshot},
};

pub const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
const DEFAULT_ACME_CACHE: &str = "/var/lib/gangway/acme";
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const RESTORED_PAUSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DeployRequest {
    pub service: String,
    pub writers: Vec<String>,
    pub readers: Vec<String>,
    pub service_options: ServiceOptions,
    pub target_options: TargetOptions,
    pub deploy_timeout: Duration,
    pub drain_timeout: Duration,
}

pub struct RolloutDeployRequest {
    pub service: String,
    pub writers: Vec<String>,
    pub readers: Vec<String>,
    pub deploy_timeout: Duration,
    pub drain_timeout: Duration,
}

/// The control plane: owns the declarative registry, broadcasts commands to
/// the worker fleet, keeps the certificate store in sync, and persists a
/// snapshot after every successful mutation.
///
/// Only a deployment's conflict re-check / commit / registry-mutation
/// window is serialized (under `mutations`); health gates and drains run
/// outside it, so a slow deploy or a long drain never freezes the admin
/// channel.
pub struct Controller {
    fleet: WorkerFleet<RouterCommand>,
    registry: RefCell<Registry>,
    /// Effective (inheritance-applied) options last sent to the workers.
    applied_options: RefCell<HashMap<String, ServiceOptions>>,
    cert_store: Arc<CertStore>,
    state_path: PathBuf,
    mutations: Mutex<()>,
    stage_token: Cell<u64>,
}

impl Controller {
    pub fn new(
        fleet: WorkerFleet<RouterCommand>,
        cert_store: Arc<CertStore>,
        state_path: PathBuf,
    ) -> Self {
        Self {
            fleet,
            registry: RefCell::new(Registry::new()),
            applied_options: RefCell::new(HashMap::new()),
            cert_store,
            state_path,
            mutations: Mutex::new(()),
            stage_token: Cell::new(0),
        }
    }

    pub async fn deploy(&self, req: DeployRequest) -> AnyResult<()> {
        let mut options = req.service_options;
        options.normalize()?;
        if req.writers.is_empty() {
            bail_into!("at least one target is required");
        }
        self.registry
            .borrow()
            .check_availability(&req.service, &options)?;
        validate_deploy_material(&options)?;

        let token = self.next_token();
        let effective = self
            .registry
            .borrow()
            .effective_for(&req.service, &options);
        let stage = RouterCommand::StageDeploy {
            service: req.service.clone(),
            slot: Slot::Active,
            token,
            writers: req.writers.clone(),
            readers: req.readers.clone(),
            service_options: effective.clone(),
            target_options: req.target_options.clone(),
            deploy_timeout: req.deploy_timeout,
            skip_health_gate: false,
        };
        if let Err(e) = self.fleet.dispatch(stage).await.err() {
            self.abort(&req.service, Slot::Active, token).await;
            return Err(e);
        }

        let _guard = self.mutations.lock().await;
        // The routing table may have changed while the health gate ran.
        if let Err(e) = self
            .registry
            .borrow()
            .check_availability(&req.service, &options)
        {
            self.abort(&req.service, Slot::Active, token).await;
            return Err(e.into());
        }
        self.fleet
            .dispatch(RouterCommand::CommitDeploy {
                service: req.service.clone(),
                slot: Slot::Active,
                token,
                drain_timeout: req.drain_timeout,
            })
            .await
            .err()?;

        {
            let mut registry = self.registry.borrow_mut();
            let (rollout, rollout_split, pause) = registry
                .get(&req.service)
                .map(|s| (s.rollout.clone(), s.rollout_split.clone(), s.pause.clone()))
                .unwrap_or_default();
            registry.upsert(ServiceSpec {
                name: req.service.clone(),
                options,
                target_options: req.target_options,
                active: TargetSet {
                    writers: req.writers,
                    readers: req.readers,
                },
                rollout,
                rollout_split,
                pause,
            });
        }
        self.applied_options
            .borrow_mut()
            .insert(req.service.clone(), effective);
        info!(service = %req.service, "service deployed");
        self.sync_after_mutation().await
    }

    pub async fn rollout_deploy(&self, req: RolloutDeployRequest) -> AnyResult<()> {
        let (target_options, effective) = {
            let registry = self.registry.borrow();
            let spec = registry
                .get(&req.service)
                .ok_or(ControlError::ServiceNotFound)?;
            let effective = registry
                .effective_options(&req.service)
                .unwrap_or_else(|| spec.options.clone());
            (spec.target_options.clone(), effective)
        };
        if req.writers.is_empty() {
            bail_into!("at least one target is required");
        }

        let token = self.next_token();
        let stage = RouterCommand::StageDeploy {
            service: req.service.clone(),
            slot: Slot::Rollout,
            token,
            writers: req.writers.clone(),
            readers: req.readers.clone(),
            service_options: effective,
            target_options,
            deploy_timeout: req.deploy_timeout,
            skip_health_gate: false,
        };
        if let Err(e) = self.fleet.dispatch(stage).await.err() {
            self.abort(&req.service, Slot::Rollout, token).await;
            return Err(e);
        }

        let _guard = self.mutations.lock().await;
        if !self.registry.borrow().contains(&req.service) {
            self.abort(&req.service, Slot::Rollout, token).await;
            return Err(ControlError::ServiceNotFound.into());
        }
        self.fleet
            .dispatch(RouterCommand::CommitDeploy {
                service: req.service.clone(),
                slot: Slot::Rollout,
                token,
                drain_timeout: req.drain_timeout,
            })
            .await
            .err()?;

        {
            let mut registry = self.registry.borrow_mut();
            if let Some(spec) = registry.get(&req.service).cloned() {
                let mut spec = spec;
                spec.rollout = Some(TargetSet {
                    writers: req.writers,
                    readers: req.readers,
                });
                registry.upsert(spec);
            }
        }
        info!(service = %req.service, "rollout targets deployed");
        self.sync_after_mutation().await
    }

    pub async fn set_rollout_split(
        &self,
        service: &str,
        percentage: u8,
        allowlist: Vec<String>,
    ) -> AnyResult<()> {
        {
            let registry = self.registry.borrow();
            let spec = registry.get(service).ok_or(ControlError::ServiceNotFound)?;
            if spec.rollout.is_none() {
                return Err(ControlError::RolloutTargetNotSet.into());
            }
        }
        self.fleet
            .dispatch(RouterCommand::SetRolloutSplit {
                service: service.to_string(),
                percentage,
                allowlist: allowlist.clone(),
            })
            .await
            .err()?;
        self.mutate_spec(service, |spec| {
            spec.rollout_split = Some(RolloutSplit {
                percentage,
                allowlist,
            });
        });
        self.sync_after_mutation().await
    }

    pub async fn stop_rollout(&self, service: &str) -> AnyResult<()> {
        self.require(service)?;
        self.fleet
            .dispatch(RouterCommand::StopRollout {
                service: service.to_string(),
                drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            })
            .await
            .err()?;
        self.mutate_spec(service, |spec| {
            spec.rollout = None;
            spec.rollout_split = None;
        });
        self.sync_after_mutation().await
    }

    pub async fn pause(
        &self,
        service: &str,
        drain_timeout: Duration,
        pause_timeout: Duration,
    ) -> AnyResult<()> {
        self.require(service)?;
        self.fleet
            .dispatch(RouterCommand::Pause {
                service: service.to_string(),
                drain_timeout,
                pause_timeout,
            })
            .await
            .err()?;
        self.mutate_spec(service, |spec| {
            spec.pause = PauseSpec {
                state: PauseState::Paused,
                message: None,
            };
        });
        self.sync_after_mutation().await
    }

    pub async fn stop(
        &self,
        service: &str,
        drain_timeout: Duration,
        message: Option<String>,
    ) -> AnyResult<()> {
        self.require(service)?;
        self.fleet
            .dispatch(RouterCommand::Stop {
                service: service.to_string(),
                drain_timeout,
                message: message.clone(),
            })
            .await
            .err()?;
        self.mutate_spec(service, |spec| {
            spec.pause = PauseSpec {
                state: PauseState::Stopped,
                message,
            };
        });
        self.sync_after_mutation().await
    }

    pub async fn resume(&self, service: &str) -> AnyResult<()> {
        self.require(service)?;
        self.fleet
            .dispatch(RouterCommand::Resume {
                service: service.to_string(),
            })
            .await
            .err()?;
        self.mutate_spec(service, |spec| {
            spec.pause = PauseSpec::default();
        });
        self.sync_after_mutation().await
    }

    pub async fn remove(&self, service: &str) -> AnyResult<()> {
        self.require(service)?;
        self.fleet
            .dispatch(RouterCommand::Remove {
                service: service.to_string(),
                drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            })
            .await
            .err()?;
        self.registry.borrow_mut().remove(service);
        self.applied_options.borrow_mut().remove(service);
        info!(service = %service, "service removed");
        self.sync_after_mutation().await
    }

    /// The `list` reply: one row per service with its routing claim, TLS
    /// flag, writer set and gate state.
    pub fn list(&self) -> serde_json::Value {
        let registry = self.registry.borrow();
        let mut services = serde_json::Map::new();
        for name in registry.sorted_names() {
            let Some(spec) = registry.get(&name) else {
                continue;
            };
            let effective = registry
                .effective_options(&name)
                .unwrap_or_else(|| spec.options.clone());
            let state = match spec.pause.state {
                PauseState::Running => "running",
                PauseState::Paused => "paused",
                PauseState::Stopped => "stopped",
            };
            services.insert(
                name.clone(),
                json!({
                    "host": spec.options.hosts.join(","),
                    "path": spec.options.path_prefixes.join(","),
                    "tls": effective.tls_enabled,
                    "target": spec.active.writers.join(","),
                    "state": state,
                }),
            );
        }
        serde_json::Value::Object(services)
    }

    /// Rebuild the full traffic plane from the last saved snapshot.
    /// Restored targets start healthy; probes re-establish the truth.
    pub async fn restore(&self) -> AnyResult<()> {
        let Some(snapshot) = snapshot::load(&self.state_path)? else {
            info!("no saved state to restore");
            return Ok(());
        };
        {
            let mut registry = self.registry.borrow_mut();
            for spec in &snapshot.services {
                registry.upsert(spec.clone());
            }
        }
        let mut restored = 0usize;
        for spec in &snapshot.services {
            match self.restore_service(spec).await {
                Ok(()) => restored += 1,
                Err(e) => error!(service = %spec.name, "restoring service failed: {e:#}"),
            }
        }
        self.refresh_cert_store();
        info!(restored, total = snapshot.services.len(), "state restored");
        Ok(())
    }

    async fn restore_service(&self, spec: &ServiceSpec) -> AnyResult<()> {
        let effective = self
            .registry
            .borrow()
            .effective_options(&spec.name)
            .unwrap_or_else(|| spec.options.clone());

        self.stage_and_commit_restored(spec, Slot::Active, &spec.active, &effective)
            .await?;
        if let Some(rollout) = &spec.rollout {
            self.stage_and_commit_restored(spec, Slot::Rollout, rollout, &effective)
                .await?;
        }
        if let Some(split) = &spec.rollout_split {
            self.fleet
                .dispatch(RouterCommand::SetRolloutSplit {
                    service: spec.name.clone(),
                    percentage: split.percentage,
                    allowlist: split.allowlist.clone(),
                })
                .await
                .err()?;
        }
        if spec.pause.state != PauseState::Running {
            self.fleet
                .dispatch(RouterCommand::RestorePause {
                    service: spec.name.clone(),
                    state: spec.pause.state,
                    message: spec.pause.message.clone(),
                    pause_timeout: RESTORED_PAUSE_TIMEOUT,
                })
                .await
                .err()?;
        }
        self.applied_options
            .borrow_mut()
            .insert(spec.name.clone(), effective);
        Ok(())
    }

    async fn stage_and_commit_restored(
        &self,
        spec: &ServiceSpec,
        slot: Slot,
        targets: &TargetSet,
        effective: &ServiceOptions,
    ) -> AnyResult<()> {
        let token = self.next_token();
        self.fleet
            .dispatch(RouterCommand::StageDeploy {
                service: spec.name.clone(),
                slot,
                token,
                writers: targets.writers.clone(),
                readers: targets.readers.clone(),
                service_options: effective.clone(),
                target_options: spec.target_options.clone(),
                deploy_timeout: Duration::ZERO,
                skip_health_gate: true,
            })
            .await
            .err()?;
        self.fleet
            .dispatch(RouterCommand::CommitDeploy {
                service: spec.name.clone(),
                slot,
                token,
                drain_timeout: Duration::ZERO,
            })
            .await
            .err()
    }

    fn require(&self, service: &str) -> Result<(), ControlError> {
        if self.registry.borrow().contains(service) {
            Ok(())
        } else {
            Err(ControlError::ServiceNotFound)
        }
    }

    fn mutate_spec(&self, service: &str, mutate: impl FnOnce(&mut ServiceSpec)) {
        let mut registry = self.registry.borrow_mut();
        if let Some(spec) = registry.get(service).cloned() {
            let mut spec = spec;
            mutate(&mut spec);
            registry.upsert(spec);
        }
    }

    fn next_token(&self) -> u64 {
        let token = self.stage_token.get();
        self.stage_token.set(token + 1);
        token
    }

    async fn abort(&self, service: &str, slot: Slot, token: u64) {
        let _ = self
            .fleet
            .dispatch(RouterCommand::AbortDeploy {
                service: service.to_string(),
                slot,
                token,
            })
            .await;
    }

    /// Everything that follows a successful registry mutation: certificate
    /// entries, sibling option propagation, and the snapshot. A state-file
    /// write failure is logged and returned, but the in-memory mutation
    /// stands; the next successful mutation re-persists.
    async fn sync_after_mutation(&self) -> AnyResult<()> {
        self.refresh_cert_store();

        let updates: Vec<(String, ServiceOptions, TargetOptions)> = {
            let registry = self.registry.borrow();
            let applied = self.applied_options.borrow();
            registry
                .sorted_names()
                .into_iter()
                .filter_map(|name| {
                    let effective = registry.effective_options(&name)?;
                    let target_options = registry.get(&name)?.target_options.clone();
                    if applied.get(&name) != Some(&effective) {
                        Some((name, effective, target_options))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (name, effective, target_options) in updates {
            let result = self
                .fleet
                .dispatch(RouterCommand::UpdateOptions {
                    service: name.clone(),
                    service_options: effective.clone(),
                    target_options,
                })
                .await
                .err();
            match result {
                Ok(()) => {
                    self.applied_options.borrow_mut().insert(name, effective);
                }
                Err(e) => warn!(service = %name, "propagating options failed: {e:#}"),
            }
        }
        {
            let registry = self.registry.borrow();
            self.applied_options
                .borrow_mut()
                .retain(|name, _| registry.contains(name));
        }

        let snapshot = StateSnapshot::capture(&self.registry.borrow());
        snapshot::save(&self.state_path, &snapshot).map_err(|e| {
            error!("writing state file failed: {e:#}");
            e
        })
    }

    fn refresh_cert_store(&self) {
        let registry = self.registry.borrow();
        let mut entries = Vec::new();
        for name in registry.sorted_names() {
            let Some(effective) = registry.effective_options(&name) else {
                continue;
            };
            if !effective.tls_enabled {
                continue;
            }
            let source: Arc<dyn CertSource> = match (
                &effective.tls_certificate_path,
                &effective.tls_private_key_path,
            ) {
                (Some(cert), Some(key)) => match StaticCertSource::load(cert, key) {
                    Ok(source) => Arc::new(source),
                    Err(e) => {
                        warn!(service = %name, "certificate entry skipped: {e}");
                        continue;
                    }
                },
                _ => {
                    let directory = effective
                        .acme_directory
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ACME_DIRECTORY.to_string());
                    let cache_root = effective
                        .acme_cache_path
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ACME_CACHE.into());
                    Arc::new(CachedCertSource::new(&cache_root, &directory))
                }
            };
            for host in &effective.hosts {
                entries.push(CertEntry {
                    pattern: host.clone(),
                    source: source.clone(),
                });
            }
        }
        self.cert_store.update(entries, registry.default_tls_host());
    }
}

/// Fail a deploy before any swap if its option-derived material cannot be
/// loaded: static key pairs and error page directories.
fn validate_deploy_material(options: &ServiceOptions) -> Result<(), ControlError> {
    if let (Some(cert), Some(key)) = (&options.tls_certificate_path, &options.tls_private_key_path)
    {
        StaticCertSource::load(cert, key)?;
    }
    if let Some(dir) = &options.error_page_path {
        ErrorPages::load(dir)?;
    }
    Ok(())
}
