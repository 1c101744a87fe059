use std::time::Duration;

use gangway_core::{
    bail_into,
    config::{ServiceOptions, TargetOptions},
    orchestrator::Execute,
    ControlError,
};
use tracing::debug;

use crate::{
    proxy::{
        balancer::LoadBalancer,
        pause::PauseState,
        service::{ProxyService, Slot},
    },
    router::{StagedDeploy, WorkerRouter},
    AnyError,
};

/// Commands broadcast by the control plane to every worker's router.
///
/// Deployments are two-staged: `StageDeploy` builds the new balancer and
/// runs the health gate, `CommitDeploy` swaps it in and drains the replaced
/// one, `AbortDeploy` throws a failed stage away. Everything else is a
/// single step.
#[derive(Clone)]
pub enum RouterCommand {
    StageDeploy {
        service: String,
        slot: Slot,
        /// Pairs this stage with its later commit or abort.
        token: u64,
        writers: Vec<String>,
        readers: Vec<String>,
        service_options: ServiceOptions,
        target_options: TargetOptions,
        deploy_timeout: Duration,
        /// Targets restored from a snapshot start out healthy; the next
        /// probe re-establishes the truth.
        skip_health_gate: bool,
    },
    CommitDeploy {
        service: String,
        slot: Slot,
        token: u64,
        drain_timeout: Duration,
    },
    AbortDeploy {
        service: String,
        slot: Slot,
        token: u64,
    },
    UpdateOptions {
        service: String,
        service_options: ServiceOptions,
        target_options: TargetOptions,
    },
    SetRolloutSplit {
        service: String,
        percentage: u8,
        allowlist: Vec<String>,
    },
    StopRollout {
        service: String,
        drain_timeout: Duration,
    },
    Pause {
        service: String,
        drain_timeout: Duration,
        pause_timeout: Duration,
    },
    Stop {
        service: String,
        drain_timeout: Duration,
        message: Option<String>,
    },
    Resume {
        service: String,
    },
    Remove {
        service: String,
        drain_timeout: Duration,
    },
    RestorePause {
        service: String,
        state: PauseState,
        message: Option<String>,
        pause_timeout: Duration,
    },
}

impl Execute<WorkerRouter> for RouterCommand {
    type Error = AnyError;

    async fn execute(self, router: &WorkerRouter) -> Result<(), Self::Error> {
        match self {
            RouterCommand::StageDeploy {
                service,
                slot,
                token,
                writers,
                readers,
                service_options,
                target_options,
                deploy_timeout,
                skip_health_gate,
            } => {
                let lb = LoadBalancer::build(
                    &writers,
                    &readers,
                    &target_options,
                    router.affinity_for(&service),
                )?;
                if skip_health_gate {
                    lb.mark_all_healthy();
                    lb.begin_health_checks();
                } else if let Err(e) = lb.wait_until_healthy(deploy_timeout).await {
                    lb.dispose();
                    return Err(e.into());
                }
                router.stage(
                    service,
                    slot,
                    StagedDeploy {
                        token,
                        lb,
                        service_options,
                        target_options,
                    },
                );
                Ok(())
            }
            RouterCommand::CommitDeploy {
                service,
                slot,
                token,
                drain_timeout,
            } => {
                let Some(staged) = router.take_staged(&service, slot, token) else {
                    bail_into!("deployment of `{service}` was superseded");
                };
                let svc = match router.service(&service) {
                    Some(svc) => {
                        if let Err(e) = svc.update_options(
                            staged.service_options.clone(),
                            staged.target_options.clone(),
                        ) {
                            staged.lb.dispose();
                            return Err(e.into());
                        }
                        svc
                    }
                    None => {
                        if slot == Slot::Rollout {
                            staged.lb.dispose();
                            return Err(ControlError::ServiceNotFound.into());
                        }
                        match ProxyService::new(
                            service.clone(),
                            staged.service_options.clone(),
                            staged.target_options.clone(),
                        ) {
                            Ok(svc) => svc,
                            Err(e) => {
                                staged.lb.dispose();
                                return Err(e.into());
                            }
                        }
                    }
                };
                let replaced = svc.install(slot, staged.lb);
                router.index_service(svc);
                // The new balancer serves from this point. The replaced one
                // winds down in its own task so the commit (and with it the
                // control plane's critical section) stays brief.
                if let Some(old) = replaced {
                    monoio::spawn(async move {
                        old.drain_all(drain_timeout).await;
                        old.dispose();
                    });
                }
                Ok(())
            }
            RouterCommand::AbortDeploy {
                service,
                slot,
                token,
            } => {
                if let Some(staged) = router.take_staged(&service, slot, token) {
                    staged.lb.dispose();
                    debug!(service = %service, "staged deployment aborted");
                }
                Ok(())
            }
            RouterCommand::UpdateOptions {
                service,
                service_options,
                target_options,
            } => {
                let svc = require(router, &service)?;
                svc.update_options(service_options, target_options)?;
                router.index_service(svc);
                Ok(())
            }
            RouterCommand::SetRolloutSplit {
                service,
                percentage,
                allowlist,
            } => {
                let svc = require(router, &service)?;
                svc.set_rollout_split(percentage, allowlist)?;
                Ok(())
            }
            RouterCommand::StopRollout {
                service,
                drain_timeout,
            } => {
                let svc = require(router, &service)?;
                if let Some(lb) = svc.stop_rollout() {
                    lb.drain_all(drain_timeout).await;
                    lb.dispose();
                }
                Ok(())
            }
            RouterCommand::Pause {
                service,
                drain_timeout,
                pause_timeout,
            } => {
                let svc = require(router, &service)?;
                svc.pauser().pause(pause_timeout)?;
                svc.drain_both(drain_timeout).await;
                Ok(())
            }
            RouterCommand::Stop {
                service,
                drain_timeout,
                message,
            } => {
                let svc = require(router, &service)?;
                svc.pauser().stop(message)?;
                svc.drain_both(drain_timeout).await;
                Ok(())
            }
            RouterCommand::Resume { service } => {
                let svc = require(router, &service)?;
                svc.pauser().resume()?;
                Ok(())
            }
            RouterCommand::Remove {
                service,
                drain_timeout,
            } => {
                let Some(svc) = router.remove_service(&service) else {
                    return Err(ControlError::ServiceNotFound.into());
                };
                svc.shutdown(drain_timeout).await;
                Ok(())
            }
            RouterCommand::RestorePause {
                service,
                state,
                message,
                pause_timeout,
            } => {
                let svc = require(router, &service)?;
                svc.pauser().restore(state, message, pause_timeout);
                Ok(())
            }
        }
    }
}

fn require(
    router: &WorkerRouter,
    service: &str,
) -> Result<std::rc::Rc<ProxyService>, ControlError> {
    router.service(service).ok_or(ControlError::ServiceNotFound)
}
