use std::{cell::RefCell, rc::Rc, time::Duration};

use futures_util::future::join_all;
use gangway_core::{
    config::{ServiceOptions, TargetOptions},
    ControlError,
};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use serde::{Deserialize, Serialize};

use super::{
    balancer::LoadBalancer,
    error_pages::{default_page, ErrorPages},
    pause::{PauseController, PauseState, WaitOutcome},
    rollout::RolloutController,
};
use crate::{
    common::ConnContext,
    http::{generate_response, html_response, redirect_to_https, ProxyBody},
};

/// The two balancer slots of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Active,
    Rollout,
}

/// One named routing unit: two balancer slots, a pause gate, an optional
/// rollout split, and the middleware steps that run before dispatch.
pub struct ProxyService {
    name: String,
    options: RefCell<Rc<ServiceOptions>>,
    target_options: RefCell<Rc<TargetOptions>>,
    active: RefCell<Option<Rc<LoadBalancer>>>,
    rollout: RefCell<Option<Rc<LoadBalancer>>>,
    rollout_split: RefCell<Option<RolloutController>>,
    pauser: PauseController,
    error_pages: RefCell<Option<Rc<ErrorPages>>>,
}

impl ProxyService {
    pub fn new(
        name: String,
        options: ServiceOptions,
        target_options: TargetOptions,
    ) -> Result<Rc<Self>, ControlError> {
        let error_pages = load_pages(&options)?;
        Ok(Rc::new(Self {
            name,
            options: RefCell::new(Rc::new(options)),
            target_options: RefCell::new(Rc::new(target_options)),
            active: RefCell::new(None),
            rollout: RefCell::new(None),
            rollout_split: RefCell::new(None),
            pauser: PauseController::new(),
            error_pages: RefCell::new(error_pages),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> Rc<ServiceOptions> {
        self.options.borrow().clone()
    }

    pub fn target_options(&self) -> Rc<TargetOptions> {
        self.target_options.borrow().clone()
    }

    pub fn pauser(&self) -> &PauseController {
        &self.pauser
    }

    /// Re-derive option-dependent state (error pages included). Options are
    /// already normalized.
    pub fn update_options(
        &self,
        options: ServiceOptions,
        target_options: TargetOptions,
    ) -> Result<(), ControlError> {
        let error_pages = load_pages(&options)?;
        *self.options.borrow_mut() = Rc::new(options);
        *self.target_options.borrow_mut() = Rc::new(target_options);
        *self.error_pages.borrow_mut() = error_pages;
        Ok(())
    }

    /// Swap a balancer into `slot`, returning the replaced one for the
    /// caller to drain outside any critical section.
    pub fn install(&self, slot: Slot, lb: Rc<LoadBalancer>) -> Option<Rc<LoadBalancer>> {
        match slot {
            Slot::Active => self.active.borrow_mut().replace(lb),
            Slot::Rollout => self.rollout.borrow_mut().replace(lb),
        }
    }

    pub fn slot(&self, slot: Slot) -> Option<Rc<LoadBalancer>> {
        match slot {
            Slot::Active => self.active.borrow().clone(),
            Slot::Rollout => self.rollout.borrow().clone(),
        }
    }

    pub fn set_rollout_split(
        &self,
        percentage: u8,
        allowlist: Vec<String>,
    ) -> Result<(), ControlError> {
        if self.rollout.borrow().is_none() {
            return Err(ControlError::RolloutTargetNotSet);
        }
        *self.rollout_split.borrow_mut() = Some(RolloutController::new(percentage, allowlist));
        Ok(())
    }

    pub fn rollout_split(&self) -> Option<(u8, Vec<String>)> {
        self.rollout_split
            .borrow()
            .as_ref()
            .map(|ctl| (ctl.percentage(), ctl.allowlist()))
    }

    /// Drop the rollout slot and its split; the returned balancer still
    /// needs draining.
    pub fn stop_rollout(&self) -> Option<Rc<LoadBalancer>> {
        *self.rollout_split.borrow_mut() = None;
        self.rollout.borrow_mut().take()
    }

    /// Drain whatever is installed in both slots concurrently.
    pub async fn drain_both(&self, timeout: Duration) {
        let slots: Vec<Rc<LoadBalancer>> = [self.slot(Slot::Active), self.slot(Slot::Rollout)]
            .into_iter()
            .flatten()
            .collect();
        join_all(slots.iter().map(|lb| lb.drain_all(timeout))).await;
    }

    /// Tear the service down: health checks stopped, both slots drained.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.drain_both(drain_timeout).await;
        for slot in [Slot::Active, Slot::Rollout] {
            if let Some(lb) = self.slot(slot) {
                lb.dispose();
            }
        }
        *self.active.borrow_mut() = None;
        self.stop_rollout();
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        cx: &ConnContext,
        matched_prefix: &str,
    ) -> Response<ProxyBody> {
        let options = self.options();
        let target_options = self.target_options();

        if options.tls_enabled && options.tls_redirect && !cx.tls {
            return redirect_to_https(&req);
        }
        if cx.tls && !options.tls_enabled {
            return self.error_response(StatusCode::SERVICE_UNAVAILABLE, None);
        }

        // Keep the probe endpoint green while gated, so orchestrators don't
        // mistake a pause for an outage.
        if self.pauser.state() != PauseState::Running {
            let probe_path = target_options.health_check.path.as_str();
            let path = req.uri().path();
            if path == probe_path || path.strip_prefix('/') == Some(probe_path) {
                return generate_response(StatusCode::OK);
            }
        }

        match self.pauser.wait().await {
            WaitOutcome::Proceed => {}
            WaitOutcome::TimedOut => {
                return self.error_response(StatusCode::GATEWAY_TIMEOUT, None)
            }
            WaitOutcome::Stopped(message) => {
                return self.error_response(StatusCode::SERVICE_UNAVAILABLE, message.as_deref())
            }
        }

        let use_rollout = {
            let split = self.rollout_split.borrow();
            match split.as_ref() {
                Some(controller) => controller.matches(&req),
                None => false,
            }
        };
        let balancer = if use_rollout {
            self.slot(Slot::Rollout).or_else(|| self.slot(Slot::Active))
        } else {
            self.slot(Slot::Active)
        };
        let Some(balancer) = balancer else {
            return self.error_response(StatusCode::SERVICE_UNAVAILABLE, None);
        };

        let strip_prefix = (options.strip_prefix && matched_prefix != "/")
            .then_some(matched_prefix);
        balancer.dispatch(req, cx, strip_prefix).await
    }

    fn error_response(&self, status: StatusCode, message: Option<&str>) -> Response<ProxyBody> {
        if let Some(pages) = self.error_pages.borrow().as_ref() {
            if let Some(html) = pages.render(status, message) {
                return html_response(status, html);
            }
        }
        if status.is_server_error() {
            return html_response(status, default_page(status, message));
        }
        generate_response(status)
    }
}

fn load_pages(options: &ServiceOptions) -> Result<Option<Rc<ErrorPages>>, ControlError> {
    options
        .error_page_path
        .as_deref()
        .map(|dir| ErrorPages::load(dir).map(Rc::new))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Rc<ProxyService> {
        ProxyService::new(
            "web".to_string(),
            ServiceOptions::default(),
            TargetOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn rollout_split_requires_rollout_slot() {
        let svc = service();
        assert_eq!(
            svc.set_rollout_split(50, vec![]),
            Err(ControlError::RolloutTargetNotSet)
        );
    }

    #[test]
    fn install_returns_replaced_balancer() {
        use crate::proxy::balancer::{AffinityRegistry, LoadBalancer};

        let svc = service();
        let affinity = AffinityRegistry::new();
        let first = LoadBalancer::build(
            &["web-1:80".to_string()],
            &[],
            &TargetOptions::default(),
            affinity.scoped("web"),
        )
        .unwrap();
        let second = LoadBalancer::build(
            &["web-2:80".to_string()],
            &[],
            &TargetOptions::default(),
            affinity.scoped("web"),
        )
        .unwrap();

        assert!(svc.install(Slot::Active, first.clone()).is_none());
        let replaced = svc.install(Slot::Active, second).unwrap();
        assert_eq!(replaced.writer_addrs(), first.writer_addrs());

        // Rollout slot unlocks the split and stop_rollout clears both.
        let rollout = LoadBalancer::build(
            &["web-3:80".to_string()],
            &[],
            &TargetOptions::default(),
            affinity.scoped("web"),
        )
        .unwrap();
        svc.install(Slot::Rollout, rollout);
        svc.set_rollout_split(25, vec!["tok".to_string()]).unwrap();
        assert_eq!(svc.rollout_split().unwrap().0, 25);
        assert!(svc.stop_rollout().is_some());
        assert!(svc.rollout_split().is_none());
    }
}
