use std::{cell::RefCell, collections::HashMap, convert::Infallible, rc::Rc, time::Instant};

use gangway_core::{
    config::{ServiceOptions, TargetOptions},
    http::HttpHandler,
};
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use tracing::info;

use crate::{
    common::ConnContext,
    http::{generate_response, request_host, ProxyBody},
    proxy::{
        balancer::{AffinityRegistry, AffinityTable, LoadBalancer},
        service::{ProxyService, Slot},
        target::UpstreamAddr,
    },
    routing::ServiceMap,
    tls::{CertStore, ACME_CHALLENGE_PREFIX},
};

/// A balancer built and health-gated by a stage command, waiting for its
/// commit (or abort). The token ties a commit to the exact stage it
/// belongs to: when concurrent deployments race on one slot, a later stage
/// supersedes an earlier one and the superseded commit must fail instead of
/// installing someone else's balancer.
pub struct StagedDeploy {
    pub token: u64,
    pub lb: Rc<LoadBalancer>,
    pub service_options: ServiceOptions,
    pub target_options: TargetOptions,
}

/// One worker's live routing state. Single-threaded by construction; no
/// borrow is held across an await point.
pub struct WorkerRouter {
    map: RefCell<ServiceMap<Rc<ProxyService>>>,
    staged: RefCell<HashMap<(String, Slot), StagedDeploy>>,
    affinity: AffinityRegistry,
    cert_store: Option<std::sync::Arc<CertStore>>,
}

impl WorkerRouter {
    pub fn new(affinity: AffinityRegistry, cert_store: Option<std::sync::Arc<CertStore>>) -> Rc<Self> {
        Rc::new(Self {
            map: RefCell::new(ServiceMap::new()),
            staged: RefCell::new(HashMap::new()),
            affinity,
            cert_store,
        })
    }

    pub fn affinity_for(&self, service: &str) -> AffinityTable {
        self.affinity.scoped(service)
    }

    pub fn service(&self, name: &str) -> Option<Rc<ProxyService>> {
        self.map.borrow().get(name).cloned()
    }

    /// (Re-)register a service under its current hosts and prefixes.
    pub fn index_service(&self, svc: Rc<ProxyService>) {
        let options = svc.options();
        self.map.borrow_mut().insert(
            svc.name().to_string(),
            options.hosts.clone(),
            options.path_prefixes.clone(),
            svc,
        );
    }

    pub fn remove_service(&self, name: &str) -> Option<Rc<ProxyService>> {
        self.map.borrow_mut().remove(name)
    }

    pub fn stage(&self, name: String, slot: Slot, staged: StagedDeploy) {
        if let Some(previous) = self.staged.borrow_mut().insert((name, slot), staged) {
            previous.lb.dispose();
        }
    }

    /// Take the staged deployment for `(name, slot)` iff it carries
    /// `token`; a mismatch means this deployment was superseded.
    pub fn take_staged(&self, name: &str, slot: Slot, token: u64) -> Option<StagedDeploy> {
        let mut staged = self.staged.borrow_mut();
        let key = (name.to_string(), slot);
        match staged.get(&key) {
            Some(entry) if entry.token == token => staged.remove(&key),
            _ => None,
        }
    }

    fn resolve(&self, host: &str, path: &str) -> Option<(Rc<ProxyService>, String)> {
        self.map
            .borrow()
            .resolve(host, path)
            .map(|(svc, prefix)| (svc.clone(), prefix.to_string()))
    }
}

/// Entry handler: resolves the service for each request, dispatches, and
/// writes the access log record.
pub struct RouterHandler {
    router: Rc<WorkerRouter>,
}

impl RouterHandler {
    pub fn new(router: Rc<WorkerRouter>) -> Self {
        Self { router }
    }
}

impl HttpHandler<ConnContext, Incoming> for RouterHandler {
    type Body = ProxyBody;
    type Error = Infallible;

    async fn handle(
        &self,
        req: Request<Incoming>,
        cx: ConnContext,
    ) -> Result<Response<Self::Body>, Self::Error> {
        let started = Instant::now();
        let method = req.method().clone();
        let host = request_host(&req).unwrap_or_default();
        let path = req.uri().path().to_string();

        // http-01 challenges belong to the certificate source; they are
        // answered before routing and never forwarded.
        if path.starts_with(ACME_CHALLENGE_PREFIX) {
            if let Some(store) = &self.router.cert_store {
                return Ok(match store.challenge_response(&host, &path) {
                    Some(body) => Response::builder()
                        .status(StatusCode::OK)
                        .body(ProxyBody::from_bytes(body.into()))
                        .unwrap(),
                    None => generate_response(StatusCode::NOT_FOUND),
                });
            }
        }

        let resolved = self.router.resolve(&host, req.uri().path());
        let (service, logged_request_headers, mut response) = match resolved {
            Some((svc, prefix)) => {
                let captured =
                    capture_headers(req.headers(), &svc.target_options().log_request_headers);
                let response = svc.handle(req, &cx, &prefix).await;
                (Some(svc), captured, response)
            }
            None => (None, String::new(), generate_response(StatusCode::NOT_FOUND)),
        };

        let upstream = response.extensions_mut().remove::<UpstreamAddr>();
        let logged_response_headers = service
            .as_ref()
            .map(|svc| {
                capture_headers(
                    response.headers(),
                    &svc.target_options().log_response_headers,
                )
            })
            .unwrap_or_default();

        info!(
            target: "gangway::access",
            method = %method,
            host = %host,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            service = service.as_deref().map(ProxyService::name).unwrap_or("-"),
            upstream = %upstream.map(|u| u.0).unwrap_or_default(),
            request_headers = %logged_request_headers,
            response_headers = %logged_response_headers,
        );
        Ok(response)
    }
}

fn capture_headers(headers: &HeaderMap, names: &[String]) -> String {
    let mut out = String::new();
    for name in names {
        if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}
