use std::{
    cell::Cell,
    collections::HashMap,
    rc::Rc,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use gangway_core::{config::TargetOptions, ControlError};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;

use super::target::Target;
use crate::{
    common::{client_ip, ConnContext},
    http::{generate_response, is_upgrade_request, ProxyBody, X_FORWARDED_FOR},
};

/// Process-wide affinity timestamps, shared by every worker's balancers so a
/// client pinned after a write stays pinned no matter which worker accepts
/// its next connection. Entries are pruned lazily on lookup.
#[derive(Clone, Default)]
pub struct AffinityRegistry {
    inner: Arc<Mutex<HashMap<(String, String), Instant>>>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(&self, service: &str) -> AffinityTable {
        AffinityTable {
            registry: self.clone(),
            service: service.to_string(),
        }
    }
}

/// The registry, scoped to one service.
#[derive(Clone)]
pub struct AffinityTable {
    registry: AffinityRegistry,
    service: String,
}

impl AffinityTable {
    pub fn is_pinned(&self, client: &str, window: Duration) -> bool {
        let key = (self.service.clone(), client.to_string());
        let mut map = self.registry.inner.lock().unwrap();
        match map.get(&key) {
            Some(last_write) if last_write.elapsed() < window => true,
            Some(_) => {
                map.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn touch(&self, client: &str) {
        let key = (self.service.clone(), client.to_string());
        self.registry.inner.lock().unwrap().insert(key, Instant::now());
    }
}

/// An ordered set of upstream targets for one service slot.
///
/// Writers serve everything and must all be healthy for the balancer to be
/// healthy; readers only serve idempotent reads. Requests rotate through the
/// healthy candidates; a client that recently wrote is pinned back to
/// writers until the affinity window passes.
pub struct LoadBalancer {
    writers: Vec<Rc<Target>>,
    readers: Vec<Rc<Target>>,
    next: Cell<usize>,
    affinity: AffinityTable,
    health_path: String,
    writer_affinity_timeout: Duration,
    readers_accept_websockets: bool,
    trust_forward_headers: bool,
}

impl LoadBalancer {
    pub fn build(
        writer_addrs: &[String],
        reader_addrs: &[String],
        options: &TargetOptions,
        affinity: AffinityTable,
    ) -> Result<Rc<Self>, ControlError> {
        let writers = build_targets(writer_addrs, options, &[])?;
        let readers = build_targets(reader_addrs, options, &writers)?;
        let mut health_path = options.health_check.path.clone();
        if !health_path.starts_with('/') {
            health_path.insert(0, '/');
        }
        Ok(Rc::new(Self {
            writers,
            readers,
            next: Cell::new(0),
            affinity,
            health_path,
            writer_affinity_timeout: options.writer_affinity_timeout,
            readers_accept_websockets: options.readers_accept_websockets,
            trust_forward_headers: options.forward_headers,
        }))
    }

    fn targets(&self) -> impl Iterator<Item = &Rc<Target>> {
        self.writers.iter().chain(self.readers.iter())
    }

    pub fn writer_addrs(&self) -> Vec<String> {
        self.writers.iter().map(|t| t.addr().to_string()).collect()
    }

    pub fn reader_addrs(&self) -> Vec<String> {
        self.readers.iter().map(|t| t.addr().to_string()).collect()
    }

    /// Healthy iff every writer is healthy (and there is at least one).
    pub fn is_healthy(&self) -> bool {
        !self.writers.is_empty() && self.writers.iter().all(|t| t.is_healthy())
    }

    pub fn begin_health_checks(&self) {
        for target in self.targets() {
            target.begin_health_checks();
        }
    }

    /// Start probing and wait until every writer has reported at least one
    /// success, or fail the deployment.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> Result<(), ControlError> {
        self.begin_health_checks();
        let all_writers = join_all(self.writers.iter().map(|t| t.wait_healthy()));
        monoio::time::timeout(timeout, all_writers)
            .await
            .map(|_| ())
            .map_err(|_| ControlError::TargetFailedToBecomeHealthy)
    }

    /// Only used when restoring a snapshot.
    pub fn mark_all_healthy(&self) {
        for target in self.targets() {
            target.mark_healthy();
        }
    }

    pub async fn drain_all(&self, timeout: Duration) {
        join_all(self.targets().map(|t| t.drain(timeout))).await;
    }

    pub fn dispose(&self) {
        for target in self.targets() {
            target.dispose();
        }
    }

    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        cx: &ConnContext,
        strip_prefix: Option<&str>,
    ) -> Response<ProxyBody> {
        // The probe path is answered here, never forwarded: external load
        // balancers keep seeing 200 regardless of what is behind us.
        if req.uri().path() == self.health_path {
            return generate_response(StatusCode::OK);
        }

        let readable = is_readable_request(&req, self.readers_accept_websockets);
        let client = self.affinity_client(&req, cx);
        let pinned = client
            .as_deref()
            .map(|c| self.affinity.is_pinned(c, self.writer_affinity_timeout))
            .unwrap_or(false);

        let healthy_writers: Vec<&Rc<Target>> =
            self.writers.iter().filter(|t| t.is_healthy()).collect();
        let mut candidates = healthy_writers;
        if readable && !(pinned && !candidates.is_empty()) {
            candidates.extend(self.readers.iter().filter(|t| t.is_healthy()));
        }
        if candidates.is_empty() {
            return generate_response(StatusCode::SERVICE_UNAVAILABLE);
        }

        let is_write = !matches!(
            *req.method(),
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        );
        let start = self.next.get();
        for i in 0..candidates.len() {
            let idx = (start + i) % candidates.len();
            let target = candidates[idx];
            // Admission can race a drain; fall through to the next
            // candidate, each tried at most once.
            match target.start_request() {
                Ok(guard) => {
                    self.next.set((idx + 1) % candidates.len());
                    let response = target.serve(guard, req, cx, strip_prefix).await;
                    if is_write {
                        if let Some(client) = &client {
                            self.affinity.touch(client);
                        }
                    }
                    return response;
                }
                Err(_) => continue,
            }
        }
        generate_response(StatusCode::SERVICE_UNAVAILABLE)
    }

    fn affinity_client(&self, req: &Request<Incoming>, cx: &ConnContext) -> Option<String> {
        if self.trust_forward_headers {
            let forwarded = req
                .headers()
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            if forwarded.is_some() {
                return forwarded;
            }
        }
        client_ip(cx)
    }
}

fn is_readable_request<B>(req: &Request<B>, readers_accept_websockets: bool) -> bool {
    matches!(*req.method(), Method::GET | Method::HEAD)
        && (!is_upgrade_request(req) || readers_accept_websockets)
}

fn build_targets(
    addrs: &[String],
    options: &TargetOptions,
    existing: &[Rc<Target>],
) -> Result<Vec<Rc<Target>>, ControlError> {
    let mut targets: Vec<Rc<Target>> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let target = Target::new(addr, options.clone())?;
        let duplicate = targets
            .iter()
            .chain(existing.iter())
            .any(|t| t.addr() == target.addr());
        if !duplicate {
            targets.push(target);
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;

    #[test]
    fn affinity_pins_within_window_only() {
        let registry = AffinityRegistry::new();
        let table = registry.scoped("svc");
        assert!(!table.is_pinned("1.2.3.4", Duration::from_secs(10)));
        table.touch("1.2.3.4");
        assert!(table.is_pinned("1.2.3.4", Duration::from_secs(10)));
        assert!(!table.is_pinned("1.2.3.4", Duration::from_nanos(1)));
        // The zero-window lookup pruned the entry.
        assert!(!table.is_pinned("1.2.3.4", Duration::from_secs(10)));
    }

    #[test]
    fn affinity_is_scoped_per_service() {
        let registry = AffinityRegistry::new();
        registry.scoped("a").touch("1.2.3.4");
        assert!(!registry.scoped("b").is_pinned("1.2.3.4", Duration::from_secs(10)));
    }

    #[test]
    fn readable_classification() {
        let get = Request::builder().method(Method::GET).body(()).unwrap();
        assert!(is_readable_request(&get, false));
        let post = Request::builder().method(Method::POST).body(()).unwrap();
        assert!(!is_readable_request(&post, false));

        let ws = Request::builder()
            .method(Method::GET)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_readable_request(&ws, false));
        assert!(is_readable_request(&ws, true));
    }

    #[test]
    fn duplicate_targets_are_collapsed() {
        let options = TargetOptions::default();
        let writers = build_targets(
            &["web-1:80".to_string(), "web-1".to_string(), "web-2:80".to_string()],
            &options,
            &[],
        )
        .unwrap();
        assert_eq!(writers.len(), 2);
        // A reader that duplicates a writer is dropped too.
        let readers = build_targets(&["web-2:80".to_string()], &options, &writers).unwrap();
        assert!(readers.is_empty());
    }
}
