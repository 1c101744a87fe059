use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    time::Duration,
};

use futures_util::future::join_all;
use gangway_core::{
    config::TargetOptions,
    http::STATUS_CLIENT_CLOSED_REQUEST,
    ControlError,
};
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use tracing::{debug, info, warn};

use super::{
    buffer::{self, SpoolError},
    client::{UpstreamClient, UpstreamError},
    health::{HealthCheck, ProbeConsumer, ProbeEndpoint},
};
use crate::{
    common::{client_ip, ConnContext, Signal, Waiter},
    http::{
        copy::copy_duplex, generate_response, is_upgrade_request, BodyError, ProxyBody,
        X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO,
    },
};

/// Address of the upstream that produced a response; consumed by the access
/// log.
#[derive(Debug, Clone)]
pub struct UpstreamAddr(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Created, no successful probe yet.
    Adding,
    Healthy,
    Unhealthy,
    /// Refusing new requests while inflight ones complete or get cancelled.
    Draining,
}

/// A validated `host[:port]` upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub fn parse(raw: &str) -> Result<Self, ControlError> {
        let reject = || ControlError::InvalidTargetAddress(raw.to_string());
        let raw = raw.trim();
        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            // Bracketed v6 literal with optional port.
            let (addr, tail) = rest.split_once(']').ok_or_else(reject)?;
            if addr.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(reject());
            }
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse::<u16>().map_err(|_| reject())?,
                None if tail.is_empty() => 80,
                None => return Err(reject()),
            };
            (format!("[{addr}]"), port)
        } else {
            let (host, port) = match raw.rsplit_once(':') {
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| reject())?),
                None => (raw, 80),
            };
            if host.is_empty()
                || !host
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
            {
                return Err(reject());
            }
            (host.to_ascii_lowercase(), port)
        };
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bookkeeping for one admitted request.
pub struct InflightEntry {
    cancel: Signal,
    done: Signal,
    hijacked: Cell<bool>,
}

/// RAII admission token. Lives for as long as the request does — including
/// response body streaming and upgrade tunnels — and releases the inflight
/// entry on drop, which is what drains wait on.
pub struct RequestGuard {
    target: Rc<Target>,
    entry: Rc<InflightEntry>,
    id: u64,
}

impl RequestGuard {
    pub fn cancel_signal(&self) -> Signal {
        self.entry.cancel.clone()
    }

    pub fn cancelled(&self) -> Waiter {
        self.entry.cancel.waiter()
    }

    pub fn mark_hijacked(&self) {
        self.entry.hijacked.set(true);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.entry.done.fire();
        self.target.inflight.borrow_mut().remove(&self.id);
    }
}

#[derive(thiserror::Error, Debug)]
#[error("target is draining")]
pub struct DrainingError;

enum ProxyFailure {
    RequestTooLarge,
    ResponseTimeout,
    Draining,
    ClientGone,
    ResponseTooLarge,
    Upstream(UpstreamError),
    UpstreamBody(std::io::Error),
}

/// One upstream endpoint: forwards requests, tracks them while inflight,
/// probes health, and drains on replacement.
pub struct Target {
    addr: TargetAddr,
    options: TargetOptions,
    client: UpstreamClient,
    state: Cell<TargetState>,
    /// What `Draining` restores to once the drain finishes; health results
    /// arriving mid-drain update this instead of `state`.
    resume_state: Cell<TargetState>,
    inflight: RefCell<HashMap<u64, Rc<InflightEntry>>>,
    next_id: Cell<u64>,
    health_check: RefCell<Option<HealthCheck>>,
    healthy_waiters: RefCell<Vec<futures_channel::oneshot::Sender<()>>>,
}

impl Target {
    pub fn new(raw_addr: &str, options: TargetOptions) -> Result<Rc<Self>, ControlError> {
        let addr = TargetAddr::parse(raw_addr)?;
        let client = UpstreamClient::new(addr.authority());
        Ok(Rc::new(Self {
            addr,
            options,
            client,
            state: Cell::new(TargetState::Adding),
            resume_state: Cell::new(TargetState::Adding),
            inflight: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            health_check: RefCell::new(None),
            healthy_waiters: RefCell::new(Vec::new()),
        }))
    }

    pub fn addr(&self) -> &TargetAddr {
        &self.addr
    }

    pub fn options(&self) -> &TargetOptions {
        &self.options
    }

    pub fn state(&self) -> TargetState {
        self.state.get()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.get() == TargetState::Healthy
    }

    /// Used when restoring from a snapshot: upstreams may be rebooting with
    /// us, the next probe re-establishes the truth.
    pub fn mark_healthy(&self) {
        if self.state.get() != TargetState::Draining {
            self.state.set(TargetState::Healthy);
        }
    }

    pub fn begin_health_checks(self: &Rc<Self>) {
        let mut slot = self.health_check.borrow_mut();
        if slot.is_some() {
            return;
        }
        let hc = &self.options.health_check;
        let probe_port = hc.port.unwrap_or(self.addr.port());
        let mut path = hc.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let endpoint = ProbeEndpoint {
            addr: format!("{}:{}", self.addr.host(), probe_port),
            host_header: hc.host.clone().unwrap_or_else(|| self.addr.authority()),
            path,
        };
        let self_dyn: Rc<dyn ProbeConsumer> = self.clone();
        let consumer: std::rc::Weak<dyn ProbeConsumer> = Rc::downgrade(&self_dyn);
        *slot = Some(HealthCheck::spawn(endpoint, hc.clone(), consumer));
    }

    pub fn stop_health_checks(&self) {
        self.health_check.borrow_mut().take();
    }

    /// Resolves once the target has reported at least one successful probe.
    pub async fn wait_healthy(&self) {
        if self.is_healthy() {
            return;
        }
        let (tx, rx) = futures_channel::oneshot::channel();
        self.healthy_waiters.borrow_mut().push(tx);
        let _ = rx.await;
    }

    /// Admit a request. Fails while draining; the caller should try the next
    /// candidate.
    pub fn start_request(self: &Rc<Self>) -> Result<RequestGuard, DrainingError> {
        if self.state.get() == TargetState::Draining {
            return Err(DrainingError);
        }
        let entry = Rc::new(InflightEntry {
            cancel: Signal::new(),
            done: Signal::new(),
            hijacked: Cell::new(false),
        });
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.inflight.borrow_mut().insert(id, entry.clone());
        Ok(RequestGuard {
            target: self.clone(),
            entry,
            id,
        })
    }

    /// Forward one admitted request and shape the response. Failures never
    /// escape as errors: they are mapped to gateway status codes here.
    pub async fn serve(
        self: &Rc<Self>,
        guard: RequestGuard,
        mut req: Request<Incoming>,
        cx: &ConnContext,
        strip_prefix: Option<&str>,
    ) -> Response<ProxyBody> {
        let upgrading = is_upgrade_request(&req);
        let server_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));

        let cancel = guard.cancel_signal();
        let mut cancelled = guard.cancelled();
        let forwarded = monoio::select! {
            res = self.forward(req, cx, strip_prefix) => res,
            _ = &mut cancelled => Err(self.failure_response(ProxyFailure::Draining)),
        };
        let mut resp = match forwarded {
            Ok(resp) => resp,
            Err(direct) => return direct,
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(server_upgrade) = server_upgrade else {
                warn!(upstream = %self.addr, "unexpected 101 from upstream");
                return generate_response(StatusCode::BAD_GATEWAY);
            };
            guard.mark_hijacked();
            let client_upgrade = hyper::upgrade::on(&mut resp);
            let addr = self.addr.to_string();
            monoio::spawn(async move {
                match futures_util::future::join(server_upgrade, client_upgrade).await {
                    (Ok(server_io), Ok(client_io)) => {
                        let mut drain = cancel.waiter();
                        monoio::select! {
                            _ = copy_duplex(server_io, client_io) => {}
                            _ = &mut drain => debug!(upstream = %addr, "hijacked connection cancelled"),
                        }
                    }
                    (server, client) => {
                        debug!(upstream = %addr, server_ok = server.is_ok(), client_ok = client.is_ok(),
                            "upgrade handshake failed");
                    }
                }
                drop(guard);
            });
            let (mut parts, _) = resp.into_parts();
            parts.extensions.insert(UpstreamAddr(self.addr.to_string()));
            return Response::from_parts(parts, ProxyBody::empty());
        }

        self.finish_response(resp, cancel, guard, strip_prefix).await
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        cx: &ConnContext,
        strip_prefix: Option<&str>,
    ) -> Result<Response<Incoming>, Response<ProxyBody>> {
        let outbound = self.build_outbound(req, cx, strip_prefix).await?;
        match monoio::time::timeout(self.options.response_timeout, self.client.send(outbound)).await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(self.failure_response(classify_upstream_error(e))),
            Err(_) => Err(self.failure_response(ProxyFailure::ResponseTimeout)),
        }
    }

    async fn build_outbound(
        &self,
        req: Request<Incoming>,
        cx: &ConnContext,
        strip_prefix: Option<&str>,
    ) -> Result<Request<ProxyBody>, Response<ProxyBody>> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = outbound_path_and_query(&parts.uri, strip_prefix);
        parts.uri = Uri::builder()
            .path_and_query(path_and_query)
            .build()
            .map_err(|_| generate_response(StatusCode::BAD_REQUEST))?;

        let host_value = parts.headers.get(header::HOST).cloned();
        let upgrade_value = parts.headers.get(header::UPGRADE).cloned();
        strip_hop_headers(&mut parts.headers);
        if let Some(upgrade) = upgrade_value {
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            parts.headers.insert(header::UPGRADE, upgrade);
        }
        match &host_value {
            Some(host) => {
                parts.headers.insert(header::HOST, host.clone());
            }
            None => {
                if let Ok(authority) = HeaderValue::from_str(&self.addr.authority()) {
                    parts.headers.insert(header::HOST, authority);
                }
            }
        }
        self.set_forward_headers(&mut parts.headers, cx, host_value);

        let body = if self.options.buffer_requests {
            match buffer::spool(
                body,
                self.options.max_memory_buffer_size,
                self.options.max_request_body_size,
            )
            .await
            {
                Ok(buffered) => {
                    if let Ok(len) = HeaderValue::from_str(&buffered.total_len().to_string()) {
                        parts.headers.insert(header::CONTENT_LENGTH, len);
                    }
                    ProxyBody::spooled(buffered.into_body())
                }
                Err(SpoolError::MaximumSizeExceeded) => {
                    return Err(self.failure_response(ProxyFailure::RequestTooLarge))
                }
                Err(SpoolError::Io(e)) => {
                    return Err(self.failure_response(ProxyFailure::UpstreamBody(e)))
                }
                Err(SpoolError::Stream(_)) => {
                    return Err(self.failure_response(ProxyFailure::ClientGone))
                }
            }
        } else {
            ProxyBody::incoming(body).with_limit(self.options.max_request_body_size)
        };

        Ok(Request::from_parts(parts, body))
    }

    async fn finish_response(
        &self,
        resp: Response<Incoming>,
        cancel: Signal,
        guard: RequestGuard,
        strip_prefix: Option<&str>,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = resp.into_parts();
        strip_hop_headers(&mut parts.headers);
        parts.extensions.insert(UpstreamAddr(self.addr.to_string()));

        if self.options.scope_cookie_paths {
            if let Some(prefix) = strip_prefix {
                scope_cookie_paths(&mut parts.headers, prefix);
            }
        }

        let body = if self.options.buffer_responses {
            match buffer::spool(
                body,
                self.options.max_memory_buffer_size,
                self.options.max_response_body_size,
            )
            .await
            {
                Ok(buffered) => {
                    if let Ok(len) = HeaderValue::from_str(&buffered.total_len().to_string()) {
                        parts.headers.insert(header::CONTENT_LENGTH, len);
                    }
                    ProxyBody::spooled(buffered.into_body())
                }
                Err(SpoolError::MaximumSizeExceeded) => {
                    return self.failure_response(ProxyFailure::ResponseTooLarge)
                }
                Err(SpoolError::Io(e)) => {
                    return self.failure_response(ProxyFailure::UpstreamBody(e))
                }
                Err(SpoolError::Stream(e)) => {
                    warn!(upstream = %self.addr, "upstream body failed while buffering: {e}");
                    return generate_response(StatusCode::BAD_GATEWAY);
                }
            }
        } else {
            ProxyBody::incoming(body)
                .with_limit(self.options.max_response_body_size)
                .with_cancel(cancel)
                .with_guard(guard)
        };

        Response::from_parts(parts, body)
    }

    fn set_forward_headers(
        &self,
        headers: &mut HeaderMap,
        cx: &ConnContext,
        host_value: Option<HeaderValue>,
    ) {
        let trust = self.options.forward_headers;
        match (client_ip(cx), trust && headers.contains_key(X_FORWARDED_FOR)) {
            (Some(ip), true) => {
                let joined = headers
                    .get(X_FORWARDED_FOR)
                    .and_then(|v| v.to_str().ok())
                    .map(|prior| format!("{prior}, {ip}"))
                    .unwrap_or(ip);
                if let Ok(value) = HeaderValue::from_str(&joined) {
                    headers.insert(X_FORWARDED_FOR, value);
                }
            }
            (Some(ip), false) => {
                if let Ok(value) = HeaderValue::from_str(&ip) {
                    headers.insert(X_FORWARDED_FOR, value);
                }
            }
            (None, true) => {}
            (None, false) => {
                headers.remove(X_FORWARDED_FOR);
            }
        }
        if !(trust && headers.contains_key(X_FORWARDED_PROTO)) {
            let proto = if cx.tls { "https" } else { "http" };
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        }
        if !(trust && headers.contains_key(X_FORWARDED_HOST)) {
            match host_value {
                Some(host) => {
                    headers.insert(X_FORWARDED_HOST, host);
                }
                None => {
                    headers.remove(X_FORWARDED_HOST);
                }
            }
        }
    }

    fn failure_response(&self, failure: ProxyFailure) -> Response<ProxyBody> {
        let status = match &failure {
            ProxyFailure::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyFailure::ResponseTimeout | ProxyFailure::Draining => StatusCode::GATEWAY_TIMEOUT,
            ProxyFailure::ClientGone => {
                // The client already went away; the status exists for the
                // access log.
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyFailure::ResponseTooLarge
            | ProxyFailure::Upstream(_)
            | ProxyFailure::UpstreamBody(_) => StatusCode::BAD_GATEWAY,
        };
        match &failure {
            ProxyFailure::Upstream(e) => info!(upstream = %self.addr, status = %status, "proxy error: {e}"),
            ProxyFailure::UpstreamBody(e) => info!(upstream = %self.addr, status = %status, "proxy error: {e}"),
            ProxyFailure::ResponseTooLarge => {
                info!(upstream = %self.addr, status = %status, "response entity too large")
            }
            ProxyFailure::ClientGone => debug!(upstream = %self.addr, "client closed request"),
            _ => debug!(upstream = %self.addr, status = %status, "request not forwarded"),
        }
        let mut resp = generate_response(status);
        resp.extensions_mut()
            .insert(UpstreamAddr(self.addr.to_string()));
        resp
    }

    /// Stop admitting requests, then complete or cancel everything already
    /// admitted.
    ///
    /// Hijacked (upgraded) connections are cancelled right away: they are
    /// long-lived by nature and would otherwise hold the drain open for the
    /// full timeout. Anything still running when the timeout fires is
    /// cancelled and aborts at its next poll. The pre-drain state is
    /// restored afterwards so `Draining` is transient.
    pub async fn drain(&self, timeout: Duration) {
        if self.state.get() == TargetState::Draining {
            return;
        }
        self.resume_state.set(self.state.get());
        self.state.set(TargetState::Draining);

        // New admissions are refused from here on; taking the map decouples
        // cancellation from concurrent guard drops.
        let snapshot: Vec<Rc<InflightEntry>> =
            self.inflight.borrow_mut().drain().map(|(_, e)| e).collect();

        for entry in &snapshot {
            if entry.hijacked.get() {
                entry.cancel.fire();
            }
        }

        let all_done = join_all(snapshot.iter().map(|e| e.done.waiter()));
        if monoio::time::timeout(timeout, all_done).await.is_err() {
            info!(upstream = %self.addr, "drain timeout, cancelling remaining requests");
            for entry in &snapshot {
                entry.cancel.fire();
            }
        }

        self.state.set(self.resume_state.get());
    }

    /// Release health checks and refuse everything; used when the owning
    /// balancer goes away.
    pub fn dispose(&self) {
        self.stop_health_checks();
    }
}

impl ProbeConsumer for Target {
    fn probe_completed(&self, success: bool) {
        let current = self.state.get();
        let new_state = if success {
            TargetState::Healthy
        } else if current == TargetState::Adding {
            // Not healthy yet, but not "went unhealthy" either.
            TargetState::Adding
        } else {
            TargetState::Unhealthy
        };
        if current == TargetState::Draining {
            self.resume_state.set(new_state);
        } else if current != new_state {
            info!(upstream = %self.addr, healthy = success, "target health changed");
            self.state.set(new_state);
        }
        if success {
            for waiter in self.healthy_waiters.borrow_mut().drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

fn outbound_path_and_query(uri: &Uri, strip_prefix: Option<&str>) -> String {
    // The raw path and query bytes are carried over untouched; re-encoding
    // could change what the upstream sees.
    let original = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let Some(prefix) = strip_prefix.filter(|p| *p != "/") else {
        return original.to_string();
    };
    let Some(stripped) = original.strip_prefix(prefix) else {
        return original.to_string();
    };
    if stripped.is_empty() {
        return "/".to_string();
    }
    if stripped.starts_with('/') || stripped.starts_with('?') {
        let mut out = String::with_capacity(stripped.len() + 1);
        if stripped.starts_with('?') {
            out.push('/');
        }
        out.push_str(stripped);
        return out;
    }
    original.to_string()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_string())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    headers.remove(header::CONNECTION);
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
}

fn scope_cookie_paths(headers: &mut HeaderMap, prefix: &str) {
    let values: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    if values.is_empty() {
        return;
    }
    headers.remove(header::SET_COOKIE);
    for value in values {
        let rewritten = value
            .to_str()
            .ok()
            .and_then(|raw| {
                let mut parsed = cookie::Cookie::parse(raw.to_string()).ok()?;
                let scoped = match parsed.path() {
                    Some(path) => format!("{prefix}{path}"),
                    None => prefix.to_string(),
                };
                parsed.set_path(scoped);
                HeaderValue::from_str(&parsed.to_string()).ok()
            })
            .unwrap_or(value);
        headers.append(header::SET_COOKIE, rewritten);
    }
}

fn classify_upstream_error(error: UpstreamError) -> ProxyFailure {
    enum BodyCause {
        TooLarge,
        Cancelled,
        ClientGone,
    }
    let mut cause = None;
    if let UpstreamError::Protocol(e) = &error {
        // The inbound body's error travels inside hyper's send error; it
        // decides whether this was our limit, a drain, or the client leaving.
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
        while let Some(err) = source {
            if let Some(body_err) = err.downcast_ref::<BodyError>() {
                cause = match body_err {
                    BodyError::LimitExceeded => Some(BodyCause::TooLarge),
                    BodyError::Cancelled => Some(BodyCause::Cancelled),
                    BodyError::Stream(_) => Some(BodyCause::ClientGone),
                    BodyError::Io(_) => None,
                };
                break;
            }
            source = err.source();
        }
    }
    match cause {
        Some(BodyCause::TooLarge) => ProxyFailure::RequestTooLarge,
        Some(BodyCause::Cancelled) => ProxyFailure::Draining,
        Some(BodyCause::ClientGone) => ProxyFailure::ClientGone,
        None => ProxyFailure::Upstream(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_addr_parsing() {
        let addr = TargetAddr::parse("Web-1.internal:8080").unwrap();
        assert_eq!(addr.host(), "web-1.internal");
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.to_string(), "web-1.internal:8080");

        assert_eq!(TargetAddr::parse("localhost").unwrap().port(), 80);
        assert_eq!(TargetAddr::parse("[::1]:3000").unwrap().host(), "[::1]");
        assert_eq!(TargetAddr::parse("[::1]").unwrap().port(), 80);

        for bad in ["", "host:port", "ho st:80", "http://x:80", "[::1]x"] {
            assert!(TargetAddr::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn path_prefix_stripping() {
        let uri: Uri = "/api/users?q=a;b&x=%zz1".parse().unwrap();
        assert_eq!(
            outbound_path_and_query(&uri, Some("/api")),
            "/users?q=a;b&x=%zz1"
        );
        assert_eq!(
            outbound_path_and_query(&uri, None),
            "/api/users?q=a;b&x=%zz1"
        );
        assert_eq!(
            outbound_path_and_query(&uri, Some("/")),
            "/api/users?q=a;b&x=%zz1"
        );

        let root: Uri = "/api".parse().unwrap();
        assert_eq!(outbound_path_and_query(&root, Some("/api")), "/");
        let rooted_query: Uri = "/api?x=1".parse().unwrap();
        assert_eq!(outbound_path_and_query(&rooted_query, Some("/api")), "/?x=1");
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-app", HeaderValue::from_static("kept"));
        strip_hop_headers(&mut headers);
        assert!(headers.get("x-secret").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get("x-app").unwrap(), "kept");
    }

    #[test]
    fn cookie_paths_are_scoped_under_prefix() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Path=/; HttpOnly"),
        );
        headers.append(header::SET_COOKIE, HeaderValue::from_static("plain=1"));
        scope_cookie_paths(&mut headers, "/app");
        let values: Vec<_> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(values.iter().any(|v| v.contains("Path=/app/")), "{values:?}");
        assert!(values.iter().any(|v| v.contains("Path=/app")), "{values:?}");
    }

    #[monoio::test(timer_enabled = true)]
    async fn drain_refuses_new_requests_and_restores_state() {
        let target = Target::new("127.0.0.1:9", TargetOptions::default()).unwrap();
        target.mark_healthy();

        let guard = target.start_request().unwrap();
        let entry_cancel = guard.cancel_signal();
        guard.mark_hijacked();

        let draining = {
            let target = target.clone();
            monoio::spawn(async move { target.drain(Duration::from_secs(5)).await })
        };
        monoio::time::sleep(Duration::from_millis(5)).await;
        // Mid-drain: no admissions, hijacked entry already cancelled.
        assert_eq!(target.state(), TargetState::Draining);
        assert!(target.start_request().is_err());
        assert!(entry_cancel.fired());

        drop(guard);
        draining.await;
        assert_eq!(target.state(), TargetState::Healthy);
        assert!(target.start_request().is_ok());
    }

    #[monoio::test(timer_enabled = true)]
    async fn drain_timeout_cancels_stragglers() {
        let target = Target::new("127.0.0.1:9", TargetOptions::default()).unwrap();
        target.mark_healthy();
        let guard = target.start_request().unwrap();
        let cancel = guard.cancel_signal();

        target.drain(Duration::from_millis(20)).await;
        assert!(cancel.fired());
        assert_eq!(target.state(), TargetState::Healthy);
        drop(guard);
    }

    #[test]
    fn probe_results_drive_state() {
        let target = Target::new("127.0.0.1:9", TargetOptions::default()).unwrap();
        assert_eq!(target.state(), TargetState::Adding);
        // Failures before the first success leave the target in Adding.
        target.probe_completed(false);
        assert_eq!(target.state(), TargetState::Adding);
        target.probe_completed(true);
        assert_eq!(target.state(), TargetState::Healthy);
        target.probe_completed(false);
        assert_eq!(target.state(), TargetState::Unhealthy);
        target.probe_completed(true);
        assert_eq!(target.state(), TargetState::Healthy);
    }
}
