use std::{rc::Weak, time::Duration};

use gangway_core::config::HealthCheckConfig;
use http::{header, Request};
use tracing::debug;

use super::client;
use crate::{common::Signal, http::ProxyBody};

const PROBE_USER_AGENT: &str = concat!("Gangway Health Check/", env!("CARGO_PKG_VERSION"));

/// Receiver of probe outcomes. The target registers itself here; holding it
/// weakly keeps the probe loop from pinning a disposed target alive.
pub trait ProbeConsumer {
    fn probe_completed(&self, success: bool);
}

/// Where a probe connects and what it asks for.
#[derive(Debug, Clone)]
pub struct ProbeEndpoint {
    /// `host:port` to connect to (may differ from the traffic port).
    pub addr: String,
    /// Value for the `Host` header.
    pub host_header: String,
    pub path: String,
}

/// Periodic GET probe of one endpoint.
///
/// The loop reports `success = 2xx` to the consumer after every probe.
/// Closing (or dropping) the check wins over a pending tick, and results
/// that arrive after close are discarded rather than reported.
pub struct HealthCheck {
    shutdown: Signal,
}

impl HealthCheck {
    pub fn spawn(
        endpoint: ProbeEndpoint,
        config: HealthCheckConfig,
        consumer: Weak<dyn ProbeConsumer>,
    ) -> Self {
        let shutdown = Signal::new();
        monoio::spawn(run(endpoint, config, consumer, shutdown.clone()));
        Self { shutdown }
    }

    pub fn close(&self) {
        self.shutdown.fire();
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.shutdown.fire();
    }
}

async fn run(
    endpoint: ProbeEndpoint,
    config: HealthCheckConfig,
    consumer: Weak<dyn ProbeConsumer>,
    shutdown: Signal,
) {
    // A zero interval would busy-loop the probe.
    let period = config.interval.max(Duration::from_millis(100));
    let mut interval = monoio::time::interval(period);
    loop {
        let mut stop = shutdown.waiter();
        monoio::select! {
            _ = &mut stop => break,
            _ = interval.tick() => {}
        }
        if shutdown.fired() {
            break;
        }
        let success = probe(&endpoint, &config).await;
        if shutdown.fired() {
            break;
        }
        match consumer.upgrade() {
            Some(consumer) => consumer.probe_completed(success),
            None => break,
        }
    }
    debug!(endpoint = %endpoint.addr, "health check loop stopped");
}

async fn probe(endpoint: &ProbeEndpoint, config: &HealthCheckConfig) -> bool {
    let attempt = async {
        let mut sender = client::connect_http1(&endpoint.addr).await.ok()?;
        let request = Request::builder()
            .uri(endpoint.path.as_str())
            .header(header::HOST, endpoint.host_header.as_str())
            .header(header::USER_AGENT, PROBE_USER_AGENT)
            .body(ProxyBody::empty())
            .ok()?;
        let response = sender.send_request(request).await.ok()?;
        Some(response.status().is_success())
    };
    matches!(
        monoio::time::timeout(config.timeout, attempt).await,
        Ok(Some(true))
    )
}
