//! The admin channel: newline-delimited JSON over a unix socket.
//!
//! The socket is bound on the control thread and stays responsive no matter
//! what the traffic plane is doing — a fully paused proxy can still be
//! resumed. Errors travel back verbatim; operators match on their text.
use std::{path::Path, rc::Rc, time::Duration};

use gangway_core::{
    config::{ServiceOptions, TargetOptions},
    listener::{AcceptedStream, ListenerBuilder},
    AnyResult,
};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRentExt},
    net::UnixStream,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::control::{Controller, DeployRequest, RolloutDeployRequest};

const fn default_deploy_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_pause_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Deserialize)]
struct AdminRequest {
    #[serde(default)]
    id: u64,
    #[serde(flatten)]
    command: AdminCommand,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
enum AdminCommand {
    Deploy(DeployArgs),
    RolloutDeploy(RolloutDeployArgs),
    RolloutSet {
        service: String,
        percentage: u8,
        #[serde(default)]
        allowlist: Vec<String>,
    },
    RolloutStop {
        service: String,
    },
    Pause {
        service: String,
        #[serde(default = "default_drain_timeout", with = "gangway_core::util::duration_ms")]
        drain_timeout: Duration,
        #[serde(default = "default_pause_timeout", with = "gangway_core::util::duration_ms")]
        pause_timeout: Duration,
    },
    Stop {
        service: String,
        #[serde(default = "default_drain_timeout", with = "gangway_core::util::duration_ms")]
        drain_timeout: Duration,
        #[serde(default)]
        message: Option<String>,
    },
    Resume {
        service: String,
    },
    Remove {
        service: String,
    },
    List,
}

#[derive(Debug, Deserialize)]
struct DeployArgs {
    service: String,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    readers: Vec<String>,
    #[serde(default)]
    service_options: ServiceOptions,
    #[serde(default)]
    target_options: TargetOptions,
    #[serde(default = "default_deploy_timeout", with = "gangway_core::util::duration_ms")]
    deploy_timeout: Duration,
    #[serde(default = "default_drain_timeout", with = "gangway_core::util::duration_ms")]
    drain_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RolloutDeployArgs {
    service: String,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    readers: Vec<String>,
    #[serde(default = "default_deploy_timeout", with = "gangway_core::util::duration_ms")]
    deploy_timeout: Duration,
    #[serde(default = "default_drain_timeout", with = "gangway_core::util::duration_ms")]
    drain_timeout: Duration,
}

pub async fn run(controller: Rc<Controller>, socket_path: &Path) -> AnyResult<()> {
    let builder = ListenerBuilder::bind_unix(socket_path)?;
    let mut listener = builder.build()?;
    info!(socket = %socket_path.display(), "admin channel up");
    loop {
        match listener.accept().await {
            Ok((AcceptedStream::Unix(stream), _)) => {
                let controller = controller.clone();
                monoio::spawn(handle_conn(controller, stream));
            }
            Ok(_) => {}
            Err(e) => warn!("admin accept failed: {e}"),
        }
    }
}

async fn handle_conn(controller: Rc<Controller>, mut stream: UnixStream) {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let chunk = vec![0u8; 4096];
        let (res, chunk) = stream.read(chunk).await;
        match res {
            Ok(0) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("admin connection read failed: {e}");
                break;
            }
        }
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let reply = process_line(&controller, line).await;
            let mut out = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{}".to_vec());
            out.push(b'\n');
            let (res, _) = stream.write_all(out).await;
            if res.is_err() {
                return;
            }
        }
    }
}

async fn process_line(controller: &Rc<Controller>, line: &[u8]) -> serde_json::Value {
    let request: AdminRequest = match serde_json::from_slice(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({ "id": 0, "ok": false, "error": format!("invalid request: {e}") })
        }
    };
    let id = request.id;
    match execute(controller, request.command).await {
        Ok(None) => json!({ "id": id, "ok": true }),
        Ok(Some(services)) => json!({ "id": id, "ok": true, "services": services }),
        Err(e) => json!({ "id": id, "ok": false, "error": e.to_string() }),
    }
}

async fn execute(
    controller: &Rc<Controller>,
    command: AdminCommand,
) -> AnyResult<Option<serde_json::Value>> {
    match command {
        AdminCommand::Deploy(args) => {
            controller
                .deploy(DeployRequest {
                    service: args.service,
                    writers: args.targets,
                    readers: args.readers,
                    service_options: args.service_options,
                    target_options: args.target_options,
                    deploy_timeout: args.deploy_timeout,
                    drain_timeout: args.drain_timeout,
                })
                .await?;
            Ok(None)
        }
        AdminCommand::RolloutDeploy(args) => {
            controller
                .rollout_deploy(RolloutDeployRequest {
                    service: args.service,
                    writers: args.targets,
                    readers: args.readers,
                    deploy_timeout: args.deploy_timeout,
                    drain_timeout: args.drain_timeout,
                })
                .await?;
            Ok(None)
        }
        AdminCommand::RolloutSet {
            service,
            percentage,
            allowlist,
        } => {
            controller
                .set_rollout_split(&service, percentage.min(100), allowlist)
                .await?;
            Ok(None)
        }
        AdminCommand::RolloutStop { service } => {
            controller.stop_rollout(&service).await?;
            Ok(None)
        }
        AdminCommand::Pause {
            service,
            drain_timeout,
            pause_timeout,
        } => {
            controller.pause(&service, drain_timeout, pause_timeout).await?;
            Ok(None)
        }
        AdminCommand::Stop {
            service,
            drain_timeout,
            message,
        } => {
            controller.stop(&service, drain_timeout, message).await?;
            Ok(None)
        }
        AdminCommand::Resume { service } => {
            controller.resume(&service).await?;
            Ok(None)
        }
        AdminCommand::Remove { service } => {
            controller.remove(&service).await?;
            Ok(None)
        }
        AdminCommand::List => Ok(Some(controller.list())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_with_defaults() {
        let raw = br#"{"id":7,"cmd":"deploy","args":{"service":"web","targets":["web-1:3000"]}}"#;
        let request: AdminRequest = serde_json::from_slice(raw).unwrap();
        assert_eq!(request.id, 7);
        match request.command {
            AdminCommand::Deploy(args) => {
                assert_eq!(args.service, "web");
                assert_eq!(args.targets, vec!["web-1:3000"]);
                assert_eq!(args.deploy_timeout, Duration::from_secs(30));
                assert!(args.service_options.hosts.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn pause_with_short_timeout_parses() {
        let raw = br#"{"id":1,"cmd":"pause","args":{"service":"web","drain_timeout":1000,"pause_timeout":50}}"#;
        let request: AdminRequest = serde_json::from_slice(raw).unwrap();
        match request.command {
            AdminCommand::Pause {
                pause_timeout,
                drain_timeout,
                ..
            } => {
                assert_eq!(pause_timeout, Duration::from_millis(50));
                assert_eq!(drain_timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn list_without_args_parses() {
        let raw = br#"{"cmd":"list"}"#;
        let request: AdminRequest = serde_json::from_slice(raw).unwrap();
        assert!(matches!(request.command, AdminCommand::List));
    }
}
