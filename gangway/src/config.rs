use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use gangway_core::config::RuntimeConfig;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Process configuration, loaded from a toml or json file. Every field has
/// a default so the proxy also runs bare.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    /// Admin channel unix socket.
    pub socket_path: PathBuf,
    /// Routing table snapshot, rewritten after every mutation.
    pub state_file: PathBuf,
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            socket_path: PathBuf::from("/var/run/gangway.sock"),
            state_file: PathBuf::from("/var/lib/gangway/state.json"),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = gangway_core::util::file_read(path).await?;
        Self::from_slice(&content)
    }

    pub fn from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<T>(content).map_err(Into::into),
            false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.https_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_and_json_both_parse() {
        let toml_config: Config = Config::from_slice(
            b"http_port = 8080\nhttps_port = 8443\nsocket_path = \"/tmp/gw.sock\"",
        )
        .unwrap();
        assert_eq!(toml_config.http_port, 8080);
        assert_eq!(toml_config.socket_path, PathBuf::from("/tmp/gw.sock"));

        let json_config: Config =
            Config::from_slice(br#"{ "http_port": 8080, "runtime": { "worker_threads": 2 } }"#)
                .unwrap();
        assert_eq!(json_config.http_port, 8080);
        assert_eq!(json_config.runtime.worker_threads, 2);
        assert_eq!(json_config.https_port, 443);
    }
}
