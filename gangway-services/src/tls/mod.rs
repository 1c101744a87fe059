//! Certificate sourcing and SNI resolution.
//!
//! Certificates live in a process-wide [`CertStore`] shared by every
//! worker's TLS acceptor; the control plane rebuilds the store's entries on
//! deploys and removals. A [`CertSource`] answers `(server name) ->
//! certificate`; static PEM pairs and an externally provisioned ACME cache
//! directory are the two built-in sources.
use std::{
    collections::HashMap,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use gangway_core::{config::host_matches_pattern, util::hash::sha256, ControlError};
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    Certificate, PrivateKey,
};
use tracing::debug;

/// Prefix owned by http-01 challenges; requests under it are answered by
/// the certificate source, never forwarded.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub trait CertSource: Send + Sync {
    fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ControlError>;

    /// Body for an http-01 challenge token, when the source provisions over
    /// plain http. Sources that get their material out of band return None.
    fn challenge_response(&self, _token_path: &str) -> Option<String> {
        None
    }
}

/// A static PEM pair, loaded once at deploy time.
pub struct StaticCertSource {
    key: Arc<CertifiedKey>,
}

impl StaticCertSource {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ControlError> {
        let certs = read_cert_chain(cert_path)?;
        let key = read_private_key(key_path)?;
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|_| ControlError::UnableToLoadKeyPair)?;
        Ok(Self {
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }
}

impl CertSource for StaticCertSource {
    fn certificate(&self, _server_name: &str) -> Result<Arc<CertifiedKey>, ControlError> {
        Ok(self.key.clone())
    }
}

/// Reads per-host PEM pairs (`<host>/fullchain.pem`, `<host>/privkey.pem`)
/// from a cache directory an external provisioner fills. The cache root is
/// scoped by the hash of the directory endpoint so certificates from
/// different endpoints never mix.
pub struct CachedCertSource {
    cache_dir: PathBuf,
    loaded: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CachedCertSource {
    pub fn new(cache_root: &Path, directory_url: &str) -> Self {
        let scope = sha256(directory_url);
        Self {
            cache_dir: cache_root.join(&scope[..16]),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl CertSource for CachedCertSource {
    fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ControlError> {
        if server_name.is_empty()
            || server_name
                .bytes()
                .any(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.')))
        {
            return Err(ControlError::UnknownServerName(server_name.to_string()));
        }
        if let Some(key) = self.loaded.lock().unwrap().get(server_name) {
            return Ok(key.clone());
        }
        let host_dir = self.cache_dir.join(server_name);
        let source = StaticCertSource::load(
            &host_dir.join("fullchain.pem"),
            &host_dir.join("privkey.pem"),
        )?;
        let key = source.key;
        self.loaded
            .lock()
            .unwrap()
            .insert(server_name.to_string(), key.clone());
        Ok(key)
    }
}

/// One host pattern mapped to its certificate source.
pub struct CertEntry {
    pub pattern: String,
    pub source: Arc<dyn CertSource>,
}

#[derive(Default)]
struct CertStoreInner {
    entries: Vec<CertEntry>,
    default_host: Option<String>,
}

/// SNI -> certificate resolution, shared across workers.
#[derive(Default)]
pub struct CertStore {
    inner: RwLock<CertStoreInner>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale replacement by the control plane after a mutation.
    /// `default_host` covers clients probing without SNI.
    pub fn update(&self, entries: Vec<CertEntry>, default_host: Option<String>) {
        let mut inner = self.inner.write().unwrap();
        inner.entries = entries;
        inner.default_host = default_host;
    }

    pub fn certificate_for(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, ControlError> {
        let inner = self.inner.read().unwrap();
        let name = match server_name {
            Some(name) => name.to_ascii_lowercase(),
            None => inner
                .default_host
                .clone()
                .ok_or(ControlError::NoServerName)?,
        };
        // Exact entries win over wildcards.
        for entry in &inner.entries {
            if entry.pattern == name {
                return entry.source.certificate(&name);
            }
        }
        for entry in &inner.entries {
            if host_matches_pattern(&entry.pattern, &name) {
                return entry.source.certificate(&name);
            }
        }
        Err(ControlError::UnknownServerName(name))
    }

    /// Delegate an http-01 challenge request to the host's source.
    pub fn challenge_response(&self, host: &str, token_path: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        for entry in &inner.entries {
            if entry.pattern == host || host_matches_pattern(&entry.pattern, host) {
                return entry.source.challenge_response(token_path);
            }
        }
        None
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.certificate_for(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("tls handshake without usable certificate: {e}");
                None
            }
        }
    }
}

/// The rustls server config every worker's acceptor shares.
pub fn server_config(store: Arc<CertStore>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(store);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn read_cert_chain(path: &Path) -> Result<Vec<Certificate>, ControlError> {
    let file = std::fs::File::open(path).map_err(|_| ControlError::UnableToLoadKeyPair)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|_| ControlError::UnableToLoadKeyPair)?;
    if certs.is_empty() {
        return Err(ControlError::UnableToLoadKeyPair);
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_private_key(path: &Path) -> Result<PrivateKey, ControlError> {
    let file = std::fs::File::open(path).map_err(|_| ControlError::UnableToLoadKeyPair)?;
    let mut reader = BufReader::new(file);
    while let Some(item) =
        rustls_pemfile::read_one(&mut reader).map_err(|_| ControlError::UnableToLoadKeyPair)?
    {
        match item {
            rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::ECKey(der) => return Ok(PrivateKey(der)),
            _ => continue,
        }
    }
    Err(ControlError::UnableToLoadKeyPair)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingSource(AtomicUsize);

    impl CertSource for CountingSource {
        fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ControlError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            // No real key material in unit tests; the caller only checks
            // which entry was consulted.
            Err(ControlError::UnknownServerName(server_name.to_string()))
        }
    }

    fn store_with(patterns: &[&str], default_host: Option<&str>) -> (CertStore, Vec<Arc<CountingSource>>) {
        let store = CertStore::new();
        let sources: Vec<Arc<CountingSource>> = patterns
            .iter()
            .map(|_| Arc::new(CountingSource(AtomicUsize::new(0))))
            .collect();
        store.update(
            patterns
                .iter()
                .zip(&sources)
                .map(|(pattern, source)| CertEntry {
                    pattern: pattern.to_string(),
                    source: source.clone() as Arc<dyn CertSource>,
                })
                .collect(),
            default_host.map(str::to_string),
        );
        (store, sources)
    }

    #[test]
    fn no_sni_and_no_default_is_an_error() {
        let (store, _) = store_with(&["example.com"], None);
        match store.certificate_for(None) {
            Err(e) => assert_eq!(e, ControlError::NoServerName),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn no_sni_falls_back_to_default_host() {
        let (store, sources) = store_with(&["example.com"], Some("example.com"));
        let _ = store.certificate_for(None);
        assert_eq!(sources[0].0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_entry_wins_over_wildcard() {
        let (store, sources) = store_with(&["*.example.com", "app.example.com"], None);
        let _ = store.certificate_for(Some("app.example.com"));
        assert_eq!(sources[0].0.load(Ordering::SeqCst), 0);
        assert_eq!(sources[1].0.load(Ordering::SeqCst), 1);

        let _ = store.certificate_for(Some("other.example.com"));
        assert_eq!(sources[0].0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_name_is_reported() {
        let (store, _) = store_with(&["example.com"], None);
        match store.certificate_for(Some("nope.dev")) {
            Err(e) => assert_eq!(e, ControlError::UnknownServerName("nope.dev".to_string())),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn cache_source_scopes_by_directory_hash() {
        let root = std::env::temp_dir();
        let a = CachedCertSource::new(&root, "https://acme.example/directory");
        let b = CachedCertSource::new(&root, "https://other.example/directory");
        assert_ne!(a.cache_dir(), b.cache_dir());
    }
}
