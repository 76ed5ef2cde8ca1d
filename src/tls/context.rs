use super::client_hello::ClientHelloInfo;
use super::socket::TlsSocket;
use super::verify;
use crate::error::Error;
use ::config::Config;
use rand::Rng;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::cell::OnceCell;
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Once};
use tracing::debug;

/// How a connection verifies its peer's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Use whatever the context was configured with.
    UseCtx,
    /// Verify the peer certificate; on the server side the client may
    /// still choose not to present one.
    Verify,
    /// Server side: verify and require a client certificate.
    VerifyReqClientCert,
    /// Accept any peer certificate.
    NoVerify,
}

/// How the peer's certificate name is checked once the chain verifies.
#[derive(Debug, Clone, Default)]
pub enum PeerNamePolicy {
    /// Chain validation only.
    #[default]
    Off,
    /// Match the connect hostname against the certificate common name and
    /// DNS subject alternative names, with left-most-label wildcards.
    CheckHostname,
    /// Match a fixed string against the certificate common name only.
    FixedName(String),
}

/// Outcome of the server-name (SNI) callback.
///
/// `Found` acknowledges the name to the client; `NotFound` continues the
/// handshake without acknowledging it; `FatalAlert` aborts with the fatal
/// unrecognized_name(112) alert of RFC 6066.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNameCallbackResult {
    Found,
    NotFound,
    FatalAlert,
}

/// One weighted entry in a randomized advertised-protocols set.
#[derive(Debug, Clone)]
pub struct NextProtocolsItem {
    pub weight: u32,
    pub protocols: Vec<Vec<u8>>,
}

/// Supplies passwords for encrypted key material.
pub trait PasswordCollector {
    fn get_password(&self, max_len: usize) -> Option<String>;

    /// A short description of the credential source, used in error
    /// messages and logs.
    fn describe(&self) -> String;
}

/// Server-side hook that runs after the ClientHello is parsed and may swap
/// the socket's context before the engine is built.
pub type ServerNameCallback = Box<dyn Fn(&mut TlsSocket) -> ServerNameCallbackResult>;

/// Observer invoked with the captured ClientHello, in registration order,
/// just before the server-name callback.
pub type ClientHelloObserver = Box<dyn Fn(&mut TlsSocket, &ClientHelloInfo)>;

fn ensure_crypto_provider() {
    // The engine's process-wide provider table must be pinned before the
    // first engine instance exists; later installs are ignored.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Builder for [`TlsContext`]. All mutation happens here; the built context
/// is immutable and shared.
pub struct TlsContextBuilder {
    cert_chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,
    client_ca: Option<RootCertStore>,
    verify: Option<VerifyMode>,
    peer_name_policy: PeerNamePolicy,
    cipher_suites: Vec<String>,
    advertised: Vec<NextProtocolsItem>,
    password_collector: Option<Box<dyn PasswordCollector>>,
    server_name_callback: Option<ServerNameCallback>,
    client_hello_observers: Vec<ClientHelloObserver>,
    parse_client_hello: bool,
}

impl Default for TlsContextBuilder {
    fn default() -> Self {
        Self {
            cert_chain: Vec::new(),
            key: None,
            roots: RootCertStore::empty(),
            client_ca: None,
            verify: None,
            peer_name_policy: PeerNamePolicy::Off,
            cipher_suites: Vec::new(),
            advertised: Vec::new(),
            password_collector: None,
            server_name_callback: None,
            client_hello_observers: Vec::new(),
            parse_client_hello: false,
        }
    }
}

impl TlsContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from configuration keys `tls_cert`, `tls_key`,
    /// and `tls_ca_cert` (namespaced under `name` when present).
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        // `{name}.{key}` wins over the bare key for named instances.
        let path_for = |key: &str| -> Option<String> {
            if !name.is_empty() {
                if let Ok(path) = config.get_string(&format!("{name}.{key}")) {
                    return Some(path);
                }
            }
            config.get_string(key).ok()
        };

        let cert = path_for("tls_cert");
        let key = path_for("tls_key");
        let ca = path_for("tls_ca_cert");

        let mut builder = Self::new();
        if let Some(path) = cert {
            builder = builder.load_cert_chain(&path)?;
        }
        if let Some(path) = key {
            builder = builder.load_private_key(&path)?;
        }
        if let Some(path) = ca {
            builder = builder.load_trusted_certs(&path)?;
        }
        Ok(builder)
    }

    /// Loads the certificate chain presented to peers.
    pub fn load_cert_chain(mut self, path: &str) -> Result<Self, Error> {
        self.cert_chain = read_cert_file(path)?;
        Ok(self)
    }

    /// Loads the private key matching the certificate chain.
    ///
    /// Set the password collector first if the key may be encrypted; the
    /// error for encrypted keys names the collector consulted.
    pub fn load_private_key(mut self, path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::TlsKeyLoad {
            path: path.to_string(),
            source: e,
        })?;
        if contents.contains("ENCRYPTED") {
            let collector = self
                .password_collector
                .as_ref()
                .map(|c| c.describe())
                .unwrap_or_else(|| "none".to_string());
            if let Some(collector) = &self.password_collector {
                // Collected so operators see the prompt exactly once even
                // though the PEM stack cannot decrypt.
                let _ = collector.get_password(256);
            }
            return Err(Error::TlsEncryptedKey { collector });
        }
        let key = private_key(&mut contents.as_bytes())
            .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
            .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))?;
        self.key = Some(key);
        Ok(self)
    }

    /// Loads the trust store used to verify peer certificates.
    pub fn load_trusted_certs(mut self, path: &str) -> Result<Self, Error> {
        let roots = read_cert_file(path)?;
        for cert in roots {
            self.roots
                .add(cert)
                .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
        }
        Ok(self)
    }

    /// Loads the CA list used by a server to validate client certificates.
    /// Falls back to the trust store when unset.
    pub fn load_client_ca_list(mut self, path: &str) -> Result<Self, Error> {
        let mut store = RootCertStore::empty();
        for cert in read_cert_file(path)? {
            store
                .add(cert)
                .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
        }
        self.client_ca = Some(store);
        Ok(self)
    }

    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify = Some(mode);
        self
    }

    pub fn peer_name_policy(mut self, policy: PeerNamePolicy) -> Self {
        self.peer_name_policy = policy;
        self
    }

    /// Restricts the cipher policy to the named suites (engine suite names,
    /// e.g. `TLS13_AES_128_GCM_SHA256`). Empty means engine defaults.
    pub fn cipher_suites(mut self, suites: Vec<String>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Advertises a single application-protocol list (ALPN).
    pub fn advertised_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.advertised = vec![NextProtocolsItem {
            weight: 1,
            protocols,
        }];
        self
    }

    /// Advertises one of several protocol lists, picked per handshake with
    /// probability weight/Σweights. Client-side connections use the first
    /// item only.
    pub fn randomized_advertised_protocols(mut self, items: Vec<NextProtocolsItem>) -> Self {
        self.advertised = items;
        self
    }

    pub fn password_collector(mut self, collector: Box<dyn PasswordCollector>) -> Self {
        self.password_collector = Some(collector);
        self
    }

    pub fn server_name_callback(mut self, callback: ServerNameCallback) -> Self {
        self.server_name_callback = Some(callback);
        self
    }

    /// Registers a ClientHello observer; implies ClientHello parsing.
    pub fn add_client_hello_observer(mut self, observer: ClientHelloObserver) -> Self {
        self.client_hello_observers.push(observer);
        self.parse_client_hello = true;
        self
    }

    pub fn enable_client_hello_parsing(mut self) -> Self {
        self.parse_client_hello = true;
        self
    }

    pub fn build(self) -> Arc<TlsContext> {
        Arc::new(TlsContext {
            cert_chain: self.cert_chain,
            key: self.key,
            roots: Arc::new(self.roots),
            client_ca: self.client_ca.map(Arc::new),
            verify: self.verify.unwrap_or(VerifyMode::Verify),
            peer_name_policy: self.peer_name_policy,
            cipher_suites: self.cipher_suites,
            advertised: self.advertised,
            server_name_callback: self.server_name_callback,
            client_hello_observers: self.client_hello_observers,
            parse_client_hello: self.parse_client_hello,
            client_config: OnceCell::new(),
            server_config: OnceCell::new(),
        })
    }
}

fn read_cert_file(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let parsed: Vec<CertificateDer> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;
    if parsed.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No certificates found in file".to_string(),
        ));
    }
    Ok(parsed)
}

/// Shared TLS configuration and engine factory.
///
/// Built once via [`TlsContextBuilder`], then shared (reference-counted)
/// by any number of connections; engine configurations are derived lazily
/// and cached.
pub struct TlsContext {
    cert_chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    roots: Arc<RootCertStore>,
    client_ca: Option<Arc<RootCertStore>>,
    verify: VerifyMode,
    peer_name_policy: PeerNamePolicy,
    cipher_suites: Vec<String>,
    advertised: Vec<NextProtocolsItem>,
    pub(crate) server_name_callback: Option<ServerNameCallback>,
    pub(crate) client_hello_observers: Vec<ClientHelloObserver>,
    pub(crate) parse_client_hello: bool,
    client_config: OnceCell<Arc<ClientConfig>>,
    server_config: OnceCell<Arc<ServerConfig>>,
}

impl TlsContext {
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::new()
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify
    }

    fn provider(&self) -> Result<Arc<CryptoProvider>, Error> {
        ensure_crypto_provider();
        let base = rustls::crypto::aws_lc_rs::default_provider();
        if self.cipher_suites.is_empty() {
            return Ok(Arc::new(base));
        }
        let selected: Vec<_> = base
            .cipher_suites
            .iter()
            .copied()
            .filter(|suite| {
                let name = format!("{:?}", suite.suite());
                self.cipher_suites.iter().any(|want| *want == name)
            })
            .collect();
        if selected.is_empty() {
            return Err(Error::TlsConfigBuild(
                "cipher list matches no supported suite".to_string(),
            ));
        }
        Ok(Arc::new(CryptoProvider {
            cipher_suites: selected,
            ..base
        }))
    }

    fn effective_verify(&self, requested: Option<VerifyMode>) -> VerifyMode {
        match requested {
            None | Some(VerifyMode::UseCtx) => match self.verify {
                VerifyMode::UseCtx => VerifyMode::Verify,
                mode => mode,
            },
            Some(mode) => mode,
        }
    }

    /// Client-side engine configuration, honoring a per-connection
    /// verification override.
    pub(crate) fn client_config(
        &self,
        requested: Option<VerifyMode>,
    ) -> Result<Arc<ClientConfig>, Error> {
        match requested {
            None | Some(VerifyMode::UseCtx) => {
                if let Some(config) = self.client_config.get() {
                    return Ok(config.clone());
                }
                let config = self.build_client_config(self.effective_verify(None))?;
                let _ = self.client_config.set(config.clone());
                Ok(config)
            }
            Some(mode) => self.build_client_config(mode),
        }
    }

    fn build_client_config(&self, mode: VerifyMode) -> Result<Arc<ClientConfig>, Error> {
        let provider = self.provider()?;
        let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> = if mode
            == VerifyMode::NoVerify
        {
            Arc::new(verify::NoVerification::new(
                provider.signature_verification_algorithms,
            ))
        } else {
            if self.roots.is_empty() {
                return Err(Error::TlsContextIncomplete(
                    "peer verification requires a trust store",
                ));
            }
            let webpki =
                WebPkiServerVerifier::builder_with_provider(self.roots.clone(), provider.clone())
                    .build()
                    .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
            match &self.peer_name_policy {
                PeerNamePolicy::Off => Arc::new(verify::IgnoreNameVerifier::new(webpki)),
                PeerNamePolicy::CheckHostname => Arc::new(verify::HostnameVerifier::new(webpki)),
                PeerNamePolicy::FixedName(name) => {
                    Arc::new(verify::FixedNameVerifier::new(webpki, name.clone()))
                }
            }
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = match (&self.key, self.cert_chain.is_empty()) {
            (Some(key), false) => builder
                .with_client_auth_cert(self.cert_chain.clone(), key.clone_key())
                .map_err(|e| Error::TlsConfigBuild(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self
            .advertised
            .first()
            .map(|item| item.protocols.clone())
            .unwrap_or_default();
        Ok(Arc::new(config))
    }

    /// Server-side engine configuration for one accept, honoring a
    /// per-connection verification override and making the weighted
    /// advertised-protocols pick.
    pub(crate) fn server_config_for_accept(
        &self,
        requested: Option<VerifyMode>,
    ) -> Result<Arc<ServerConfig>, Error> {
        let base = match requested {
            None | Some(VerifyMode::UseCtx) => {
                if let Some(config) = self.server_config.get() {
                    config.clone()
                } else {
                    let config = self.build_server_config(self.effective_verify(None))?;
                    let _ = self.server_config.set(config.clone());
                    config
                }
            }
            Some(mode) => self.build_server_config(mode)?,
        };

        if self.advertised.len() <= 1 {
            return Ok(base);
        }
        let protocols = self.pick_advertised_protocols();
        debug!(count = protocols.len(), "Randomized ALPN pick");
        let mut config = (*base).clone();
        config.alpn_protocols = protocols;
        Ok(Arc::new(config))
    }

    fn build_server_config(&self, mode: VerifyMode) -> Result<Arc<ServerConfig>, Error> {
        let provider = self.provider()?;
        let Some(key) = &self.key else {
            return Err(Error::TlsContextIncomplete(
                "accepting requires a certificate and private key",
            ));
        };
        if self.cert_chain.is_empty() {
            return Err(Error::TlsContextIncomplete(
                "accepting requires a certificate and private key",
            ));
        }

        let client_verifier: Arc<dyn rustls::server::danger::ClientCertVerifier> = match mode {
            VerifyMode::Verify | VerifyMode::VerifyReqClientCert => {
                let roots = self.client_ca.clone().unwrap_or_else(|| self.roots.clone());
                if roots.is_empty() {
                    return Err(Error::TlsContextIncomplete(
                        "client verification requires a CA list",
                    ));
                }
                let builder = WebPkiClientVerifier::builder_with_provider(roots, provider.clone());
                let builder = if mode == VerifyMode::Verify {
                    builder.allow_unauthenticated()
                } else {
                    builder
                };
                builder
                    .build()
                    .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
            }
            VerifyMode::NoVerify | VerifyMode::UseCtx => WebPkiClientVerifier::no_client_auth(),
        };

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(self.cert_chain.clone(), key.clone_key())
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        config.alpn_protocols = self
            .advertised
            .first()
            .map(|item| item.protocols.clone())
            .unwrap_or_default();
        Ok(Arc::new(config))
    }

    fn pick_advertised_protocols(&self) -> Vec<Vec<u8>> {
        let total: u64 = self.advertised.iter().map(|item| item.weight as u64).sum();
        if total == 0 {
            return Vec::new();
        }
        let mut ticket = rand::rng().random_range(0..total);
        for item in &self.advertised {
            let weight = item.weight as u64;
            if weight > ticket {
                return item.protocols.clone();
            }
            ticket -= weight;
        }
        Vec::new()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("certs", &self.cert_chain.len())
            .field("has_key", &self.key.is_some())
            .field("roots", &self.roots.len())
            .field("verify", &self.verify)
            .field("peer_name_policy", &self.peer_name_policy)
            .field("advertised", &self.advertised.len())
            .field("parse_client_hello", &self.parse_client_hello)
            .finish()
    }
}
