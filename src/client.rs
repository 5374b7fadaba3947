//! Transport connection setup.
//!
//! Reads the handful of kubeconfig fields the generator needs (server URL,
//! CA, token or client certificate) and builds one HTTP client per
//! configured connection. Each [`ApiClient`] owns its own connection pool,
//! so distinct instances really are distinct transport connections.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Certificate, Identity, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ContentType;

/// User agent advertised unless overridden.
pub const DEFAULT_USER_AGENT: &str = concat!("kubeload/", env!("CARGO_PKG_VERSION"));

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

/// Errors that can occur while building transport connections.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to read kubeconfig: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse kubeconfig: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("invalid server URL '{url}': {reason}")]
    Server { url: String, reason: String },

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// One pre-built transport connection to the API server.
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: Url, http: reqwest::Client) -> Self {
        Self { base, http }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient").field("base", &self.base).finish()
    }
}

/// Inputs for [`build_clients`].
#[derive(Debug, Clone, Default)]
pub struct ClientPoolConfig {
    pub kubeconfig: Option<PathBuf>,
    pub conns: usize,
    pub content_type: ContentType,
    pub disable_http2: bool,
    pub user_agent: Option<String>,
}

/// Builds `conns` independent clients against the kubeconfig's current
/// cluster, or against localhost when no kubeconfig is given.
pub fn build_clients(cfg: &ClientPoolConfig) -> Result<Vec<ApiClient>, ClientError> {
    let (cluster, user) = match &cfg.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::from_file(path)?;
            kubeconfig.resolve()?
        }
        None => {
            warn!("no kubeconfig given, targeting {}", DEFAULT_SERVER);
            (
                ClusterConfig {
                    server: DEFAULT_SERVER.to_string(),
                    ..ClusterConfig::default()
                },
                UserConfig::default(),
            )
        }
    };

    let base = Url::parse(&cluster.server).map_err(|e| ClientError::Server {
        url: cluster.server.clone(),
        reason: e.to_string(),
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(cfg.content_type.accept_header()),
    );
    let agent = cfg.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    headers.insert(USER_AGENT, HeaderValue::from_str(agent)?);
    if let Some(token) = &user.token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    let ca_certs = cluster.load_ca_certs()?;
    let identity = user.load_identity()?;

    let conns = cfg.conns.max(1);
    let mut clients = Vec::with_capacity(conns);
    for i in 0..conns {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .default_headers(headers.clone())
            .tcp_keepalive(Some(Duration::from_secs(30)));

        if cfg.disable_http2 {
            builder = builder.http1_only();
        }
        if cluster.insecure_skip_tls_verify {
            warn!("skipping TLS certificate verification");
            builder = builder.danger_accept_invalid_certs(true);
        }
        for cert in &ca_certs {
            builder = builder.add_root_certificate(cert.clone());
        }
        if let Some(identity) = &identity {
            builder = builder.identity(identity.clone());
        }

        clients.push(ApiClient::new(base.clone(), builder.build()?));
        debug!(conn = i, server = %base, "built connection");
    }

    Ok(clients)
}

/// The subset of a kubeconfig this generator understands.
#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default, rename = "current-context")]
    current_context: String,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClusterConfig {
    server: String,
    #[serde(default, rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
    #[serde(default, rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserConfig {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(default, rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(default, rename = "client-key")]
    client_key: Option<PathBuf>,
    #[serde(default, rename = "client-key-data")]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextConfig,
}

#[derive(Debug, Deserialize)]
struct ContextConfig {
    cluster: String,
    #[serde(default)]
    user: String,
}

impl Kubeconfig {
    fn from_file(path: &Path) -> Result<Self, ClientError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Picks the cluster and user of the current context, falling back to
    /// the first entries when no current context is named.
    fn resolve(&self) -> Result<(ClusterConfig, UserConfig), ClientError> {
        if self.clusters.is_empty() {
            return Err(ClientError::Kubeconfig("no clusters defined".into()));
        }

        let (cluster_name, user_name) = match self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
        {
            Some(ctx) => (ctx.context.cluster.clone(), ctx.context.user.clone()),
            None => (
                self.clusters[0].name.clone(),
                self.users.first().map(|u| u.name.clone()).unwrap_or_default(),
            ),
        };

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .ok_or_else(|| {
                ClientError::Kubeconfig(format!("cluster '{}' not found", cluster_name))
            })?
            .cluster
            .clone();

        let user = self
            .users
            .iter()
            .find(|u| u.name == user_name)
            .map(|u| u.user.clone())
            .unwrap_or_default();

        Ok((cluster, user))
    }
}

impl ClusterConfig {
    fn load_ca_certs(&self) -> Result<Vec<Certificate>, ClientError> {
        let pem = match (&self.certificate_authority_data, &self.certificate_authority) {
            (Some(data), _) => BASE64
                .decode(data.trim())
                .map_err(|e| ClientError::Tls(format!("certificate-authority-data: {}", e)))?,
            (None, Some(path)) => fs::read(path)?,
            (None, None) => return Ok(Vec::new()),
        };

        let mut cursor = std::io::Cursor::new(pem.as_slice());
        let mut certs = Vec::new();
        for entry in rustls_pemfile::certs(&mut cursor) {
            let der =
                entry.map_err(|e| ClientError::Tls(format!("bad CA certificate PEM: {}", e)))?;
            certs.push(
                Certificate::from_der(&der)
                    .map_err(|e| ClientError::Tls(format!("bad CA certificate: {}", e)))?,
            );
        }
        if certs.is_empty() {
            return Err(ClientError::Tls(
                "certificate authority contained no certificates".into(),
            ));
        }
        Ok(certs)
    }
}

impl UserConfig {
    fn load_identity(&self) -> Result<Option<Identity>, ClientError> {
        let cert_pem = match (&self.client_certificate_data, &self.client_certificate) {
            (Some(data), _) => Some(
                BASE64
                    .decode(data.trim())
                    .map_err(|e| ClientError::Tls(format!("client-certificate-data: {}", e)))?,
            ),
            (None, Some(path)) => Some(fs::read(path)?),
            (None, None) => None,
        };
        let key_pem = match (&self.client_key_data, &self.client_key) {
            (Some(data), _) => Some(
                BASE64
                    .decode(data.trim())
                    .map_err(|e| ClientError::Tls(format!("client-key-data: {}", e)))?,
            ),
            (None, Some(path)) => Some(fs::read(path)?),
            (None, None) => None,
        };

        let (cert_pem, key_pem) = match (cert_pem, key_pem) {
            (Some(c), Some(k)) => (c, k),
            (None, None) => return Ok(None),
            _ => {
                return Err(ClientError::Kubeconfig(
                    "client certificate and key must both be set for mTLS".into(),
                ))
            }
        };

        // Validate both halves before handing them to reqwest; its own
        // errors do not say which input was bad.
        let mut cursor = std::io::Cursor::new(cert_pem.as_slice());
        if rustls_pemfile::certs(&mut cursor).count() == 0 {
            return Err(ClientError::Tls(
                "client certificate contained no PEM certificates".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(key_pem.as_slice());
        if rustls_pemfile::pkcs8_private_keys(&mut cursor).count() == 0 {
            return Err(ClientError::Tls(
                "client key contained no PKCS#8 private keys".into(),
            ));
        }

        let mut combined = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        combined.extend_from_slice(&cert_pem);
        if !cert_pem.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend_from_slice(&key_pem);

        let identity = Identity::from_pem(&combined)
            .map_err(|e| ClientError::Tls(format!("client certificate/key pair: {}", e)))?;
        Ok(Some(identity))
    }
}
