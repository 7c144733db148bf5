/**
 * Connection settings for the API server
 *
 * Resolves cluster url, namespace and credentials once, before any stream is
 * built. Parsing of kubeconfig files and in-cluster service account files is
 * delegated to `kube::config`; this module decides where to look and applies
 * explicit overrides on top.
 */
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::http::Uri;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::Config;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use std::path::PathBuf;
use tokio::sync::OnceCell;
use tracing::debug;

/// Environment variable naming one or more kubeconfig files
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Environment variable set inside a pod by the kubelet
pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to load in-cluster config: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("invalid cluster url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },

    #[error("invalid certificate authority bundle: {0}")]
    InvalidCa(String),

    #[error("failed to build client: {0}")]
    Client(#[source] kube::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Where to look for connection settings, plus explicit overrides
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// Kubeconfig file to read instead of the default lookup
    pub kubeconfig: Option<PathBuf>,
    /// Context to use from the kubeconfig (defaults to `current-context`)
    pub context: Option<String>,
    /// Use the pod's service account instead of a kubeconfig
    pub in_cluster: bool,
    /// API server url
    pub url: Option<String>,
    pub namespace: Option<String>,
    /// Bearer token; replaces any credentials from the kubeconfig
    pub token: Option<String>,
    /// Basic auth; ignored when a token is given
    pub basic: Option<BasicAuth>,
    pub insecure_skip_tls_verify: bool,
    /// PEM bundle of certificate authorities; replaces the kubeconfig CA
    pub ca: Option<Vec<u8>>,
    /// PEM client certificate
    pub cert: Option<Vec<u8>>,
    /// PEM client private key
    pub key: Option<Vec<u8>>,
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("kubeconfig", &self.kubeconfig)
            .field("context", &self.context)
            .field("in_cluster", &self.in_cluster)
            .field("url", &self.url)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("basic", &self.basic)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("ca", &self.ca.as_ref().map(Vec::len))
            .field("cert", &self.cert.as_ref().map(Vec::len))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolved, immutable connection settings
#[derive(Clone)]
pub struct ConnectionConfig {
    config: Config,
}

static DEFAULT_CONFIG: OnceCell<ConnectionConfig> = OnceCell::const_new();

impl ConnectionConfig {
    /// Resolve connection settings from `options`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no usable configuration can be found or an
    /// override is malformed
    pub async fn resolve(options: &ConnectionOptions) -> Result<Self, ConfigError> {
        let mut config = Self::load(options).await?;
        apply_overrides(&mut config, options)?;
        debug!(
            "using api server {} in namespace {}",
            config.cluster_url, config.default_namespace
        );
        Ok(Self { config })
    }

    /// Default configuration from the environment, resolved once per process
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no usable configuration can be found
    pub async fn find() -> Result<&'static Self, ConfigError> {
        DEFAULT_CONFIG
            .get_or_try_init(|| async {
                let options = ConnectionOptions::default();
                Self::resolve(&options).await
            })
            .await
    }

    async fn load(options: &ConnectionOptions) -> Result<Config, ConfigError> {
        if options.in_cluster {
            debug!("using in-cluster config");
            return Ok(Config::incluster()?);
        }

        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            ..KubeConfigOptions::default()
        };

        if let Some(path) = &options.kubeconfig {
            debug!("reading kubeconfig {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            return Ok(Config::from_custom_kubeconfig(kubeconfig, &kube_options).await?);
        }

        if let Some(url) = &options.url {
            debug!("using explicit api server {url}");
            return Ok(Config::new(parse_url(url)?));
        }

        if std::env::var_os(KUBECONFIG_ENV).is_none() && std::env::var_os(SERVICE_HOST_ENV).is_some() {
            debug!("using in-cluster config from {SERVICE_HOST_ENV}");
            return Ok(Config::incluster()?);
        }

        debug!("reading default kubeconfig");
        Ok(Config::from_kubeconfig(&kube_options).await?)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.default_namespace
    }

    #[must_use]
    pub const fn cluster_url(&self) -> &Uri {
        &self.config.cluster_url
    }

    #[must_use]
    pub const fn kube_config(&self) -> &Config {
        &self.config
    }
}

impl From<Config> for ConnectionConfig {
    fn from(config: Config) -> Self {
        Self { config }
    }
}

fn parse_url(url: &str) -> Result<Uri, ConfigError> {
    url.parse::<Uri>().map_err(|source| ConfigError::InvalidUrl {
        url: url.to_string(),
        source,
    })
}

fn apply_overrides(config: &mut Config, options: &ConnectionOptions) -> Result<(), ConfigError> {
    if let Some(url) = &options.url {
        config.cluster_url = parse_url(url)?;
    }

    if let Some(namespace) = &options.namespace {
        config.default_namespace.clone_from(namespace);
    }

    if options.insecure_skip_tls_verify {
        config.accept_invalid_certs = true;
    }

    if let Some(ca) = &options.ca {
        config.root_cert = Some(parse_ca_bundle(ca)?);
    }

    if let Some(token) = &options.token {
        debug!("using bearer token");
        config.auth_info = AuthInfo {
            token: Some(token.clone().into()),
            ..AuthInfo::default()
        };
    } else if let Some(basic) = &options.basic {
        debug!("using basic auth for {}", basic.username);
        config.auth_info = AuthInfo {
            username: Some(basic.username.clone()),
            password: Some(basic.password.clone().into()),
            ..AuthInfo::default()
        };
    }

    // after the auth replacement above, so a token and a client certificate can be combined
    if let Some(cert) = &options.cert {
        config.auth_info.client_certificate = None;
        config.auth_info.client_certificate_data = Some(STANDARD.encode(cert));
    }
    if let Some(key) = &options.key {
        config.auth_info.client_key = None;
        config.auth_info.client_key_data = Some(STANDARD.encode(key).into());
    }

    Ok(())
}

/// DER certificates from a PEM bundle
fn parse_ca_bundle(pem: &[u8]) -> Result<Vec<Vec<u8>>, ConfigError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ConfigError::InvalidCa(err.to_string()))?;

    if certs.is_empty() {
        return Err(ConfigError::InvalidCa("no certificates found".to_string()));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_url_with_overrides() {
        let options = ConnectionOptions {
            url: Some("https://10.0.0.1:6443".to_string()),
            namespace: Some("payments".to_string()),
            token: Some("abc".to_string()),
            insecure_skip_tls_verify: true,
            ..ConnectionOptions::default()
        };

        let config = ConnectionConfig::resolve(&options).await.unwrap();
        assert_eq!(config.namespace(), "payments");
        assert_eq!(config.cluster_url().host(), Some("10.0.0.1"));
        assert!(config.kube_config().accept_invalid_certs);
        assert!(config.kube_config().auth_info.token.is_some());
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let options = ConnectionOptions {
            url: Some("not a url".to_string()),
            ..ConnectionOptions::default()
        };

        let result = ConnectionConfig::resolve(&options).await;
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_file_fails() {
        let options = ConnectionOptions {
            kubeconfig: Some(PathBuf::from("/nonexistent/kubestream/config")),
            ..ConnectionOptions::default()
        };

        let result = ConnectionConfig::resolve(&options).await;
        assert!(matches!(result, Err(ConfigError::Kubeconfig(_))));
    }

    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nAAECAw==\n-----END CERTIFICATE-----\n";

    #[tokio::test]
    async fn test_tls_material_overrides() {
        let options = ConnectionOptions {
            url: Some("https://10.0.0.1:6443".to_string()),
            token: Some("abc".to_string()),
            ca: Some(CA_PEM.as_bytes().to_vec()),
            cert: Some(b"client-cert-pem".to_vec()),
            key: Some(b"client-key-pem".to_vec()),
            ..ConnectionOptions::default()
        };

        let config = ConnectionConfig::resolve(&options).await.unwrap();
        let kube_config = config.kube_config();
        assert_eq!(kube_config.root_cert, Some(vec![vec![0_u8, 1, 2, 3]]));

        let auth = &kube_config.auth_info;
        assert!(auth.token.is_some(), "token survives the client certificate");
        assert_eq!(
            auth.client_certificate_data.as_deref(),
            Some(STANDARD.encode(b"client-cert-pem").as_str())
        );
        assert!(auth.client_key_data.is_some());
    }

    #[tokio::test]
    async fn test_ca_without_certificates_is_rejected() {
        let options = ConnectionOptions {
            url: Some("https://10.0.0.1:6443".to_string()),
            ca: Some(b"not a pem bundle".to_vec()),
            ..ConnectionOptions::default()
        };

        let result = ConnectionConfig::resolve(&options).await;
        assert!(matches!(result, Err(ConfigError::InvalidCa(_))));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let options = ConnectionOptions {
            token: Some("secret-token".to_string()),
            basic: Some(BasicAuth {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }),
            key: Some(b"private-key-bytes".to_vec()),
            ..ConnectionOptions::default()
        };

        let printed = format!("{options:?}");
        assert!(!printed.contains("secret-token"));
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
        assert!(printed.contains("admin"));
    }
}
