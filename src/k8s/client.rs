// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use crate::k8s::USER_AGENT;
use crate::k8s::config::{ConfigError, ConnectionConfig};
use crate::k8s::resource::{ResourceClient, ResourcePath};
use crate::k8s::transport::{HttpTransport, KubeTransport};
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use std::sync::Arc;
use tracing::{debug, warn};

/// Create a k8s client for the resolved connection settings
///
/// # Errors
///
/// Will return `Err` if the TLS or auth settings in `config` are unusable
pub fn new(
    config: &ConnectionConfig,
    custom_user_agent: Option<&str>,
) -> std::result::Result<Client, ConfigError> {
    let mut config = config.kube_config().clone();

    // In kube 2.x custom headers ride on the Config
    if let Some(user_agent) = custom_user_agent {
        add_user_agent_header(&mut config, user_agent);
    }

    Client::try_from(config).map_err(ConfigError::Client)
}

fn add_user_agent_header(config: &mut Config, user_agent: &str) {
    match HeaderValue::from_str(user_agent) {
        Ok(value) => config.headers.push((HeaderName::from_static("user-agent"), value)),
        Err(err) => warn!("ignoring invalid user agent {user_agent:?}: {err}"),
    }
}

/// Entry point for building list and watch functions
///
/// Holds the transport shared by every resource client it creates and the
/// namespace they are scoped to.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    namespace: Option<String>,
}

impl ApiClient {
    /// Clients scoped to `namespace`
    pub fn new(transport: Arc<dyn HttpTransport>, namespace: impl Into<String>) -> Self {
        Self {
            transport,
            namespace: Some(namespace.into()),
        }
    }

    /// Build a client from the process wide default configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no configuration can be resolved
    pub async fn try_default() -> Result<Self> {
        let config = ConnectionConfig::find().await?;
        Self::try_from_config(config)
    }

    /// Build a client for `config`, scoped to its default namespace
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the client cannot be constructed
    pub fn try_from_config(config: &ConnectionConfig) -> Result<Self> {
        let client = new(config, Some(USER_AGENT))?;
        debug!("client for {} ready", config.cluster_url());
        Ok(Self::new(
            Arc::new(KubeTransport::new(client)),
            config.namespace(),
        ))
    }

    #[must_use]
    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Watch across every namespace; also used for cluster scoped resources
    #[must_use]
    pub fn all_namespaces(mut self) -> Self {
        self.namespace = None;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// List and watch functions for `plural` in `api_version` (`v1`, `apps/v1`, ...)
    pub fn list_watcher<K>(&self, api_version: &str, plural: &str) -> ResourceClient<K> {
        let mut path = ResourcePath::new(api_version, plural);
        path.namespace.clone_from(&self.namespace);
        ResourceClient::new(Arc::clone(&self.transport), path)
    }
}
