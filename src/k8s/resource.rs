/**
 * List and watch functions bound to one resource
 *
 * `ResourceClient` builds the list and watch requests for a resource path,
 * sends them through an `HttpTransport` and decodes the responses. Its stop
 * handle cancels the watch whether or not the response has arrived yet: a
 * stop issued while the request is still in flight drops the request, and a
 * stop issued later ends the body stream.
 */
use crate::error::{Error, Result};
use crate::k8s::decoder::decode_watch_events;
use crate::k8s::transport::{ByteStream, HttpTransport};
use crate::k8s::utils::format_label_selector;
use crate::k8s::watch::{ListOptions, ListWatch, StopHandle, Watch, WatchOptions, timeout_seconds};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use hyper::http::Request as HttpRequest;
use k8s_openapi::serde_json;
use kube::api::{ListParams, WatchParams};
use kube::core::{DynamicObject, ObjectList, Request};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Location of a resource collection on the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    /// `v1` for the core group, `<group>/<version>` otherwise
    pub api_version: String,
    /// Lowercase plural name, e.g. `pods`
    pub plural: String,
    /// `None` lists across all namespaces, or a cluster scoped resource
    pub namespace: Option<String>,
}

impl ResourcePath {
    pub fn new(api_version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            plural: plural.into(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// `/api/v1/...` for the core group, `/apis/<group>/<version>/...` otherwise
    #[must_use]
    pub fn url_path(&self) -> String {
        let mut path = match self.api_version.split_once('/') {
            Some((group, version)) => format!("/apis/{group}/{version}"),
            None => format!("/api/{}", self.api_version),
        };
        if let Some(namespace) = &self.namespace {
            path.push_str("/namespaces/");
            path.push_str(namespace);
        }
        path.push('/');
        path.push_str(&self.plural);
        path
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url_path())
    }
}

/// List and watch over HTTP for objects of type `K`
pub struct ResourceClient<K = DynamicObject> {
    transport: Arc<dyn HttpTransport>,
    path: ResourcePath,
    label_selector: Option<String>,
    _object: PhantomData<fn() -> K>,
}

impl<K> Clone for ResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            path: self.path.clone(),
            label_selector: self.label_selector.clone(),
            _object: PhantomData,
        }
    }
}

impl<K> ResourceClient<K> {
    pub fn new(transport: Arc<dyn HttpTransport>, path: ResourcePath) -> Self {
        Self {
            transport,
            path,
            label_selector: None,
            _object: PhantomData,
        }
    }

    /// Only list and watch objects carrying all of `labels`
    #[must_use]
    pub fn labels(self, labels: &BTreeMap<String, String>) -> Self {
        if labels.is_empty() {
            return self;
        }
        let selector = format_label_selector(labels);
        self.label_selector(&selector)
    }

    /// Only list and watch objects matching a raw label selector
    #[must_use]
    pub fn label_selector(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    #[must_use]
    pub const fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn request(&self) -> Request {
        Request::new(self.path.url_path())
    }

    fn list_request(&self, options: &ListOptions) -> Result<HttpRequest<Vec<u8>>> {
        let mut params = ListParams::default();
        params.resource_version = Some(options.resource_version.to_string());
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        Ok(self.request().list(&params)?)
    }

    fn watch_request(&self, options: &WatchOptions) -> Result<HttpRequest<Vec<u8>>> {
        let mut params = WatchParams::default().timeout(timeout_seconds(options.timeout));
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        Ok(self
            .request()
            .watch(&params, options.resource_version.as_str())?)
    }
}

impl<K> ListWatch for ResourceClient<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Unpin + 'static,
{
    type Object = K;

    fn list(&self, options: &ListOptions) -> BoxFuture<'static, Result<ObjectList<K>>> {
        let request = self.list_request(options);
        let transport = Arc::clone(&self.transport);

        async move {
            let body = transport.get(request?).await?;
            let list = serde_json::from_slice(&body)?;
            Ok(list)
        }
        .boxed()
    }

    fn watch(&self, options: &WatchOptions) -> Watch<K> {
        let request = self.watch_request(options);
        let transport = Arc::clone(&self.transport);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let body = async move {
            let request = match request {
                Ok(request) => request,
                Err(err) => return failed(err),
            };
            let until_stopped = cancelled.clone().cancelled_owned();

            tokio::select! {
                biased;
                () = cancelled.cancelled() => {
                    debug!("watch stopped before the response arrived");
                    stream::empty().boxed()
                }
                response = transport.stream(request) => match response {
                    Ok(chunks) => chunks.take_until(until_stopped).boxed(),
                    Err(err) => failed(err),
                },
            }
        };

        Watch {
            events: decode_watch_events(stream::once(body).flatten()).boxed(),
            stop: StopHandle::new(move || token.cancel()),
        }
    }
}

fn failed(err: Error) -> ByteStream {
    stream::once(future::ready(Err(err))).boxed()
}
