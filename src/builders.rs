//! Request builders: immutable factories that bind a request kind to a
//! connection and produce an executable [`Requester`].
//!
//! Path construction follows the Kubernetes API conventions: core-group
//! resources live under `/api/<version>`, named groups under
//! `/apis/<group>/<version>`, with an optional namespace segment in
//! between.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::time::sleep;
use tracing::debug;

use crate::client::ApiClient;
use crate::config::{GetSpec, ListSpec, PatchSpec, PodLogSpec, PostDelSpec, WatchListSpec};
use crate::request::{RequestMode, Requester};

/// A factory producing one executable request per call.
///
/// Builders are constructed once from the load profile and shared across
/// workers; `build` binds the request to the worker's connection.
#[async_trait]
pub trait RequestBuilder: Send + Sync {
    async fn build(&self, conn: &ApiClient) -> Requester;
}

/// Appends `/api/<version>` or `/apis/<group>/<version>`, the namespace
/// segment, and the trailing resource segments to the connection's base URL.
fn resource_url(base: &Url, group: &str, version: &str, namespace: &str, tail: &[&str]) -> Url {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .expect("API server base URL has a path");
        segments.pop_if_empty();
        if group.is_empty() {
            segments.extend(["api", version]);
        } else {
            segments.extend(["apis", group, version]);
        }
        if !namespace.is_empty() {
            segments.extend(["namespaces", namespace]);
        }
        segments.extend(tail);
    }
    url
}

/// Builder for single-object GET requests.
pub struct GetRequestBuilder {
    spec: GetSpec,
    resource_version: String,
    max_retries: u32,
}

impl GetRequestBuilder {
    /// `resource_version` "0" allows a cache read; empty forces a quorum
    /// read.
    pub fn new(spec: GetSpec, resource_version: &str, max_retries: u32) -> Self {
        Self {
            spec,
            resource_version: resource_version.to_string(),
            max_retries,
        }
    }
}

#[async_trait]
impl RequestBuilder for GetRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let mut url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource, &self.spec.name],
        );
        if !self.resource_version.is_empty() {
            url.query_pairs_mut()
                .append_pair("resourceVersion", &self.resource_version);
        }
        let request = conn.http().get(url.clone());
        Requester::new("GET", url, request, self.max_retries, RequestMode::Discard)
    }
}

/// Builder for collection LIST requests.
pub struct ListRequestBuilder {
    spec: ListSpec,
    resource_version: String,
    max_retries: u32,
}

impl ListRequestBuilder {
    pub fn new(spec: ListSpec, resource_version: &str, max_retries: u32) -> Self {
        Self {
            spec,
            resource_version: resource_version.to_string(),
            max_retries,
        }
    }
}

#[async_trait]
impl RequestBuilder for ListRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let mut url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource],
        );
        {
            let mut query = url.query_pairs_mut();
            if !self.spec.selector.is_empty() {
                query.append_pair("labelSelector", &self.spec.selector);
            }
            if !self.spec.field_selector.is_empty() {
                query.append_pair("fieldSelector", &self.spec.field_selector);
            }
            if !self.resource_version.is_empty() {
                query.append_pair("resourceVersion", &self.resource_version);
            }
            if self.spec.limit > 0 {
                query.append_pair("limit", &self.spec.limit.to_string());
            }
        }
        let request = conn.http().get(url.clone());
        Requester::new("LIST", url, request, self.max_retries, RequestMode::Discard)
    }
}

/// Builder for streaming watch-list requests seeded with the initial
/// snapshot.
pub struct WatchListRequestBuilder {
    spec: WatchListSpec,
    max_retries: u32,
}

impl WatchListRequestBuilder {
    pub fn new(spec: WatchListSpec, max_retries: u32) -> Self {
        Self { spec, max_retries }
    }
}

#[async_trait]
impl RequestBuilder for WatchListRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let mut url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource],
        );
        {
            let mut query = url.query_pairs_mut();
            if !self.spec.selector.is_empty() {
                query.append_pair("labelSelector", &self.spec.selector);
            }
            if !self.spec.field_selector.is_empty() {
                query.append_pair("fieldSelector", &self.spec.field_selector);
            }
            query.append_pair("watch", "true");
            query.append_pair("sendInitialEvents", "true");
            query.append_pair("allowWatchBookmarks", "true");
            query.append_pair("resourceVersionMatch", "NotOlderThan");
        }
        let request = conn.http().get(url.clone());
        Requester::new(
            "WATCHLIST",
            url,
            request,
            self.max_retries,
            RequestMode::WatchList,
        )
    }
}

/// Builder for pod log reads.
pub struct PodLogRequestBuilder {
    spec: PodLogSpec,
    max_retries: u32,
}

impl PodLogRequestBuilder {
    pub fn new(spec: PodLogSpec, max_retries: u32) -> Self {
        Self { spec, max_retries }
    }
}

#[async_trait]
impl RequestBuilder for PodLogRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let mut url = resource_url(
            conn.base(),
            "",
            "v1",
            &self.spec.namespace,
            &["pods", &self.spec.name, "log"],
        );
        {
            let mut query = url.query_pairs_mut();
            if !self.spec.container.is_empty() {
                query.append_pair("container", &self.spec.container);
            }
            if let Some(tail) = self.spec.tail_lines {
                query.append_pair("tailLines", &tail.to_string());
            }
            if let Some(limit) = self.spec.limit_bytes {
                query.append_pair("limitBytes", &limit.to_string());
            }
        }
        let request = conn.http().get(url.clone());
        Requester::new(
            "POD_LOG",
            url,
            request,
            self.max_retries,
            RequestMode::Discard,
        )
    }
}

/// Builder for PATCH requests.
pub struct PatchRequestBuilder {
    spec: PatchSpec,
    max_retries: u32,
}

impl PatchRequestBuilder {
    pub fn new(spec: PatchSpec, max_retries: u32) -> Self {
        Self { spec, max_retries }
    }
}

#[async_trait]
impl RequestBuilder for PatchRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource, &self.spec.name],
        );
        let request = conn
            .http()
            .patch(url.clone())
            .header(CONTENT_TYPE, self.spec.patch_type.content_type())
            .body(self.spec.body.clone().into_bytes());
        Requester::new("PATCH", url, request, self.max_retries, RequestMode::Discard)
    }
}

/// Ordered collection of names of objects believed to currently exist.
///
/// POST appends on success, DELETE removes on success; concurrent DELETE
/// attempts may observe the same head, which is why removal is by exact
/// name rather than by position.
#[derive(Debug, Default)]
pub struct NameCache {
    items: Mutex<Vec<String>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the oldest entry without removing it.
    pub fn peek_front(&self) -> Option<String> {
        self.items.lock().unwrap().first().cloned()
    }

    pub fn push(&self, name: String) {
        self.items.lock().unwrap().push(name);
    }

    /// Removes the first entry matching `name`; returns whether anything
    /// was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut items = self.items.lock().unwrap();
        match items.iter().position(|n| n == name) {
            Some(idx) => {
                items.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

const CACHE_POLL_ATTEMPTS: usize = 100;
const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder that emulates object churn: POST creates synthetic objects,
/// DELETE consumes them at the configured ratio.
pub struct ChurnRequestBuilder {
    spec: PostDelSpec,
    template: &'static str,
    max_retries: u32,
    cache: Arc<NameCache>,
}

impl ChurnRequestBuilder {
    pub fn new(spec: PostDelSpec, max_retries: u32) -> Result<Self, String> {
        let template = body_template(&spec.resource)
            .ok_or_else(|| format!("no body template for resource '{}'", spec.resource))?;
        Ok(Self {
            spec,
            template,
            max_retries,
            cache: Arc::new(NameCache::new()),
        })
    }

    /// The builder's name cache, exposed for inspection after a run.
    pub fn cache(&self) -> Arc<NameCache> {
        self.cache.clone()
    }

    fn post_requester(&self, conn: &ApiClient) -> Requester {
        let name = format!(
            "{}-{}",
            self.spec.namespace,
            rand::thread_rng().gen_range(0..1_000_000u32)
        );
        let body = render_template(self.template, &name, &self.spec.namespace);
        let url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource],
        );
        let request = conn
            .http()
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        Requester::new(
            "POST",
            url,
            request,
            self.max_retries,
            RequestMode::Post {
                name,
                cache: self.cache.clone(),
            },
        )
    }

    fn delete_requester(&self, conn: &ApiClient, name: String) -> Requester {
        let url = resource_url(
            conn.base(),
            &self.spec.group,
            &self.spec.version,
            &self.spec.namespace,
            &[&self.spec.resource, &name],
        );
        let request = conn.http().delete(url.clone());
        Requester::new(
            "DELETE",
            url,
            request,
            self.max_retries,
            RequestMode::Delete {
                name,
                cache: self.cache.clone(),
            },
        )
    }
}

#[async_trait]
impl RequestBuilder for ChurnRequestBuilder {
    async fn build(&self, conn: &ApiClient) -> Requester {
        let should_delete = rand::thread_rng().gen::<f64>() < self.spec.delete_ratio;
        if should_delete {
            // The head entry is only peeked here; it leaves the cache once
            // the DELETE actually succeeds.
            for _ in 0..CACHE_POLL_ATTEMPTS {
                if let Some(name) = self.cache.peek_front() {
                    return self.delete_requester(conn, name);
                }
                sleep(CACHE_POLL_INTERVAL).await;
            }
            debug!(
                resource = %self.spec.resource,
                "name cache stayed empty, falling back to create"
            );
        }
        self.post_requester(conn)
    }
}

const POD_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "name": "{{name}}",
    "namespace": "{{namespace}}",
    "labels": { "app": "kubeload" }
  },
  "spec": {
    "containers": [
      {
        "name": "pause",
        "image": "registry.k8s.io/pause:3.9",
        "resources": { "requests": { "cpu": "10m", "memory": "16Mi" } }
      }
    ],
    "terminationGracePeriodSeconds": 0
  }
}"#;

const CONFIGMAP_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "ConfigMap",
  "metadata": {
    "name": "{{name}}",
    "namespace": "{{namespace}}",
    "labels": { "app": "kubeload" }
  },
  "data": { "payload": "kubeload-churn" }
}"#;

/// Embedded body template for a churned resource kind, if one exists.
pub fn body_template(resource: &str) -> Option<&'static str> {
    match resource {
        "pods" => Some(POD_TEMPLATE),
        "configmaps" => Some(CONFIGMAP_TEMPLATE),
        _ => None,
    }
}

fn render_template(template: &'static str, name: &str, namespace: &str) -> Vec<u8> {
    template
        .replace("{{name}}", name)
        .replace("{{namespace}}", namespace)
        .into_bytes()
}
