//! Load profile configuration: YAML schema, tagged-union request entries,
//! and validation.
//!
//! A profile describes a weighted mixture of request kinds together with
//! concurrency, a rate ceiling, and a total request budget. Parsing and
//! validation are separate steps so that CLI flags can override fields in
//! between.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builders::body_template;

/// Only config version understood by this binary.
pub const SUPPORTED_VERSION: u32 = 1;

/// Errors that can occur when loading or validating a load profile.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid load profile: {0}")]
    Validation(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProfile {
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub spec: LoadProfileSpec,
}

impl LoadProfile {
    /// Reads a profile from a YAML file without validating it; callers
    /// apply flag overrides first and then call [`LoadProfile::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parses a profile from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::Validation(format!(
                "unsupported config version {} (expected {})",
                self.version, SUPPORTED_VERSION
            )));
        }
        self.spec.validate()
    }
}

/// Wire format for the response payloads requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Json,
    Protobuf,
}

impl ContentType {
    /// Value sent in the Accept header.
    pub fn accept_header(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Protobuf => "application/vnd.kubernetes.protobuf",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ContentType::Json),
            "protobuf" => Ok(ContentType::Protobuf),
            other => Err(format!(
                "invalid content type '{}': expected json or protobuf",
                other
            )),
        }
    }
}

/// The immutable description of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProfileSpec {
    /// Requests per second across the whole worker pool; 0 means unlimited.
    #[serde(default)]
    pub rate: f64,

    /// Total requests to issue; 0 means run until cancelled.
    #[serde(default)]
    pub total: usize,

    /// Number of distinct transport connections.
    #[serde(default)]
    pub conns: usize,

    /// Number of concurrent workers; 0 defaults to `conns`.
    #[serde(default)]
    pub client: usize,

    #[serde(default)]
    pub content_type: ContentType,

    #[serde(default, rename = "disableHTTP2")]
    pub disable_http2: bool,

    /// Maximum retries passed to each request.
    #[serde(default)]
    pub max_retries: u32,

    pub requests: Vec<RequestEntry>,
}

impl LoadProfileSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conns == 0 {
            return Err(ConfigError::Validation("conns must be at least 1".into()));
        }
        if self.rate < 0.0 {
            return Err(ConfigError::Validation("rate must not be negative".into()));
        }
        if self.requests.is_empty() {
            return Err(ConfigError::Validation(
                "at least one request entry is required".into(),
            ));
        }
        for (idx, entry) in self.requests.iter().enumerate() {
            entry
                .validate()
                .map_err(|e| ConfigError::Validation(format!("requests[{}]: {}", idx, e)))?;
        }
        Ok(())
    }
}

/// One weighted slot in the request mixture. Exactly one request variant
/// must be set; the YAML surface keeps one optional key per variant and
/// [`RequestEntry::kind`] enforces the exactly-one rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    pub shares: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_list: Option<ListSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_list: Option<ListSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_list: Option<WatchListSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_get: Option<GetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_get: Option<GetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_pod_log: Option<PodLogSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_del: Option<PostDelSpec>,
}

/// Sealed view of a validated [`RequestEntry`].
#[derive(Debug, Clone)]
pub enum RequestKind {
    StaleList(ListSpec),
    QuorumList(ListSpec),
    WatchList(WatchListSpec),
    StaleGet(GetSpec),
    QuorumGet(GetSpec),
    GetPodLog(PodLogSpec),
    Patch(PatchSpec),
    PostDel(PostDelSpec),
}

impl RequestEntry {
    /// Resolves the tagged union, failing unless exactly one variant is set.
    pub fn kind(&self) -> Result<RequestKind, String> {
        let mut kinds = Vec::new();
        if let Some(s) = &self.stale_list {
            kinds.push(RequestKind::StaleList(s.clone()));
        }
        if let Some(s) = &self.quorum_list {
            kinds.push(RequestKind::QuorumList(s.clone()));
        }
        if let Some(s) = &self.watch_list {
            kinds.push(RequestKind::WatchList(s.clone()));
        }
        if let Some(s) = &self.stale_get {
            kinds.push(RequestKind::StaleGet(s.clone()));
        }
        if let Some(s) = &self.quorum_get {
            kinds.push(RequestKind::QuorumGet(s.clone()));
        }
        if let Some(s) = &self.get_pod_log {
            kinds.push(RequestKind::GetPodLog(s.clone()));
        }
        if let Some(s) = &self.patch {
            kinds.push(RequestKind::Patch(s.clone()));
        }
        if let Some(s) = &self.post_del {
            kinds.push(RequestKind::PostDel(s.clone()));
        }

        match kinds.len() {
            0 => Err("no request variant set".to_string()),
            1 => Ok(kinds.pop().expect("length checked")),
            n => Err(format!("{} request variants set, expected exactly one", n)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shares < 1 {
            return Err("shares must be at least 1".to_string());
        }
        match self.kind()? {
            RequestKind::StaleList(s) | RequestKind::QuorumList(s) => s.validate(),
            RequestKind::WatchList(s) => s.validate(),
            RequestKind::StaleGet(s) | RequestKind::QuorumGet(s) => s.validate(),
            RequestKind::GetPodLog(s) => s.validate(),
            RequestKind::Patch(s) => s.validate(),
            RequestKind::PostDel(s) => s.validate(),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}

/// Target of a LIST request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub field_selector: String,
    #[serde(default)]
    pub limit: i64,
}

impl ListSpec {
    fn validate(&self) -> Result<(), String> {
        require("version", &self.version)?;
        require("resource", &self.resource)
    }
}

/// Target of a streaming WATCH-LIST request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchListSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub field_selector: String,
}

impl WatchListSpec {
    fn validate(&self) -> Result<(), String> {
        require("version", &self.version)?;
        require("resource", &self.resource)
    }
}

/// Target of a single-object GET.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl GetSpec {
    fn validate(&self) -> Result<(), String> {
        require("version", &self.version)?;
        require("resource", &self.resource)?;
        require("name", &self.name)
    }
}

/// Target of a pod log read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLogSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<i64>,
}

impl PodLogSpec {
    fn validate(&self) -> Result<(), String> {
        require("namespace", &self.namespace)?;
        require("name", &self.name)
    }
}

/// Kubernetes patch flavour, mapped to the corresponding content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Json,
    Merge,
    Strategic,
    Apply,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::Json => "application/json-patch+json",
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Strategic => "application/strategic-merge-patch+json",
            PatchKind::Apply => "application/apply-patch+yaml",
        }
    }
}

/// Target and body of a PATCH request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub patch_type: PatchKind,
    pub body: String,
}

impl PatchSpec {
    fn validate(&self) -> Result<(), String> {
        require("version", &self.version)?;
        require("resource", &self.resource)?;
        require("name", &self.name)?;
        require("body", &self.body)
    }
}

/// POST/DELETE churn over a resource kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDelSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub delete_ratio: f64,
}

impl PostDelSpec {
    fn validate(&self) -> Result<(), String> {
        require("version", &self.version)?;
        require("resource", &self.resource)?;
        require("namespace", &self.namespace)?;
        if !(0.0..=1.0).contains(&self.delete_ratio) {
            return Err(format!(
                "deleteRatio {} is outside [0, 1]",
                self.delete_ratio
            ));
        }
        if body_template(&self.resource).is_none() {
            return Err(format!(
                "no body template for resource '{}' (supported: pods, configmaps)",
                self.resource
            ));
        }
        Ok(())
    }
}
