//! Fleet data model shared by the kernel and the agents
//!
//! - Update requests and their validation
//! - Jobs and their status state machine
//! - Per-node update status records
//! - Node records as kept by the registry

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::error::ModelError;

/// Closed set of update kinds a node knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Service,
    Driver,
    Package,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Service => "service",
            UpdateType::Driver => "driver",
            UpdateType::Package => "package",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = ModelError;

    /// Accepts the canonical names plus the aliases operators tend to type
    /// (`systemd`, `kernel`, `apt`, `deb`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" | "systemd" => Ok(UpdateType::Service),
            "driver" | "kernel" | "module" => Ok(UpdateType::Driver),
            "package" | "apt" | "deb" => Ok(UpdateType::Package),
            other => Err(ModelError::Validation(format!("unknown update type: {other}"))),
        }
    }
}

/// Job lifecycle: PENDING → IN_PROGRESS → {SUCCESS | FAILED} (→ ROLLED_BACK)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::RolledBack)
    }
}

/// Status of one node inside one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeUpdateState {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl NodeUpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeUpdateState::Success | NodeUpdateState::Failed)
    }
}

/// Liveness of a node as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Updating,
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Updating => "updating",
            NodeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Update submitted by a client. Immutable once attached to a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub update_type: UpdateType,
    pub package_name: String,
    pub package_version: String,
    /// `http(s)://`, `block+http(s)://` or `file://` locator of the payload
    pub source_locator: String,
    /// Algorithm-prefixed digest, e.g. `sha256:<hex>`
    pub checksum: String,
    pub target_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl UpdateRequest {
    /// Trims fields, drops duplicate targets (keeping first occurrence) and
    /// checks every required field. Returns the normalized request.
    pub fn validated(mut self) -> Result<Self, ModelError> {
        self.package_name = self.package_name.trim().to_string();
        self.package_version = self.package_version.trim().to_string();
        self.source_locator = self.source_locator.trim().to_string();
        self.checksum = self.checksum.trim().to_string();

        let mut seen = HashSet::new();
        self.target_nodes = self
            .target_nodes
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        if self.target_nodes.is_empty() {
            return Err(ModelError::Validation("target_nodes must not be empty".into()));
        }
        if self.package_name.is_empty() {
            return Err(ModelError::Validation("package_name is required".into()));
        }
        if self.package_name.contains(['/', ' ']) || self.package_name.starts_with('.') {
            return Err(ModelError::Validation(format!(
                "package_name '{}' is not a valid package identifier",
                self.package_name
            )));
        }
        if self.package_version.is_empty() {
            return Err(ModelError::Validation("package_version is required".into()));
        }
        if self.source_locator.is_empty() {
            return Err(ModelError::Validation("source_locator is required".into()));
        }
        self.checksum
            .parse::<Checksum>()
            .map_err(|e| ModelError::Validation(e.to_string()))?;

        Ok(self)
    }
}

/// One update request's execution record spanning all its target nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub request: UpdateRequest,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub node_statuses: BTreeMap<String, NodeUpdateState>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Job {
    /// Fresh PENDING job with a generated id
    pub fn new(request: UpdateRequest) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            request,
            status: JobStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            node_statuses: BTreeMap::new(),
            error_message: None,
        }
    }

    /// A job is terminal once `completed_at` is stamped
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            status: self.status,
            update_type: self.request.update_type,
            package_name: self.request.package_name.clone(),
            package_version: self.request.package_version.clone(),
            target_nodes: self.request.target_nodes.clone(),
            description: self.request.description.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            node_statuses: self.node_statuses.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Read-only projection of a persisted [`Job`] returned by the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub update_type: UpdateType,
    pub package_name: String,
    pub package_version: String,
    pub target_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub node_statuses: BTreeMap<String, NodeUpdateState>,
    pub error_message: Option<String>,
}

/// Status of one (node, job) pair. Written once at creation and once at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUpdateStatus {
    pub node_id: String,
    pub job_id: String,
    pub status: NodeUpdateState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub health_check_passed: bool,
}

impl NodeUpdateStatus {
    pub fn begin(node_id: &str, job_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
            status: NodeUpdateState::Pending,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            error_message: None,
            health_check_passed: false,
        }
    }
}

/// Managed node as kept by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub hostname: String,
    /// `host:port` of the agent HTTP surface
    pub address: String,
    pub status: NodeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub drivers: Vec<String>,
    #[serde(default)]
    pub system_info: HashMap<String, serde_json::Value>,
}

impl NodeRecord {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(targets: &[&str]) -> UpdateRequest {
        UpdateRequest {
            update_type: UpdateType::Service,
            package_name: "sensor-daemon".into(),
            package_version: "2.1.0".into(),
            source_locator: "http://kernel:8080/firmware/sensor-daemon.tar.gz".into(),
            checksum: format!("sha256:{}", "ab".repeat(32)),
            target_nodes: targets.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    #[test]
    fn test_validated_dedupes_targets() {
        let req = request(&["a", " b", "a", "", "b"]).validated().unwrap();
        assert_eq!(req.target_nodes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_validated_rejects_empty_targets() {
        let err = request(&[]).validated().unwrap_err();
        assert!(err.to_string().contains("target_nodes"));
    }

    #[test]
    fn test_validated_rejects_bad_checksum() {
        let mut req = request(&["a"]);
        req.checksum = "md5:abcd".into();
        assert!(req.validated().is_err());
    }

    #[test]
    fn test_validated_rejects_path_in_package_name() {
        let mut req = request(&["a"]);
        req.package_name = "../etc".into();
        assert!(req.validated().is_err());
    }

    #[test]
    fn test_update_type_aliases() {
        assert_eq!("systemd".parse::<UpdateType>().unwrap(), UpdateType::Service);
        assert_eq!("kernel".parse::<UpdateType>().unwrap(), UpdateType::Driver);
        assert_eq!("APT".parse::<UpdateType>().unwrap(), UpdateType::Package);
        assert!("firmware".parse::<UpdateType>().is_err());
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_job_json_uses_snake_case_status() {
        let job = Job::new(request(&["a"]));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json["started_at"].is_null());
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.status, JobStatus::Pending);
    }
}
