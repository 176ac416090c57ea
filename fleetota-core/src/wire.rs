//! Messages exchanged between the kernel and the node agents
//!
//! Same payloads for both transports:
//! - HTTP push: `DispatchRequest` / `RollbackRequest` as JSON bodies
//! - MQTT notify: wrapped in an [`AgentCommand`], answered by an [`AgentReply`]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::health::HealthReport;
use crate::model::{Job, UpdateType};
use crate::outcome::Outcome;

/// Package descriptor sent to one node for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: String,
    pub update_type: UpdateType,
    pub package_name: String,
    pub package_version: String,
    pub source_locator: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DispatchRequest {
    pub fn for_job(job: &Job) -> Self {
        let req = &job.request;
        Self {
            job_id: job.job_id.clone(),
            update_type: req.update_type,
            package_name: req.package_name.clone(),
            package_version: req.package_version.clone(),
            source_locator: req.source_locator.clone(),
            checksum: req.checksum.clone(),
            description: req.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,
    #[serde(default)]
    pub health_check_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
}

impl From<Outcome> for DispatchResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            success: outcome.success,
            health_check_passed: Some(outcome.health_check_passed),
            error_message: outcome.error_message,
            rolled_back: outcome.rolled_back,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RollbackResponse {
    pub fn ok() -> Self {
        Self { success: true, error_message: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error_message: Some(error.into()) }
    }
}

/// Command published on a node's command topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    Update {
        request_id: String,
        #[serde(flatten)]
        request: DispatchRequest,
    },
    Rollback {
        request_id: String,
        job_id: String,
    },
}

impl AgentCommand {
    pub fn request_id(&self) -> &str {
        match self {
            AgentCommand::Update { request_id, .. } | AgentCommand::Rollback { request_id, .. } => {
                request_id
            }
        }
    }
}

/// Reply published on the shared reply topic, correlated by `request_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub request_id: String,
    pub node_id: String,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Update(DispatchResponse),
    Rollback(RollbackResponse),
}

/// Announcement sent by an agent on startup (MQTT or `POST /nodes/register`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub drivers: Vec<String>,
    #[serde(default)]
    pub system_info: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    #[serde(default)]
    pub health: Option<HealthReport>,
}
