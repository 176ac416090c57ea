//! FleetOTA core - types shared by the kernel and the node agents
//!
//! This crate holds everything both sides of the wire must agree on:
//! - Fleet data model (update requests, jobs, per-node status, node records)
//! - Pipeline outcome reported by a node after an install attempt
//! - Wire messages for the HTTP push and MQTT notify transports
//! - Checksum parsing and file digests
//! - Block-wise transfer protocol used to move firmware images

pub mod checksum;
pub mod error;
pub mod health;
pub mod model;
pub mod outcome;
pub mod topics;
pub mod transfer;
pub mod wire;

pub use checksum::{Checksum, DigestAlgorithm};
pub use error::{ChecksumError, ModelError, TransferError};
pub use health::{HealthReport, NetworkHealth};
pub use model::{
    Job, JobStatus, JobView, NodeRecord, NodeStatus, NodeUpdateState, NodeUpdateStatus,
    UpdateRequest, UpdateType,
};
pub use outcome::Outcome;
pub use wire::{DispatchRequest, DispatchResponse, RollbackRequest, RollbackResponse};
