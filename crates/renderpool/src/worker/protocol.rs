//! Wire format between the pool and a worker process
//!
//! One JSON document per line. The worker announces itself once with
//! `{"type":"ready"}`, then answers every [`TaskRequest`] with a `result` or
//! `error` message carrying the same id.

use serde::{Deserialize, Serialize};

/// Task sent to a worker process
#[derive(Debug, Serialize)]
pub struct TaskRequest<'a> {
    /// Per-worker request id, echoed back in the reply
    pub id: u64,

    /// Opaque task payload
    pub task: &'a serde_json::Value,
}

/// Message read from a worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Startup handshake
    Ready,

    /// Task completed
    Result {
        id: u64,
        #[serde(default)]
        output: serde_json::Value,
    },

    /// Task rejected by the worker
    Error { id: u64, message: String },
}

impl WorkerMessage {
    /// Id of the request this message answers, if any
    pub fn request_id(&self) -> Option<u64> {
        match self {
            WorkerMessage::Ready => None,
            WorkerMessage::Result { id, .. } | WorkerMessage::Error { id, .. } => Some(*id),
        }
    }
}
