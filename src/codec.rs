// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Message Codec
//!
//! Task invocations travel as JSON envelopes (Celery message protocol v1 body):
//!
//! ```json
//! {"id": "abc", "task": "add", "args": [1, 2], "kwargs": {}, "retries": 0}
//! ```
//!
//! Decoding is strict about shapes: `id` and `task` must be strings, `args` an array,
//! `kwargs` an object. Missing or `null` `args`/`kwargs` decode as empty, and unknown
//! fields are ignored.

use crate::errors::BrokerError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

/// Content type of encoded task messages
pub const CONTENT_TYPE: &str = "application/json";
/// Content encoding of encoded task messages
pub const CONTENT_ENCODING: &str = "utf-8";

/// A task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

impl TaskMessage {
    /// New invocation of `task` with a random id and no arguments.
    pub fn new(task: &str) -> Self {
        TaskMessage {
            id: Uuid::new_v4().to_string(),
            task: task.to_owned(),
            args: vec![],
            kwargs: Map::new(),
            retries: 0,
            eta: None,
            expires: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_owned(), value);
        self
    }

    pub fn with_eta(mut self, eta: &str) -> Self {
        self.eta = Some(eta.to_owned());
        self
    }

    pub fn with_expires(mut self, expires: &str) -> Self {
        self.expires = Some(expires.to_owned());
        self
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Parses a delivery body into a task message.
pub fn decode(body: &[u8]) -> Result<TaskMessage, BrokerError> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = err.to_string(), size = body.len(), "malformed task message");
        BrokerError::Decode(err.to_string())
    })
}

/// Serializes a task message into a delivery body.
pub fn encode(message: &TaskMessage) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(message).map_err(|err| BrokerError::Encode(err.to_string()))
}
