use std::fmt;

use serde::Serialize;

use crate::{Env, Pid};

/// Immutable text payload relayed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Message(String);

impl Message {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self(text.to_owned())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent from the pool to a single worker.
#[derive(Debug, Clone)]
pub enum SupervisorMessage {
    Task(Message),
    Shutdown,
}

/// Messages a worker emits back towards the collector.
#[derive(Debug)]
pub enum WorkerMessage {
    Complete(ResponseRecord),
    /// The worker task died. Carries the panic text when one was available.
    Fault(WorkerFault),
    /// Acknowledge shutdown
    ShutdownAck,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker {pid} faulted: {reason}")]
pub struct WorkerFault {
    pub pid: Pid,
    pub reason: String,
}

/// Outcome of one task, produced exactly once per dispatched message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub pid: Pid,
    pub message: Message,
    pub env: Env,
    /// Memory the worker held while building this record, in MiB.
    pub memory_mib: f64,
}

impl fmt::Display for ResponseRecord {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serializing a string map cannot fail.
        let env = serde_json::to_string(&self.env).unwrap_or_default();

        write!(
            fmt,
            "Response from {pid}: message was {message}, env: {env}, memory: {memory}",
            pid = self.pid,
            message = self.message,
            memory = self.memory_mib,
        )
    }
}
