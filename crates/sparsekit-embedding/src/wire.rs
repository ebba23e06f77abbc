//! Messages exchanged between workers during a step.

use serde::{Deserialize, Serialize};
use sparsekit_shard::Key;

/// One key requested by an output row of the requesting worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Key to look up.
    pub key: Key,
    /// `sample * slot_num + slot` on the requesting worker.
    pub row_index: usize,
}

impl KeyRequest {
    /// Creates a request.
    pub fn new(key: Key, row_index: usize) -> Self {
        Self { key, row_index }
    }
}

/// A vector addressed to one output row of the receiving (or sending) worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowVector {
    /// Output row on the requesting worker.
    pub row_index: usize,
    /// `embedding_vec_size` values.
    pub values: Vec<f32>,
}

/// Payload of every collective issued by the embedding pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// All keys a worker requests this step, in input order.
    Requests(Vec<KeyRequest>),
    /// Partial sums a worker computed for the receiver's rows.
    Partials(Vec<RowVector>),
    /// Upstream gradients of the receiver's contributions, in the order the
    /// receiver sent the matching partials.
    Gradients(Vec<RowVector>),
    /// The sender failed locally and abandons the step.
    Abort(String),
}

impl WireMessage {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Requests(_) => "requests",
            WireMessage::Partials(_) => "partials",
            WireMessage::Gradients(_) => "gradients",
            WireMessage::Abort(_) => "abort",
        }
    }
}
