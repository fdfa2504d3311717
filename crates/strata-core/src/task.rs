//! Task and result payloads carried inside TASK and RESULT frames.
//!
//! Both use the same layout: the row index followed by the row's values,
//! all big-endian i32. The row length is implied by the payload size, so a
//! valid payload is always `4 + 4k` bytes.
//!
//! The job a row belongs to travels in the frame's `sender` field as
//! `job:<id>`. Together with the row index it forms the correlation key the
//! coordinator uses to route a RESULT back to the job that asked for it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::{Message, MessageKind};

/// One matrix row.
pub type Row = Vec<i32>;

/// A row-major matrix. Rows may differ in length; each row is an
/// independent unit of work.
pub type Matrix = Vec<Row>;

const JOB_KEY_PREFIX: &str = "job:";

// ── Job id ────────────────────────────────────────────────────────────────────

/// Identifies one `coordinate` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// The `sender` value stamped on every frame of this job.
    pub fn to_sender(self) -> String {
        format!("{JOB_KEY_PREFIX}{}", self.0)
    }

    /// Parse a `sender` value written by `to_sender`.
    pub fn from_sender(sender: &str) -> Option<Self> {
        sender
            .strip_prefix(JOB_KEY_PREFIX)?
            .parse::<u64>()
            .ok()
            .map(JobId)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Row units ─────────────────────────────────────────────────────────────────

/// A row index plus the row's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUnit {
    pub row_index: i32,
    pub values: Row,
}

/// Payload of a TASK frame.
pub type TaskUnit = RowUnit;

/// Payload of a RESULT frame. Same layout as the task it answers.
pub type ResultUnit = RowUnit;

impl RowUnit {
    pub fn new(row_index: i32, values: Row) -> Self {
        Self { row_index, values }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 4 * self.values.len());
        buf.put_i32(self.row_index);
        for v in &self.values {
            buf.put_i32(*v);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 4 {
            return Err(PayloadError::TooShort(payload.len()));
        }
        if payload.len() % 4 != 0 {
            return Err(PayloadError::Misaligned(payload.len()));
        }

        let mut buf = payload;
        let row_index = buf.get_i32();
        let mut values = Vec::with_capacity(buf.len() / 4);
        while buf.has_remaining() {
            values.push(buf.get_i32());
        }
        Ok(Self { row_index, values })
    }
}

// ── Frame constructors ────────────────────────────────────────────────────────

impl Message {
    /// A TASK frame for `node_id` carrying one row of job `job`.
    pub fn task(job: JobId, node_id: impl Into<String>, unit: &TaskUnit) -> Self {
        Self::new(MessageKind::Task, node_id, job.to_sender(), unit.encode())
    }

    /// The RESULT frame answering `task`. The task's `sender` is copied
    /// verbatim so the correlation key survives the round trip.
    pub fn result(task: &Message, node_id: impl Into<String>, unit: &ResultUnit) -> Self {
        Self::new(
            MessageKind::Result,
            node_id,
            task.sender.clone(),
            unit.encode(),
        )
    }

    /// The job this frame belongs to, if its `sender` carries a job key.
    pub fn job_id(&self) -> Option<JobId> {
        JobId::from_sender(&self.sender)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("row payload is {0} bytes, shorter than the 4-byte row index")]
    TooShort(usize),

    #[error("row payload is {0} bytes, not 4 + 4k")]
    Misaligned(usize),
}
