//! strata-core — wire format, task payloads, and configuration.
//! All other Strata crates depend on this one.

pub mod config;
pub mod task;
pub mod wire;

pub use task::{JobId, Matrix, PayloadError, ResultUnit, Row, RowUnit, TaskUnit};
pub use wire::{decode, encode, FrameError, Message, MessageKind, MAGIC, PROTOCOL_VERSION};
