//! strata-services — the coordinator, the compute node agent, and the
//! connection plumbing they share.

pub mod agent;
pub mod coordinator;
pub mod jobs;
pub mod registry;
pub mod transport;

pub use agent::{AgentError, AgentHandle, Identity, NodeAgent, RowTransform, Scale};
pub use coordinator::{CoordinateError, Coordinator, DispatchError, HandshakeError, Operation};
pub use jobs::{JobReport, JobState};
pub use registry::{NodeRegistry, NodeSnapshot};
pub use transport::{read_frame, ConnectionId, Transport, TransportError};
