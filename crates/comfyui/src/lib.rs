//! ComfyUI WebSocket job client.
//!
//! Loads workflow graphs, queues them over the REST API, demultiplexes
//! the resulting WebSocket event stream into per-label images, writes
//! them to disk, and serializes jobs over one reconnecting session.

pub mod api;
pub mod client;
pub mod demux;
pub mod events;
pub mod job;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod workflow;

pub use api::{ComfyUIApi, Enqueue};
pub use client::{ComfyUIClient, Connector, Transport, TransportError};
pub use job::{Job, JobError, JobOptions, JobResult, SideArtifact};
pub use session::{JobOutcome, JobTicket, SessionConfig, SessionManager};
pub use workflow::{WorkflowDescriptor, WorkflowError};
