//! `jobqueue-core`: job lifecycle building blocks.
//!
//! This crate contains the **pure** job model (no storage or runtime concerns):
//! identifiers, the status machine, the descriptor and the error taxonomy.

pub mod descriptor;
pub mod error;
pub mod id;
pub mod status;

pub use descriptor::{DescriptorRecord, JobDescriptor};
pub use error::{QueueError, QueueResult, StoreError};
pub use id::JobId;
pub use status::{ExecutionMode, JobStatus};
