//! Identifier types for simulated patients, pathway instances and HL7 messages.
//!
//! The simulator hands out several kinds of identifiers, each with a different contract:
//!
//! - [`PatientId`]: internal patient identity. A *canonical* UUID, always rendered as
//!   **32 lowercase hexadecimal characters** (no hyphens), e.g.
//!   `550e8400e29b41d4a716446655440000`.
//! - [`Mrn`]: the medical record number written into PID-3. Allocated sequentially by an
//!   [`MrnAllocator`] so that MRNs are short, numeric and never reused within a run.
//! - [`InstanceId`]: identifies one running pathway instance on the dashboard and in logs.
//! - [`ControlId`]: the MSH-10 message control ID. Issued by a [`ControlIdGenerator`] and
//!   strictly increasing in issue order, so a receiver's log can be replayed and matched
//!   against the simulator's log.
//!
//! ## Control ID format
//! Control IDs are decimal integers. The generator is seeded from the wall clock (milliseconds
//! since the epoch, multiplied by 1000) so that IDs from consecutive runs do not collide,
//! and then increments by one per message. The result fits within the 20 characters HL7 2.3
//! allows for MSH-10.

mod service;

pub use service::{
    ControlId, ControlIdGenerator, InstanceId, InstanceIdGenerator, Mrn, MrnAllocator, PatientId,
};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type IdResult<T> = Result<T, IdError>;
