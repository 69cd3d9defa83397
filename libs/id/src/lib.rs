//! # fleet-id
//!
//! Tenant identifiers and deterministic resource naming for the worker fleet.
//!
//! ## Design Principles
//!
//! - A tenant ID is an opaque, stable string handed to us by the caller
//! - Every platform object owned by a tenant is named from its ID, so the
//!   orchestrator can find a tenant's service, volume and hostname without
//!   keeping a lookup table
//! - IDs are validated up front so derived names are always legal object
//!   names on the orchestration platform
//!
//! ## Naming
//!
//! With the default prefix `worker`, tenant `u1` owns:
//! - service `worker-u1`
//! - volume `worker-u1-data`
//! - hostname `worker-u1`

mod error;
mod types;

pub use error::IdError;
pub use types::*;
