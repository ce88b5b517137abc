//! Shared contract types for Stratus services.
//!
//! Everything a Stratus daemon exchanges with its peers or its embedding
//! binary lives here: the typed control-plane error, the aggregated query
//! status value, the wire-form structs for the fragment-control RPC surface
//! and the shared-state topics, and the unit grammars used by query options.

pub mod error;
pub mod status;
pub mod units;
pub mod wire;

pub use error::{ControlError, Result};
pub use status::QueryStatus;
