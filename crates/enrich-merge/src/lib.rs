//! Merging generated results back into a catalog tree
//!
//! # Core Concepts
//!
//! - [`MergeOp`]: one idempotent write (field merge, exact-path replace or
//!   replace-by-key append)
//! - [`MergeTarget`]: locate the node by id or by a recorded [`NodePath`]
//! - [`MergeCoordinator`]: owns the tree for a run and serializes every
//!   write behind a single lock
//!
//! # Example
//!
//! ```rust
//! use enrich_merge::{MergeCoordinator, MergeOp, MergeTarget};
//! use serde_json::json;
//!
//! let coordinator = MergeCoordinator::new(json!({"controls": [{"id": "C1", "parts": []}]}));
//! let op = MergeOp::append_replacing(
//!     MergeTarget::id("C1"),
//!     "parts",
//!     "name",
//!     vec![json!({"name": "practice", "prose": "..."})],
//! );
//! coordinator.apply(&op).unwrap();
//! coordinator.apply(&op).unwrap();
//! assert_eq!(coordinator.snapshot()["controls"][0]["parts"].as_array().unwrap().len(), 1);
//! ```
//!
//! [`NodePath`]: enrich_catalog::NodePath

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod coordinator;
mod op;

pub use coordinator::{MergeCoordinator, MergeReport, MergeStats};
pub use op::{MergeError, MergeMode, MergeOp, MergeOutcome, MergeTarget};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
