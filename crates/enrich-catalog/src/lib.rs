//! Catalog tree model for OSCAL / Grundschutz documents
//!
//! Documents are kept as ordered JSON so that every member the pipelines do
//! not understand is written back exactly as it was read. On top of that:
//!
//! - [`NodePath`]: structured `{key} | {index}` addresses, recorded once and
//!   reused for reinsertion
//! - [`NodeKind`] / [`NodeRef`]: kind-tagged views (group, control, part)
//! - [`TreeIndex`]: pre-order queries (by id, owning container, predicate,
//!   text fields)
//! - [`Catalog`]: parsing, serialization, metadata stamping and the
//!   structural sanity check
//!
//! # Example
//!
//! ```rust
//! use enrich_catalog::{Catalog, NodeKind};
//!
//! let catalog = Catalog::from_slice(br#"{"catalog": {"groups": [
//!     {"id": "APP.1", "controls": [{"id": "APP.1.A1", "title": "Updates"}]}
//! ]}}"#).unwrap();
//!
//! let index = catalog.index();
//! let owner = index.find_container_of_kind(NodeKind::Group, "APP.1.A1").unwrap();
//! assert_eq!(owner.id(), Some("APP.1"));
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod catalog;
mod index;
mod node;
mod path;

pub use catalog::{Catalog, CatalogError, ShapeViolation};
pub use index::{TextField, TreeIndex, Walk};
pub use node::{NodeKind, NodeRef, CHILD_COLLECTIONS};
pub use path::{NodePath, PathError, PathStep};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
