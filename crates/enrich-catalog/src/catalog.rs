//! Owned catalog documents
//!
//! [`Catalog`] wraps the parsed JSON document together with the few
//! whole-document operations the pipelines need: parsing, serialization,
//! stamping the modification time and the structural sanity check that runs
//! before anything is persisted.

use crate::index::TreeIndex;
use crate::node::NodeKind;
use crate::path::NodePath;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// A parsed catalog document
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    root: Value,
}

impl Catalog {
    /// Parse a catalog from raw JSON bytes
    ///
    /// # Errors
    /// - [`CatalogError::Parse`] if the bytes are not JSON
    /// - [`CatalogError::NotAnObject`] if the document root is not an object
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CatalogError> {
        let root: Value = serde_json::from_slice(bytes)?;
        Self::from_value(root)
    }

    /// Wrap an already parsed document
    ///
    /// # Errors
    /// [`CatalogError::NotAnObject`] if the document root is not an object
    pub fn from_value(root: Value) -> Result<Self, CatalogError> {
        if root.is_object() {
            Ok(Self { root })
        } else {
            Err(CatalogError::NotAnObject)
        }
    }

    /// Document root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Document root for mutation
    #[inline]
    pub fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// Unwrap the document
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Value {
        self.root
    }

    /// Query layer over this document
    #[inline]
    #[must_use]
    pub fn index(&self) -> TreeIndex<'_> {
        TreeIndex::new(&self.root)
    }

    /// Serialize with indentation
    ///
    /// # Errors
    /// [`CatalogError::Parse`] if serialization fails
    pub fn to_pretty_vec(&self) -> Result<Vec<u8>, CatalogError> {
        Ok(serde_json::to_vec_pretty(&self.root)?)
    }

    /// Set `metadata.last-modified` to `at`
    ///
    /// The metadata object lives under the top-level `catalog` member when
    /// there is one, otherwise directly under the root. It is created if
    /// missing.
    pub fn touch_last_modified(&mut self, at: DateTime<Utc>) {
        let stamp = Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true));
        let Some(root) = self.root.as_object_mut() else {
            return;
        };
        let nested = root.get("catalog").is_some_and(Value::is_object);
        let holder = if nested {
            match root.get_mut("catalog") {
                Some(Value::Object(catalog)) => catalog,
                _ => return,
            }
        } else {
            root
        };
        let metadata = holder
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("last-modified".to_string(), stamp);
        }
    }

    /// Structural problems that make the document unusable downstream
    ///
    /// Every group and control must carry a non-empty string id, and no id
    /// may appear twice anywhere in the tree.
    #[must_use]
    pub fn shape_violations(&self) -> Vec<ShapeViolation> {
        let mut violations = Vec::new();
        let mut seen: HashMap<&str, NodePath> = HashMap::new();

        for node in self.index().walk() {
            match node.id() {
                Some(id) if !id.trim().is_empty() => {
                    if let Some(first) = seen.get(id) {
                        violations.push(ShapeViolation::DuplicateId {
                            id: id.to_string(),
                            first: first.clone(),
                            second: node.path().clone(),
                        });
                    } else {
                        seen.insert(id, node.path().clone());
                    }
                }
                _ if node.kind().requires_id() => {
                    violations.push(ShapeViolation::MissingId {
                        kind: node.kind(),
                        path: node.path().clone(),
                    });
                }
                _ => {}
            }
        }

        violations
    }
}

/// A structural problem found by [`Catalog::shape_violations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeViolation {
    /// A group or control without a usable id
    MissingId {
        /// Kind of the offending node
        kind: NodeKind,
        /// Where it is
        path: NodePath,
    },
    /// The same id on two nodes
    DuplicateId {
        /// The repeated id
        id: String,
        /// First occurrence
        first: NodePath,
        /// Later occurrence
        second: NodePath,
    },
}

impl Display for ShapeViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId { kind, path } => write!(f, "{kind} at {path} has no id"),
            Self::DuplicateId { id, first, second } => {
                write!(f, "id {id:?} appears at {first} and {second}")
            }
        }
    }
}

/// Catalog loading errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Bytes are not valid JSON
    #[error("invalid catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Root is a scalar or an array
    #[error("catalog root must be a JSON object")]
    NotAnObject,
}
