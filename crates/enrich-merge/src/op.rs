//! Merge operations and their application to a document
//!
//! Every operation here is idempotent: applying the same operation twice
//! leaves the document exactly as applying it once.

use enrich_catalog::{NodePath, PathError, TreeIndex};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// How a merge operation locates its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTarget {
    /// First node (pre-order) carrying this id
    Id(String),
    /// Exact structural path recorded at extraction time
    Path(NodePath),
}

impl MergeTarget {
    /// Target by id
    #[inline]
    #[must_use]
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    fn locate<'a>(&self, tree: &'a mut Value) -> Result<&'a mut Value, MergeError> {
        let path = match self {
            Self::Id(id) => TreeIndex::new(tree)
                .find_by_id(id)
                .map(|node| node.path().clone())
                .ok_or_else(|| MergeError::TargetNotFound(self.clone()))?,
            Self::Path(path) => path.clone(),
        };
        path.resolve_mut(tree)
            .ok_or_else(|| MergeError::TargetNotFound(self.clone()))
    }
}

impl Display for MergeTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id:?}"),
            Self::Path(path) => write!(f, "path {path}"),
        }
    }
}

/// Merge mode, for logging and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    /// Set one member of an object node
    Field,
    /// Overwrite the value at an exact path
    Replace,
    /// Replace-by-key append into a child collection
    Append,
}

impl MergeMode {
    /// Mode name
    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::Replace => "replace",
            Self::Append => "append",
        }
    }
}

/// One write into the catalog tree
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOp {
    /// Insert or overwrite `field` on the object node at `target`
    SetField {
        /// Node to write into
        target: MergeTarget,
        /// Member name
        field: String,
        /// New value
        value: Value,
    },
    /// Overwrite whatever value sits at `path`
    Replace {
        /// Exact location (the last step may name a missing member)
        path: NodePath,
        /// New value
        value: Value,
    },
    /// Remove entries of `collection` whose `key` matches a new entry, then append
    AppendReplacing {
        /// Node owning the collection
        target: MergeTarget,
        /// Collection member name (created if missing)
        collection: String,
        /// Identifying member of each entry (e.g. `name` or `id`)
        key: String,
        /// Entries to (re)write, in order
        entries: Vec<Value>,
    },
}

impl MergeOp {
    /// Field merge
    #[inline]
    #[must_use]
    pub fn set_field(target: MergeTarget, field: impl Into<String>, value: Value) -> Self {
        Self::SetField {
            target,
            field: field.into(),
            value,
        }
    }

    /// Exact-path replace
    #[inline]
    #[must_use]
    pub fn replace(path: NodePath, value: Value) -> Self {
        Self::Replace { path, value }
    }

    /// Append merge
    #[inline]
    #[must_use]
    pub fn append_replacing(
        target: MergeTarget,
        collection: impl Into<String>,
        key: impl Into<String>,
        entries: Vec<Value>,
    ) -> Self {
        Self::AppendReplacing {
            target,
            collection: collection.into(),
            key: key.into(),
            entries,
        }
    }

    /// Mode of this operation
    #[inline]
    #[must_use]
    pub fn mode(&self) -> MergeMode {
        match self {
            Self::SetField { .. } => MergeMode::Field,
            Self::Replace { .. } => MergeMode::Replace,
            Self::AppendReplacing { .. } => MergeMode::Append,
        }
    }

    /// Apply this operation to `tree`
    ///
    /// # Errors
    /// - [`MergeError::TargetNotFound`] if the node cannot be located
    /// - [`MergeError::NotAnObject`] if the node is not an object
    /// - [`MergeError::CollectionNotArray`] if the collection exists with another type
    /// - [`MergeError::EntryMissingKey`] if a new entry lacks its identifying key
    ///
    /// On error the tree is left unchanged.
    pub fn apply(&self, tree: &mut Value) -> Result<MergeOutcome, MergeError> {
        match self {
            Self::SetField {
                target,
                field,
                value,
            } => {
                let node = target
                    .locate(tree)?
                    .as_object_mut()
                    .ok_or_else(|| MergeError::NotAnObject(target.clone()))?;
                match node.insert(field.clone(), value.clone()) {
                    Some(previous) if previous == *value => Ok(MergeOutcome::Unchanged),
                    Some(_) => Ok(MergeOutcome::Updated),
                    None => Ok(MergeOutcome::Inserted),
                }
            }
            Self::Replace { path, value } => {
                if path.resolve(tree) == Some(value) {
                    return Ok(MergeOutcome::Unchanged);
                }
                match path.set(tree, value.clone()) {
                    Ok(Some(_)) => Ok(MergeOutcome::Updated),
                    Ok(None) => Ok(MergeOutcome::Inserted),
                    Err(PathError::Unresolved(_) | PathError::RootReplacement) => {
                        Err(MergeError::TargetNotFound(MergeTarget::Path(path.clone())))
                    }
                }
            }
            Self::AppendReplacing {
                target,
                collection,
                key,
                entries,
            } => {
                let keys = entries
                    .iter()
                    .map(|entry| {
                        entry
                            .get(key)
                            .filter(|k| !k.is_null())
                            .cloned()
                            .ok_or_else(|| MergeError::EntryMissingKey(key.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let node = target
                    .locate(tree)?
                    .as_object_mut()
                    .ok_or_else(|| MergeError::NotAnObject(target.clone()))?;
                let items = node
                    .entry(collection.as_str())
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .ok_or_else(|| MergeError::CollectionNotArray(collection.clone()))?;

                let before = items.len();
                items.retain(|item| item.get(key).map_or(true, |k| !keys.contains(k)));
                let removed = before - items.len();
                items.extend(entries.iter().cloned());

                Ok(MergeOutcome::Appended {
                    removed,
                    appended: entries.len(),
                })
            }
        }
    }
}

/// What a successful merge did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The value was already in place
    Unchanged,
    /// An existing value was overwritten
    Updated,
    /// A new member was created
    Inserted,
    /// Entries were replaced and appended
    Appended {
        /// Existing entries dropped because their key was rewritten
        removed: usize,
        /// Entries appended
        appended: usize,
    },
}

/// Merge errors
///
/// All of these drop the one result concerned; none of them abort a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    /// No node at the target
    #[error("merge target not found: {0}")]
    TargetNotFound(MergeTarget),

    /// Target exists but is not an object
    #[error("merge target is not an object: {0}")]
    NotAnObject(MergeTarget),

    /// Collection member exists with a non-array value
    #[error("collection {0:?} is not an array")]
    CollectionNotArray(String),

    /// A new entry lacks its identifying member
    #[error("entry has no {0:?} member")]
    EntryMissingKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn control() -> Value {
        json!({
            "catalog": {
                "groups": [{
                    "id": "G",
                    "controls": [{
                        "id": "C1",
                        "title": "Kontrolle",
                        "parts": [
                            {"name": "statement", "prose": "Soll."},
                            {"name": "practice", "prose": "old"},
                            {"name": "guidance", "prose": "Hinweis"}
                        ]
                    }]
                }]
            }
        })
    }

    #[test]
    fn set_field_by_id() {
        let mut tree = control();
        let op = MergeOp::set_field(MergeTarget::id("C1"), "prose_qs", json!("besser"));
        assert_eq!(op.apply(&mut tree).unwrap(), MergeOutcome::Inserted);
        assert_eq!(op.apply(&mut tree).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(tree["catalog"]["groups"][0]["controls"][0]["prose_qs"], "besser");

        let update = MergeOp::set_field(MergeTarget::id("C1"), "prose_qs", json!("neu"));
        assert_eq!(update.apply(&mut tree).unwrap(), MergeOutcome::Updated);
    }

    #[test]
    fn replace_at_path() {
        let mut tree = control();
        let path = NodePath::root()
            .key("catalog")
            .key("groups")
            .index(0)
            .key("controls")
            .index(0)
            .key("title");
        let op = MergeOp::replace(path.clone(), json!("Control"));
        assert_eq!(op.apply(&mut tree).unwrap(), MergeOutcome::Updated);
        assert_eq!(op.apply(&mut tree).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(path.resolve(&tree), Some(&json!("Control")));
    }

    #[test]
    fn append_replaces_by_key() {
        let mut tree = control();
        let op = MergeOp::append_replacing(
            MergeTarget::id("C1"),
            "parts",
            "name",
            vec![json!({"name": "practice", "prose": "new"})],
        );

        assert_eq!(
            op.apply(&mut tree).unwrap(),
            MergeOutcome::Appended { removed: 1, appended: 1 }
        );
        let once = tree.clone();
        op.apply(&mut tree).unwrap();
        assert_eq!(tree, once);

        let parts = tree["catalog"]["groups"][0]["controls"][0]["parts"]
            .as_array()
            .unwrap();
        let names: Vec<_> = parts.iter().map(|p| p["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["statement", "guidance", "practice"]);
        assert_eq!(parts[2]["prose"], "new");
    }

    #[test]
    fn append_creates_collection() {
        let mut tree = control();
        let op = MergeOp::append_replacing(
            MergeTarget::id("G"),
            "props",
            "name",
            vec![json!({"name": "tier", "value": "1"})],
        );
        op.apply(&mut tree).unwrap();
        assert_eq!(tree["catalog"]["groups"][0]["props"][0]["value"], "1");
    }

    #[test]
    fn failures_leave_tree_untouched() {
        let mut tree = control();
        let original = tree.clone();

        let missing = MergeOp::set_field(MergeTarget::id("NOPE"), "x", json!(1));
        assert!(matches!(
            missing.apply(&mut tree),
            Err(MergeError::TargetNotFound(_))
        ));

        let keyless = MergeOp::append_replacing(
            MergeTarget::id("C1"),
            "parts",
            "name",
            vec![json!({"name": "ok"}), json!({"prose": "no name"})],
        );
        assert_eq!(
            keyless.apply(&mut tree),
            Err(MergeError::EntryMissingKey("name".into()))
        );

        let not_array = MergeOp::append_replacing(
            MergeTarget::id("C1"),
            "title",
            "name",
            vec![json!({"name": "x"})],
        );
        assert_eq!(
            not_array.apply(&mut tree),
            Err(MergeError::CollectionNotArray("title".into()))
        );

        let bad_path = MergeOp::replace(NodePath::root().key("nope").key("deeper"), json!(1));
        assert!(matches!(
            bad_path.apply(&mut tree),
            Err(MergeError::TargetNotFound(MergeTarget::Path(_)))
        ));

        assert_eq!(tree, original);
    }
}
