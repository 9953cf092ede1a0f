//! Kind-tagged views over catalog nodes
//!
//! Catalog documents stay open JSON maps so that unknown members survive a
//! round trip untouched. A [`NodeRef`] pairs such a map with the
//! [`NodeKind`] implied by the collection it lives in and the [`NodePath`]
//! that reaches it.

use crate::path::NodePath;
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};

/// Member names of the child collections that classify their elements
pub const CHILD_COLLECTIONS: [&str; 3] = ["groups", "controls", "parts"];

/// Classification of a catalog node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Element of a `groups` array (a Baustein)
    Group,
    /// Element of a `controls` array
    Control,
    /// Element of a `parts` array
    Part,
    /// Any other object (the document root, metadata, props, ...)
    Other,
}

impl NodeKind {
    /// Kind of the elements stored under a collection member name
    #[inline]
    #[must_use]
    pub fn for_collection(key: &str) -> Self {
        match key {
            "groups" => Self::Group,
            "controls" => Self::Control,
            "parts" => Self::Part,
            _ => Self::Other,
        }
    }

    /// Whether nodes of this kind must carry an id
    #[inline]
    #[must_use]
    pub fn requires_id(self) -> bool {
        matches!(self, Self::Group | Self::Control)
    }

    /// Lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Control => "control",
            Self::Part => "part",
            Self::Other => "other",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view of one object node in a catalog
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef<'a> {
    kind: NodeKind,
    path: NodePath,
    node: &'a Map<String, Value>,
}

impl<'a> NodeRef<'a> {
    /// Create a view
    #[inline]
    #[must_use]
    pub fn new(kind: NodeKind, path: NodePath, node: &'a Map<String, Value>) -> Self {
        Self { kind, path, node }
    }

    /// Node kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Path from the document root
    #[inline]
    #[must_use]
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Underlying attribute map
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> &'a Map<String, Value> {
        self.node
    }

    /// String attribute, if present and a string
    #[inline]
    #[must_use]
    pub fn str_attr(&self, name: &str) -> Option<&'a str> {
        self.node.get(name).and_then(Value::as_str)
    }

    /// `id` attribute
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&'a str> {
        self.str_attr("id")
    }

    /// `title` attribute
    #[inline]
    #[must_use]
    pub fn title(&self) -> Option<&'a str> {
        self.str_attr("title")
    }

    /// `class` attribute
    #[inline]
    #[must_use]
    pub fn class(&self) -> Option<&'a str> {
        self.str_attr("class")
    }

    /// `name` attribute (semantic role of a part)
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&'a str> {
        self.str_attr("name")
    }

    /// `prose` attribute
    #[inline]
    #[must_use]
    pub fn prose(&self) -> Option<&'a str> {
        self.str_attr("prose")
    }

    /// Elements of a child collection that are objects
    ///
    /// Missing collections and collections of the wrong type yield nothing.
    pub fn children(&self, collection: &str) -> impl Iterator<Item = NodeRef<'a>> + '_ {
        let kind = NodeKind::for_collection(collection);
        let base = self.path.key(collection);
        self.node
            .get(collection)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(move |(idx, value)| {
                value
                    .as_object()
                    .map(|map| NodeRef::new(kind, base.index(idx), map))
            })
    }

    /// Whether any of this node's own child collections holds an item with `id`
    #[must_use]
    pub fn directly_contains(&self, id: &str) -> bool {
        CHILD_COLLECTIONS.iter().any(|collection| {
            self.node
                .get(*collection)
                .and_then(Value::as_array)
                .is_some_and(|items| {
                    items
                        .iter()
                        .any(|item| item.get("id").and_then(Value::as_str) == Some(id))
                })
        })
    }
}
