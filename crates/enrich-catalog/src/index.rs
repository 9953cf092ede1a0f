//! Read-only queries over a catalog tree
//!
//! [`TreeIndex`] is a stateless lens over a borrowed document. Every query
//! walks the tree in pre-order (parent before children, children in
//! document order). Traversal is total: members of the wrong JSON type are
//! skipped, never reported as errors.

use crate::node::{NodeKind, NodeRef, CHILD_COLLECTIONS};
use crate::path::NodePath;
use serde_json::Value;
use tracing::warn;

/// A string value found under one of the requested field names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextField {
    /// Location of the string itself (the last step is the field name)
    pub path: NodePath,
    /// Field name the string was stored under
    pub field: String,
    /// The text
    pub text: String,
}

/// Query layer over a borrowed catalog document
#[derive(Debug, Clone, Copy)]
pub struct TreeIndex<'a> {
    root: &'a Value,
}

impl<'a> TreeIndex<'a> {
    /// Create an index over `root`
    #[inline]
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Pre-order walk over every object node
    #[inline]
    #[must_use]
    pub fn walk(&self) -> Walk<'a> {
        Walk::new(self.root)
    }

    /// First node (in pre-order) whose `id` equals `id`
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<NodeRef<'a>> {
        self.walk().find(|node| node.id() == Some(id))
    }

    /// Nearest node of `kind` owning the item with `child_id`
    ///
    /// Used to find the group (Baustein) that owns a control. A node of
    /// `kind` whose own child collections hold the item wins; otherwise the
    /// deepest ancestor of `kind` is returned, so a control nested inside
    /// another control still resolves to its group.
    #[must_use]
    pub fn find_container_of_kind(&self, kind: NodeKind, child_id: &str) -> Option<NodeRef<'a>> {
        if let Some(direct) = self
            .walk()
            .find(|node| node.kind() == kind && node.directly_contains(child_id))
        {
            return Some(direct);
        }

        let child = self.find_by_id(child_id)?;
        self.walk()
            .take_while(|node| node.path() != child.path())
            .filter(|node| node.kind() == kind && node.path().is_prefix_of(child.path()))
            .last()
    }

    /// Every node matching `predicate`, in pre-order
    pub fn collect_all<P>(&self, mut predicate: P) -> Vec<NodeRef<'a>>
    where
        P: FnMut(&NodeRef<'a>) -> bool,
    {
        self.walk().filter(|node| predicate(node)).collect()
    }

    /// Every node of the given kind, in pre-order
    #[must_use]
    pub fn collect_kind(&self, kind: NodeKind) -> Vec<NodeRef<'a>> {
        self.collect_all(|node| node.kind() == kind)
    }

    /// Every non-blank string stored under one of `fields`, in pre-order
    ///
    /// A listed field whose value is not a string is descended into like
    /// any other member.
    #[must_use]
    pub fn extract_text_fields(&self, fields: &[&str]) -> Vec<TextField> {
        let mut out = Vec::new();
        collect_text(self.root, &NodePath::root(), fields, &mut out);
        out
    }
}

fn collect_text(value: &Value, path: &NodePath, fields: &[&str], out: &mut Vec<TextField>) {
    match value {
        Value::Object(map) => {
            for (key, member) in map {
                let member_path = path.key(key.as_str());
                match member {
                    Value::String(text) if fields.contains(&key.as_str()) => {
                        if !text.trim().is_empty() {
                            out.push(TextField {
                                path: member_path,
                                field: key.clone(),
                                text: text.clone(),
                            });
                        }
                    }
                    _ => collect_text(member, &member_path, fields, out),
                }
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                collect_text(item, &path.index(idx), fields, out);
            }
        }
        _ => {}
    }
}

/// A child collection key whose value is not an array
fn misplaced_collection(key: &str, member: &Value) -> bool {
    CHILD_COLLECTIONS.contains(&key) && !member.is_array()
}

/// Lazy pre-order iterator over the object nodes of a document
///
/// Each call to [`TreeIndex::walk`] starts a fresh traversal, so the
/// sequence is restartable and always yields the same order for the same
/// document.
#[derive(Debug)]
pub struct Walk<'a> {
    stack: Vec<(NodeKind, NodePath, &'a Value)>,
}

impl<'a> Walk<'a> {
    fn new(root: &'a Value) -> Self {
        Self {
            stack: vec![(NodeKind::Other, NodePath::root(), root)],
        }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((kind, path, value)) = self.stack.pop() {
            match value {
                Value::Object(map) => {
                    for (key, member) in map.iter().rev() {
                        let member_path = path.key(key.as_str());
                        match member {
                            Value::Array(_) => self.stack.push((
                                NodeKind::for_collection(key),
                                member_path,
                                member,
                            )),
                            Value::Object(_) => {
                                if misplaced_collection(key, member) {
                                    warn!(path = %member_path, "collection is not an array; skipping classification");
                                }
                                self.stack.push((NodeKind::Other, member_path, member));
                            }
                            _ => {
                                if misplaced_collection(key, member) {
                                    warn!(path = %member_path, "collection holds a scalar; skipped");
                                }
                            }
                        }
                    }
                    return Some(NodeRef::new(kind, path, map));
                }
                Value::Array(items) => {
                    for (idx, item) in items.iter().enumerate().rev() {
                        if item.is_object() || item.is_array() {
                            self.stack.push((kind, path.index(idx), item));
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }
}
