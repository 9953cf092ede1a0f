//! Structured paths for addressing nodes within a catalog tree
//!
//! Provides [`NodePath`], an ordered sequence of [`PathStep`]s. A path is
//! recorded once during extraction and handed back verbatim for reinsertion,
//! so nothing ever has to be re-parsed from a display string.

use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// One step of a [`NodePath`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathStep {
    /// Member of a JSON object
    Key(String),
    /// Element of a JSON array
    Index(usize),
}

impl Display for PathStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, ".{key}"),
            Self::Index(idx) => write!(f, "[{idx}]"),
        }
    }
}

/// Path from the document root to a value
///
/// # Examples
/// - `[Key("catalog"), Key("groups"), Index(0), Key("title")]` → `catalog.groups[0].title`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath(Vec<PathStep>);

impl NodePath {
    /// Create new path from steps
    #[inline]
    #[must_use]
    pub fn new(steps: Vec<PathStep>) -> Self {
        Self(steps)
    }

    /// Empty path (document root)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path steps
    #[inline]
    #[must_use]
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    /// Get number of steps
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is the root
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get parent path (if not root)
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .split_last()
            .map(|(_, rest)| Self(rest.to_vec()))
    }

    /// Get last step (if not root)
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&PathStep> {
        self.0.last()
    }

    /// Append an object key, returning new path
    #[inline]
    #[must_use]
    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(PathStep::Key(key.into()));
        new
    }

    /// Append an array index, returning new path
    #[inline]
    #[must_use]
    pub fn index(&self, idx: usize) -> Self {
        let mut new = self.clone();
        new.0.push(PathStep::Index(idx));
        new
    }

    /// Check if this path is a prefix of another
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Resolve the path against a document
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(root, |node, step| match step {
            PathStep::Key(key) => node.as_object()?.get(key),
            PathStep::Index(idx) => node.as_array()?.get(*idx),
        })
    }

    /// Resolve the path against a document for mutation
    #[must_use]
    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        self.0.iter().try_fold(root, |node, step| match step {
            PathStep::Key(key) => node.as_object_mut()?.get_mut(key),
            PathStep::Index(idx) => node.as_array_mut()?.get_mut(*idx),
        })
    }

    /// Overwrite the value at this path
    ///
    /// The final step may name a missing object key, which is then inserted.
    /// Every intermediate step must already exist.
    ///
    /// # Errors
    /// - [`PathError::Unresolved`] if an intermediate step does not exist
    /// - [`PathError::RootReplacement`] for the root path
    pub fn set(&self, root: &mut Value, value: Value) -> Result<Option<Value>, PathError> {
        let (last, parent_steps) = self.0.split_last().ok_or(PathError::RootReplacement)?;
        let parent = Self(parent_steps.to_vec());
        let node = parent
            .resolve_mut(root)
            .ok_or_else(|| PathError::Unresolved(parent.to_string()))?;

        match (last, node) {
            (PathStep::Key(key), Value::Object(map)) => Ok(map.insert(key.clone(), value)),
            (PathStep::Index(idx), Value::Array(items)) => match items.get_mut(*idx) {
                Some(slot) => Ok(Some(std::mem::replace(slot, value))),
                None => Err(PathError::Unresolved(self.to_string())),
            },
            _ => Err(PathError::Unresolved(self.to_string())),
        }
    }

    /// Iterator over steps from root to leaf
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PathStep> {
        self.0.iter()
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for step in &self.0 {
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

impl From<Vec<PathStep>> for NodePath {
    fn from(steps: Vec<PathStep>) -> Self {
        Self(steps)
    }
}

impl FromIterator<PathStep> for NodePath {
    fn from_iter<I: IntoIterator<Item = PathStep>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Path errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Path does not address an existing location
    #[error("path does not resolve: {0}")]
    Unresolved(String),

    /// The document root cannot be replaced through a path
    #[error("cannot replace the document root")]
    RootReplacement,
}
