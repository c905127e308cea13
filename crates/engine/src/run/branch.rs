//! Branch paths for loop iteration scoping
//!
//! Every step belongs to a branch. The root branch is the empty path. Each
//! item a loop iterator spawns gets a child branch `<parent>/<loop_node>#<index>`,
//! so nested loops produce paths like `/outer#2/inner#0`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Path identifying the loop-item scope a step runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchPath(String);

/// The innermost loop frame of a branch path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFrame {
    /// Branch the loop node itself ran in
    pub parent: BranchPath,
    /// Loop iterator node that spawned this item
    pub loop_node: String,
    /// Item index within the loop
    pub index: u32,
}

impl BranchPath {
    /// The root branch of a run
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Wrap a stored path without validation
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Child branch for item `index` of `loop_node`
    pub fn child(&self, loop_node: &str, index: u32) -> Self {
        Self(format!("{}/{}#{}", self.0, loop_node, index))
    }

    /// Number of nested loop frames
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }

    /// Split off the innermost loop frame, or `None` at the root
    pub fn innermost(&self) -> Option<LoopFrame> {
        let slash = self.0.rfind('/')?;
        let (parent, segment) = (&self.0[..slash], &self.0[slash + 1..]);
        let (loop_node, index) = segment.rsplit_once('#')?;
        Some(LoopFrame {
            parent: Self(parent.to_string()),
            loop_node: loop_node.to_string(),
            index: index.parse().ok()?,
        })
    }

    /// Whether `other` is this branch or nested somewhere inside it
    pub fn contains(&self, other: &BranchPath) -> bool {
        if self.is_root() || self.0 == other.0 {
            return true;
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
