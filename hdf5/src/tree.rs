//! The materialized object hierarchy: an arena of nodes with index-based
//! parent links and name-sorted child lists.

use crate::error::{Hdf5Error, Result};
use crate::object_header::ObjectHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Dataset,
    /// A soft link, kept as a leaf; the target path is not resolved.
    SoftLink { target: String },
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Absent only for soft links.
    pub header: Option<ObjectHeader>,
    pub parent: Option<NodeId>,
    /// Set when this object was already reached through another path;
    /// holds that first path.
    pub hard_link_path: Option<String>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn is_group(&self) -> bool {
        self.kind == NodeKind::Group
    }

    pub fn is_dataset(&self) -> bool {
        self.kind == NodeKind::Dataset
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn with_root(header: ObjectHeader) -> (Tree, NodeId) {
        let root = Node {
            name: String::new(),
            kind: NodeKind::Group,
            header: Some(header),
            parent: None,
            hard_link_path: None,
            children: Vec::new(),
        };
        (Tree { nodes: vec![root] }, NodeId(0))
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a child under `parent`, keeping the child list sorted by
    /// name. Two siblings may not share a name.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: String,
        kind: NodeKind,
        header: Option<ObjectHeader>,
        hard_link_path: Option<String>,
    ) -> Result<NodeId> {
        let slot = {
            let siblings = &self.nodes[parent.0].children;
            match siblings.binary_search_by(|c| self.nodes[c.0].name.as_str().cmp(&name)) {
                Ok(_) => {
                    let offset = self.nodes[parent.0]
                        .header
                        .as_ref()
                        .map(|h| h.address)
                        .unwrap_or(0);
                    return Err(Hdf5Error::DuplicateLink { name, offset });
                }
                Err(slot) => slot,
            }
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name,
            kind,
            header,
            parent: Some(parent),
            hard_link_path,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.insert(slot, id);
        Ok(id)
    }

    /// Absolute path of a node, `/` for the root.
    pub fn path_of(&self, id: NodeId) -> String {
        if id.0 == 0 {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = &self.nodes[c.0];
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Resolve an absolute path; empty segments are ignored, so `/`,
    /// `//a`, and `/a/` behave as expected. Descent stops early at a
    /// non-group node.
    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !self.nodes[current.0].is_group() {
                return None;
            }
            let children = &self.nodes[current.0].children;
            let found = children
                .binary_search_by(|c| self.nodes[c.0].name.as_str().cmp(segment))
                .ok()?;
            current = children[found];
        }
        Some(current)
    }

    /// Pre-order depth-first traversal over every node.
    pub fn iter(&self) -> PreOrderIter<'_> {
        PreOrderIter {
            tree: self,
            stack: vec![self.root()],
        }
    }

    /// The dataset subset of `iter`, in the same order.
    pub fn datasets(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.iter().filter(|&id| self.node(id).is_dataset())
    }

    /// The group subset of `iter`, in the same order.
    pub fn groups(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.iter().filter(|&id| self.node(id).is_group())
    }
}

/// Explicit-stack traversal; children are visited in name order.
pub struct PreOrderIter<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl Iterator for PreOrderIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        let children = self.tree.children(id);
        for &child in children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}
