//! Protocol trees over a roster, and their wire form.
//!
//! Nodes live in one arena in depth-first order with the root first.
//! Parent and child links are node ids, so a tree has no reference cycles
//! and the wire form never carries parents: they are rebuilt top-down when
//! a [`TreeMarshal`] is turned back into a [`Tree`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use canopy_network::{define_id, PublicKey, ServerIdentity, ServerIdentityId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::roster::{Roster, RosterId};
use crate::OverlayError;

define_id!(
    /// Content-derived id of a tree.
    TreeId
);

define_id!(
    /// Id of one position in a tree.
    TreeNodeId
);

/// One position in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: TreeNodeId,
    pub server_identity: ServerIdentity,
    /// Index of `server_identity` in the tree's roster.
    pub roster_index: usize,
    pub parent: Option<TreeNodeId>,
    pub children: Vec<TreeNodeId>,
    /// This node's public key plus the aggregate of every child.
    pub aggregate: PublicKey,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Human readable name: the node's address.
    pub fn name(&self) -> String {
        self.server_identity.address.to_string()
    }

    pub fn aggregate_public(&self) -> PublicKey {
        self.aggregate
    }
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A node before ids and aggregates are assigned, in depth-first order.
struct Entry {
    id: Option<TreeNodeId>,
    roster_index: usize,
    parent: Option<usize>,
}

/// A communication graph over (a subset, possibly with repetitions, of) a
/// roster. Immutable once built.
#[derive(Debug, Clone)]
pub struct Tree {
    id: TreeId,
    roster: Arc<Roster>,
    nodes: Vec<TreeNode>,
    index: HashMap<TreeNodeId, usize>,
}

impl Tree {
    /// Assign ids and aggregates to depth-first `entries`.
    ///
    /// Entries without an id get one derived from their identity and
    /// position; with `id` unset the tree id is derived from the roster,
    /// the root and the shape.
    fn assemble(id: Option<TreeId>, roster: Arc<Roster>, entries: Vec<Entry>) -> Result<Self, OverlayError> {
        if entries.is_empty() {
            return Err(OverlayError::InvalidTree("tree has no root".into()));
        }

        let mut nodes: Vec<TreeNode> = Vec::with_capacity(entries.len());
        for (pos, entry) in entries.iter().enumerate() {
            let si = roster.get(entry.roster_index).ok_or_else(|| {
                OverlayError::InvalidTree(format!("roster index {} out of range", entry.roster_index))
            })?;
            let node_id = entry.id.unwrap_or_else(|| {
                TreeNodeId::from_name(&format!("treenode/{}/{pos}", si.public.to_hex()))
            });
            let parent = match entry.parent {
                Some(p) if p < pos => Some(nodes[p].id),
                Some(p) => {
                    return Err(OverlayError::InvalidTree(format!(
                        "node {pos} has parent {p} after it"
                    )))
                }
                None if pos == 0 => None,
                None => return Err(OverlayError::InvalidTree("more than one root".into())),
            };
            nodes.push(TreeNode {
                id: node_id,
                server_identity: si.clone(),
                roster_index: entry.roster_index,
                parent,
                children: Vec::new(),
                aggregate: si.public,
            });
        }

        for (pos, entry) in entries.iter().enumerate() {
            if let Some(p) = entry.parent {
                let child = nodes[pos].id;
                nodes[p].children.push(child);
            }
        }

        // Children follow their parent in depth-first order.
        for pos in (1..entries.len()).rev() {
            if let Some(p) = entries[pos].parent {
                let agg = nodes[pos].aggregate;
                nodes[p].aggregate = nodes[p].aggregate + agg;
            }
        }

        let mut index = HashMap::with_capacity(nodes.len());
        for (pos, node) in nodes.iter().enumerate() {
            if index.insert(node.id, pos).is_some() {
                return Err(OverlayError::InvalidTree(format!("duplicate tree node {}", node.id)));
            }
        }

        let id = id.unwrap_or_else(|| {
            let mut h = Sha256::new();
            for node in &nodes {
                h.update(node.server_identity.public.to_bytes());
                if node.is_leaf() {
                    // Same nodes in another shape must hash differently.
                    h.update([1u8]);
                }
            }
            let shape: String = h.finalize().iter().map(|b| format!("{b:02x}")).collect();
            TreeId::from_name(&format!("tree/{}{}{shape}", roster.id, nodes[0].id))
        });

        Ok(Self {
            id,
            roster,
            nodes,
            index,
        })
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    /// Every node, depth-first from the root.
    pub fn list(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn search(&self, id: &TreeNodeId) -> Option<&TreeNode> {
        self.index.get(id).map(|&pos| &self.nodes[pos])
    }

    /// Position of a node in [`list`](Self::list).
    pub fn position(&self, id: &TreeNodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn parent_of(&self, node: &TreeNode) -> Option<&TreeNode> {
        node.parent.as_ref().and_then(|p| self.search(p))
    }

    pub fn children_of(&self, node: &TreeNode) -> Vec<&TreeNode> {
        node.children.iter().filter_map(|c| self.search(c)).collect()
    }

    /// Number of nodes below `id`.
    pub fn subtree_count(&self, id: &TreeNodeId) -> usize {
        match self.search(id) {
            Some(node) => node
                .children
                .iter()
                .map(|c| 1 + self.subtree_count(c))
                .sum(),
            None => 0,
        }
    }

    /// Whether `si` sits at the parent or a child of node `id`.
    pub fn is_connected_to(&self, id: &TreeNodeId, si: &ServerIdentity) -> bool {
        let Some(node) = self.search(id) else {
            return false;
        };
        self.parent_of(node)
            .is_some_and(|p| p.server_identity.id == si.id)
            || self
                .children_of(node)
                .iter()
                .any(|c| c.server_identity.id == si.id)
    }

    pub fn is_binary(&self) -> bool {
        self.is_nary(2)
    }

    /// Every node has either no children or exactly `n`.
    pub fn is_nary(&self, n: usize) -> bool {
        self.nodes
            .iter()
            .all(|node| node.children.is_empty() || node.children.len() == n)
    }

    /// Every roster member appears at least once.
    pub fn uses_list(&self) -> bool {
        self.roster
            .list
            .iter()
            .all(|si| self.nodes.iter().any(|n| n.server_identity.id == si.id))
    }

    /// Same ids, same roster, same shape.
    pub fn equal(&self, other: &Tree) -> bool {
        self.id == other.id
            && self.roster.id == other.roster.id
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().zip(&other.nodes).all(|(a, b)| {
                a.id == b.id
                    && a.server_identity.id == b.server_identity.id
                    && a.children == b.children
            })
    }

    /// Multi-line description, one node per line.
    pub fn dump(&self) -> String {
        let mut out = format!("Tree {} is:", self.id);
        for node in &self.nodes {
            let si = &node.server_identity;
            match self.parent_of(node) {
                Some(p) => out.push_str(&format!(
                    "\n{} - {}/{} has parent {}/{}",
                    self.depth(node),
                    si.public,
                    si.address,
                    p.server_identity.public,
                    p.server_identity.address
                )),
                None => out.push_str(&format!("\n{}/{} is root", si.public, si.address)),
            }
        }
        out
    }

    fn depth(&self, node: &TreeNode) -> usize {
        let mut depth = 0;
        let mut cur = node;
        while let Some(p) = self.parent_of(cur) {
            depth += 1;
            cur = p;
        }
        depth
    }

    /// Wire form: ids only, no parents, no roster.
    pub fn marshal(&self) -> TreeMarshal {
        TreeMarshal {
            tree_id: self.id,
            roster_id: self.roster.id,
            children: vec![self.marshal_node(self.root())],
            ..Default::default()
        }
    }

    fn marshal_node(&self, node: &TreeNode) -> TreeMarshal {
        TreeMarshal {
            tree_node_id: node.id,
            server_identity_id: node.server_identity.id,
            children: self
                .children_of(node)
                .into_iter()
                .map(|c| self.marshal_node(c))
                .collect(),
            ..Default::default()
        }
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TreeId:{} - RosterId:{} - RootId:{}",
            self.id,
            self.roster.id,
            self.root().id
        )
    }
}

// ── Building ─────────────────────────────────────────────────────────────

struct Slot {
    roster_index: usize,
    children: Vec<usize>,
}

/// Builds a [`Tree`] top-down by roster index.
///
/// ```rust
/// # use std::sync::Arc;
/// # use canopy_network::{Address, KeyPair, ServerIdentity};
/// # use canopy_overlay::{Roster, TreeBuilder};
/// let list = (0..3)
///     .map(|i| ServerIdentity::new(KeyPair::from_seed(i).public, Address::local("127.0.0.1", 2000 + i as u16)))
///     .collect();
/// let mut builder = TreeBuilder::new(Arc::new(Roster::new(list)), 0).unwrap();
/// builder.add_child(0, 1).unwrap();
/// builder.add_child(0, 2).unwrap();
/// let tree = builder.build().unwrap();
/// assert_eq!(tree.size(), 3);
/// ```
pub struct TreeBuilder {
    roster: Arc<Roster>,
    slots: Vec<Slot>,
}

impl TreeBuilder {
    /// Start a tree whose root is roster member `root_index`. The root is
    /// slot 0.
    pub fn new(roster: Arc<Roster>, root_index: usize) -> Result<Self, OverlayError> {
        let mut builder = Self {
            roster,
            slots: Vec::new(),
        };
        builder.push(root_index)?;
        Ok(builder)
    }

    fn push(&mut self, roster_index: usize) -> Result<usize, OverlayError> {
        if roster_index >= self.roster.len() {
            return Err(OverlayError::InvalidTree(format!(
                "roster index {roster_index} out of range"
            )));
        }
        self.slots.push(Slot {
            roster_index,
            children: Vec::new(),
        });
        Ok(self.slots.len() - 1)
    }

    /// Add roster member `roster_index` below `parent`, returning its slot.
    pub fn add_child(&mut self, parent: usize, roster_index: usize) -> Result<usize, OverlayError> {
        if parent >= self.slots.len() {
            return Err(OverlayError::InvalidTree(format!("no slot {parent}")));
        }
        let slot = self.push(roster_index)?;
        self.slots[parent].children.push(slot);
        Ok(slot)
    }

    pub fn child_count(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, |s| s.children.len())
    }

    pub fn roster_index(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).map(|s| s.roster_index)
    }

    pub fn build(self) -> Result<Tree, OverlayError> {
        let mut entries = Vec::with_capacity(self.slots.len());
        let mut stack = vec![(0usize, None)];
        while let Some((slot, parent)) = stack.pop() {
            let pos = entries.len();
            entries.push(Entry {
                id: None,
                roster_index: self.slots[slot].roster_index,
                parent,
            });
            for &child in self.slots[slot].children.iter().rev() {
                stack.push((child, Some(pos)));
            }
        }
        Tree::assemble(None, self.roster, entries)
    }
}

// ── Wire form ────────────────────────────────────────────────────────────

/// A tree on the wire.
///
/// The top level carries only `tree_id` and `roster_id`; its single child
/// is the root. Every other level carries a node id and an identity id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeMarshal {
    pub tree_node_id: TreeNodeId,
    pub tree_id: TreeId,
    pub server_identity_id: ServerIdentityId,
    pub roster_id: RosterId,
    pub children: Vec<TreeMarshal>,
}

impl TreeMarshal {
    /// The reply sent for an unknown tree.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tree_id.is_nil()
    }

    /// Rebuild the tree with the roster it was made from.
    pub fn make_tree(&self, roster: Arc<Roster>) -> Result<Tree, OverlayError> {
        if roster.id != self.roster_id {
            return Err(OverlayError::RosterMismatch {
                expected: self.roster_id,
                actual: roster.id,
            });
        }
        let [root] = self.children.as_slice() else {
            return Err(OverlayError::InvalidTree(format!(
                "expected one root, got {}",
                self.children.len()
            )));
        };
        let mut entries = Vec::new();
        root.collect(None, &roster, &mut entries)?;
        Tree::assemble(Some(self.tree_id), roster, entries)
    }

    fn collect(&self, parent: Option<usize>, roster: &Roster, out: &mut Vec<Entry>) -> Result<(), OverlayError> {
        let (roster_index, _) = roster
            .search(&self.server_identity_id)
            .ok_or(OverlayError::UnknownIdentity(self.server_identity_id))?;
        let pos = out.len();
        out.push(Entry {
            id: Some(self.tree_node_id),
            roster_index,
            parent,
        });
        for child in &self.children {
            child.collect(Some(pos), roster, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_network::{Address, KeyPair};

    fn roster(n: u64) -> Arc<Roster> {
        let list = (0..n)
            .map(|i| {
                ServerIdentity::new(
                    KeyPair::from_seed(i).public,
                    Address::local("127.0.0.1", 2000 + 2 * i as u16),
                )
            })
            .collect();
        Arc::new(Roster::new(list))
    }

    fn star(roster: &Arc<Roster>) -> Tree {
        let mut b = TreeBuilder::new(roster.clone(), 0).unwrap();
        for i in 1..roster.len() {
            b.add_child(0, i).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn builder_links_parents_and_children() {
        let ro = roster(4);
        let mut b = TreeBuilder::new(ro.clone(), 0).unwrap();
        let c1 = b.add_child(0, 1).unwrap();
        b.add_child(0, 2).unwrap();
        b.add_child(c1, 3).unwrap();
        let tree = b.build().unwrap();

        let root = tree.root();
        assert!(root.is_root());
        assert_eq!(root.children.len(), 2);
        // depth first: root, 1, 3, 2
        let order: Vec<usize> = tree.list().iter().map(|n| n.roster_index).collect();
        assert_eq!(order, vec![0, 1, 3, 2]);

        let n3 = &tree.list()[2];
        assert_eq!(tree.parent_of(n3).unwrap().roster_index, 1);
        assert!(n3.is_leaf());
        assert_eq!(tree.subtree_count(&root.id), 3);
        assert_eq!(tree.subtree_count(&tree.list()[1].id), 1);
    }

    #[test]
    fn aggregates_sum_subtrees() {
        let ro = roster(5);
        let tree = star(&ro);
        assert_eq!(tree.root().aggregate, ro.aggregate);
        for leaf in &tree.list()[1..] {
            assert_eq!(leaf.aggregate, leaf.server_identity.public);
        }
    }

    #[test]
    fn tree_id_depends_on_shape() {
        let ro = roster(3);
        let a = star(&ro);
        let mut b = TreeBuilder::new(ro.clone(), 0).unwrap();
        let c = b.add_child(0, 1).unwrap();
        b.add_child(c, 2).unwrap();
        let line = b.build().unwrap();
        assert_ne!(a.id(), line.id());
        assert_eq!(a.id(), star(&ro).id());
    }

    #[test]
    fn marshal_roundtrip() {
        let ro = roster(6);
        let tree = star(&ro);
        let tm = tree.marshal();
        assert_eq!(tm.children.len(), 1);
        let back = tm.make_tree(ro.clone()).unwrap();
        assert!(back.equal(&tree));
        assert_eq!(back.root().aggregate, tree.root().aggregate);
    }

    #[test]
    fn marshal_needs_matching_roster() {
        let ro = roster(3);
        let tree = star(&ro);
        let other = Arc::new(Roster::new(ro.list.clone()));
        assert!(matches!(
            tree.marshal().make_tree(other),
            Err(OverlayError::RosterMismatch { .. })
        ));
    }

    #[test]
    fn marshal_rejects_unknown_identity() {
        let ro = roster(3);
        let mut tm = star(&ro).marshal();
        tm.children[0].children[1].server_identity_id = ServerIdentityId::random();
        assert!(matches!(
            tm.make_tree(ro),
            Err(OverlayError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn connected_to_parent_and_children() {
        let ro = roster(3);
        let tree = star(&ro);
        let root = tree.root().id;
        let leaf = tree.list()[1].id;
        assert!(tree.is_connected_to(&root, &ro.list[1]));
        assert!(tree.is_connected_to(&leaf, &ro.list[0]));
        assert!(!tree.is_connected_to(&leaf, &ro.list[2]));
    }

    #[test]
    fn dump_mentions_every_node() {
        let ro = roster(3);
        let tree = star(&ro);
        let dump = tree.dump();
        assert_eq!(dump.lines().count(), 4);
        assert!(dump.contains("is root"));
        assert!(tree.uses_list());
    }
}
