//! Tree shapes generated from a roster.

use std::collections::VecDeque;
use std::sync::Arc;

use canopy_network::ServerIdentity;

use crate::roster::Roster;
use crate::tree::{Tree, TreeBuilder};

impl Roster {
    /// Breadth-first tree where every inner node has `n` children, rooted
    /// at `root` (or the first member). Every member appears once, in
    /// roster order starting after the root.
    pub fn generate_nary_tree_with_root(&self, n: usize, root: Option<&ServerIdentity>) -> Option<Tree> {
        if self.is_empty() {
            return None;
        }
        let root_index = match root {
            Some(si) => self.search(&si.id)?.0,
            None => 0,
        };
        let len = self.len();
        if n == 0 && len > 1 {
            return None;
        }

        let mut builder = TreeBuilder::new(Arc::new(self.clone()), root_index).ok()?;
        let mut parents: VecDeque<usize> = VecDeque::from([0]);
        let mut children: Vec<usize> = Vec::new();
        for i in 1..len {
            let index = (i + root_index) % len;
            if builder.child_count(parents[0]) == n {
                parents.pop_front();
            }
            if parents.is_empty() {
                parents = children.drain(..).collect();
            }
            let child = builder.add_child(parents[0], index).ok()?;
            children.push(child);
        }
        builder.build().ok()
    }

    pub fn generate_nary_tree(&self, n: usize) -> Option<Tree> {
        self.generate_nary_tree_with_root(n, None)
    }

    pub fn generate_binary_tree(&self) -> Option<Tree> {
        self.generate_nary_tree(2)
    }

    /// The first member is the root, every other member a direct child.
    pub fn generate_star(&self) -> Option<Tree> {
        self.generate_nary_tree(self.len().saturating_sub(1))
    }

    /// Tree of `nodes` positions with fan-out up to `n`, reusing members
    /// when `nodes` exceeds the roster size.
    ///
    /// Children are placed on a different host than their parent when the
    /// roster allows it. When `nodes` equals the roster size every member is
    /// used exactly once.
    pub fn generate_big_nary_tree(&self, n: usize, nodes: usize) -> Option<Tree> {
        if self.is_empty() || nodes == 0 || (n == 0 && nodes > 1) {
            return None;
        }
        let len = self.len();
        let use_all = len == nodes;
        let mut used = vec![false; len];
        used[0] = true;

        let mut builder = TreeBuilder::new(Arc::new(self.clone()), 0).ok()?;
        let mut level: Vec<usize> = vec![0];
        let mut total = 1;
        let mut ro_index = 1 % len;
        let host = |i: usize| self.list[i].address.host();

        while total < nodes {
            let mut next_level = Vec::with_capacity(level.len() * n);
            for (i, &parent) in level.iter().enumerate() {
                let children = ((nodes - total) * (i + 1) / level.len()).min(n);
                let parent_host = host(builder.roster_index(parent)?);
                for _ in 0..children {
                    let mut child_host = host(ro_index);
                    let first = ro_index;
                    let mut avoid_host = true;
                    while (avoid_host && child_host == parent_host && len > 1)
                        || (use_all && used[ro_index])
                    {
                        ro_index = (ro_index + 1) % len;
                        if use_all && used[ro_index] {
                            if ro_index == first {
                                avoid_host = false;
                            }
                            continue;
                        }
                        if ro_index == first {
                            break;
                        }
                        child_host = host(ro_index);
                    }
                    let child = builder.add_child(parent, ro_index).ok()?;
                    used[ro_index] = true;
                    ro_index = (ro_index + 1) % len;
                    total += 1;
                    next_level.push(child);
                }
            }
            level = next_level;
        }
        builder.build().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_network::{Address, KeyPair};

    fn roster_on(hosts: &[&str]) -> Roster {
        let list = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| {
                ServerIdentity::new(
                    KeyPair::from_seed(i as u64).public,
                    Address::tcp(*host, 2000 + 2 * i as u16),
                )
            })
            .collect();
        Roster::new(list)
    }

    fn roster(n: usize) -> Roster {
        roster_on(&vec!["127.0.0.1"; n])
    }

    #[test]
    fn binary_tree_shapes() {
        for (size, binary) in [(1, true), (2, false), (3, true), (4, false), (7, true)] {
            let tree = roster(size).generate_binary_tree().unwrap();
            assert_eq!(tree.size(), size);
            assert_eq!(tree.is_binary(), binary, "size {size}");
            assert!(tree.uses_list());
        }
    }

    #[test]
    fn nary_tree_is_breadth_first() {
        let ro = roster(7);
        let tree = ro.generate_nary_tree(3).unwrap();
        let root = tree.root();
        assert_eq!(root.children.len(), 3);
        let first: Vec<usize> = tree.children_of(root).iter().map(|c| c.roster_index).collect();
        assert_eq!(first, vec![1, 2, 3]);
        let c1 = tree.children_of(root)[0];
        let second: Vec<usize> = tree.children_of(c1).iter().map(|c| c.roster_index).collect();
        assert_eq!(second, vec![4, 5, 6]);
    }

    #[test]
    fn nary_tree_with_root_rotates() {
        let ro = roster(4);
        let tree = ro.generate_nary_tree_with_root(2, Some(&ro.list[2])).unwrap();
        assert_eq!(tree.root().roster_index, 2);
        let first: Vec<usize> = tree
            .children_of(tree.root())
            .iter()
            .map(|c| c.roster_index)
            .collect();
        assert_eq!(first, vec![3, 0]);
        assert!(tree.uses_list());
    }

    #[test]
    fn star_has_everyone_under_root() {
        let tree = roster(5).generate_star().unwrap();
        assert_eq!(tree.root().children.len(), 4);
        assert!(tree.list()[1..].iter().all(|n| n.is_leaf()));
        assert_eq!(roster(1).generate_star().unwrap().size(), 1);
    }

    #[test]
    fn degenerate_inputs() {
        assert!(Roster::new(Vec::new()).generate_binary_tree().is_none());
        assert!(roster(3).generate_nary_tree(0).is_none());
        assert!(roster(3).generate_big_nary_tree(2, 0).is_none());
    }

    #[test]
    fn big_tree_single_node_is_root_only() {
        let tree = roster(2).generate_big_nary_tree(2, 1).unwrap();
        assert_eq!(tree.size(), 1);
        assert!(tree.is_binary());
    }

    #[test]
    fn big_tree_uses_everyone_once_when_sizes_match() {
        let ro = roster(10);
        let tree = ro.generate_big_nary_tree(3, 10).unwrap();
        assert_eq!(tree.size(), 10);
        let mut seen: Vec<usize> = tree.list().iter().map(|n| n.roster_index).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);
        assert!(tree.list().iter().all(|n| n.children.len() <= 3));
    }

    #[test]
    fn big_tree_reuses_members() {
        let ro = roster(3);
        let tree = ro.generate_big_nary_tree(2, 7).unwrap();
        assert_eq!(tree.size(), 7);
        assert!(tree.is_binary());
    }

    #[test]
    fn big_tree_avoids_parent_host() {
        let ro = roster_on(&["10.0.0.1", "10.0.0.1", "10.0.0.2", "10.0.0.2", "10.0.0.3", "10.0.0.3"]);
        let tree = ro.generate_big_nary_tree(2, 6).unwrap();
        for node in tree.list() {
            if let Some(parent) = tree.parent_of(node) {
                assert_ne!(
                    node.server_identity.address.host(),
                    parent.server_identity.address.host()
                );
            }
        }
    }
}
