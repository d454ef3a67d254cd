use std::sync::Arc;

use canopy_network::{decode, encode, Address, KeyPair, PublicKey, ServerIdentity};
use canopy_overlay::{Roster, Tree, TreeBuilder, TreeMarshal};
use proptest::prelude::*;

fn roster(n: usize) -> Arc<Roster> {
    let list = (0..n)
        .map(|i| {
            ServerIdentity::new(
                KeyPair::from_seed(i as u64).public,
                Address::local("127.0.0.1", 2000 + 2 * i as u16),
            )
        })
        .collect();
    Arc::new(Roster::new(list))
}

/// Roster size and, for every node after the root, its parent slot and its
/// roster index. Parents always come before their children.
fn arb_shape() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..6).prop_flat_map(|members| {
        let nodes = (0usize..20).prop_flat_map(move |extra| {
            (0..extra)
                .map(|i| (0..=i, 0..members))
                .collect::<Vec<_>>()
        });
        (Just(members), nodes)
    })
}

fn build(members: usize, shape: &[(usize, usize)]) -> Tree {
    let mut builder = TreeBuilder::new(roster(members), 0).unwrap();
    for &(parent, index) in shape {
        builder.add_child(parent, index).unwrap();
    }
    builder.build().unwrap()
}

fn subtree_sum(tree: &Tree, node: &canopy_overlay::TreeNode) -> PublicKey {
    tree.children_of(node)
        .into_iter()
        .fold(node.server_identity.public, |acc, c| acc + subtree_sum(tree, c))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Each node aggregates its own key and its whole subtree.
    #[test]
    fn aggregates_sum_subtrees((members, shape) in arb_shape()) {
        let tree = build(members, &shape);
        for node in tree.list() {
            prop_assert_eq!(node.aggregate, subtree_sum(&tree, node));
        }
        let all: PublicKey = tree.list().iter().map(|n| n.server_identity.public).sum();
        prop_assert_eq!(tree.root().aggregate, all);
    }

    #[test]
    fn roster_index_matches_identity((members, shape) in arb_shape()) {
        let tree = build(members, &shape);
        prop_assert_eq!(tree.size(), shape.len() + 1);
        prop_assert_eq!(tree.subtree_count(&tree.root().id), shape.len());
        for node in tree.list() {
            let si = tree.roster().get(node.roster_index).unwrap();
            prop_assert_eq!(si.id, node.server_identity.id);
            prop_assert_eq!(tree.search(&node.id).map(|n| n.id), Some(node.id));
            for child in tree.children_of(node) {
                prop_assert_eq!(child.parent, Some(node.id));
            }
        }
    }

    /// The wire form rebuilds the same tree, aggregates included.
    #[test]
    fn marshal_survives_the_wire((members, shape) in arb_shape()) {
        let tree = build(members, &shape);
        let bytes = encode(&tree.marshal()).unwrap();
        let tm: TreeMarshal = decode(&bytes).unwrap();
        let back = tm.make_tree(tree.roster().clone()).unwrap();
        prop_assert!(back.equal(&tree));
        for (a, b) in back.list().iter().zip(tree.list()) {
            prop_assert_eq!(a.aggregate, b.aggregate);
            prop_assert_eq!(a.parent, b.parent);
            prop_assert_eq!(a.roster_index, b.roster_index);
        }
    }

    /// Breadth-first fill: every member once, at most one inner node short
    /// of `n` children.
    #[test]
    fn nary_shape(members in 1usize..30, n in 1usize..5) {
        let tree = roster(members).generate_nary_tree(n).unwrap();
        prop_assert_eq!(tree.size(), members);
        prop_assert!(tree.uses_list());
        let partial = tree
            .list()
            .iter()
            .filter(|node| !node.children.is_empty() && node.children.len() != n)
            .count();
        prop_assert!(partial <= 1);
        prop_assert!(tree.list().iter().all(|node| node.children.len() <= n));
    }

    #[test]
    fn big_tree_has_requested_size(members in 1usize..8, nodes in 1usize..40, bf in 1usize..4) {
        let tree = roster(members).generate_big_nary_tree(bf, nodes).unwrap();
        prop_assert_eq!(tree.size(), nodes);
        prop_assert!(tree.list().iter().all(|node| node.children.len() <= bf));
        if nodes == members {
            prop_assert!(tree.uses_list());
        }
    }
}

#[test]
fn binary_trees_of_full_levels() {
    for members in [1, 3, 7, 15] {
        assert!(roster(members).generate_binary_tree().unwrap().is_binary());
    }
    for members in [2, 4, 6] {
        assert!(!roster(members).generate_binary_tree().unwrap().is_binary());
    }
    let lone = roster(3).generate_big_nary_tree(2, 1).unwrap();
    assert_eq!(lone.size(), 1);
    assert!(lone.is_binary());
}

#[test]
fn empty_roster_has_no_tree() {
    let empty = Roster::new(Vec::new());
    assert!(empty.generate_binary_tree().is_none());
    assert!(empty.generate_big_nary_tree(2, 3).is_none());
    assert!(TreeMarshal::empty().is_empty());
}
