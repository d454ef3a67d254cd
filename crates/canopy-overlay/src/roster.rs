use canopy_network::{define_id, PublicKey, ServerIdentity, ServerIdentityId, ServerIdentityToml};
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};

use crate::OverlayError;

define_id!(
    /// Unique id of a roster, chosen fresh at creation.
    RosterId
);

/// Ordered list of servers forming the universe of a protocol run.
///
/// The id is random: two rosters with the same members created at
/// different times are different rosters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub id: RosterId,
    pub list: Vec<ServerIdentity>,
    /// Sum of every member's public key.
    pub aggregate: PublicKey,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        Self::with_id(RosterId::random(), list)
    }

    /// Rebuild a roster under a known id, recomputing its aggregate.
    pub fn with_id(id: RosterId, list: Vec<ServerIdentity>) -> Self {
        let aggregate = list.iter().map(|si| si.public).sum();
        Self { id, list, aggregate }
    }

    /// The empty roster sent when a requested roster is unknown.
    pub fn empty() -> Self {
        Self {
            id: RosterId::NIL,
            list: Vec::new(),
            aggregate: PublicKey::identity(),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Position and entry of the identity with the given id.
    pub fn search(&self, id: &ServerIdentityId) -> Option<(usize, &ServerIdentity)> {
        self.list.iter().enumerate().find(|(_, si)| si.id == *id)
    }

    pub fn get(&self, index: usize) -> Option<&ServerIdentity> {
        self.list.get(index)
    }

    pub fn contains(&self, id: &ServerIdentityId) -> bool {
        self.search(id).is_some()
    }

    pub fn publics(&self) -> Vec<PublicKey> {
        self.list.iter().map(|si| si.public).collect()
    }

    /// A new roster with `root` swapped to the front.
    pub fn new_roster_with_root(&self, root: &ServerIdentity) -> Option<Roster> {
        let (index, _) = self.search(&root.id)?;
        let mut list = self.list.clone();
        list.swap(0, index);
        Some(Roster::new(list))
    }

    pub fn random_server_identity(&self) -> Option<&ServerIdentity> {
        self.list.choose(&mut rand::rng())
    }

    /// A new roster starting with `root`, followed by `n` other members
    /// picked at random.
    pub fn random_subset(&self, root: &ServerIdentity, n: usize) -> Roster {
        let mut others: Vec<&ServerIdentity> =
            self.list.iter().filter(|si| si.id != root.id).collect();
        others.shuffle(&mut rand::rng());
        let mut list = vec![root.clone()];
        list.extend(others.into_iter().take(n).cloned());
        Roster::new(list)
    }

    pub fn to_toml(&self) -> RosterToml {
        RosterToml {
            id: self.id,
            list: self.list.iter().map(ServerIdentity::to_toml).collect(),
        }
    }
}

/// A [`Roster`] as written in group files: ids and order are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterToml {
    pub id: RosterId,
    pub list: Vec<ServerIdentityToml>,
}

impl RosterToml {
    pub fn to_roster(&self) -> Result<Roster, OverlayError> {
        let list = self
            .list
            .iter()
            .map(|si| si.to_server_identity())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Roster::with_id(self.id, list))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, OverlayError> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String, OverlayError> {
        Ok(toml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_network::{Address, KeyPair};

    fn identities(n: u64) -> Vec<ServerIdentity> {
        (0..n)
            .map(|i| {
                ServerIdentity::new(
                    KeyPair::from_seed(i).public,
                    Address::tcp("127.0.0.1", 2000 + 2 * i as u16),
                )
            })
            .collect()
    }

    #[test]
    fn aggregate_is_sum_of_publics() {
        let list = identities(4);
        let roster = Roster::new(list.clone());
        let sum: PublicKey = list.iter().map(|si| si.public).sum();
        assert_eq!(roster.aggregate, sum);
        assert_eq!(roster.publics().len(), 4);
    }

    #[test]
    fn ids_are_fresh() {
        let list = identities(3);
        let a = Roster::new(list.clone());
        let b = Roster::new(list);
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_nil());
        assert!(Roster::empty().id.is_nil());
    }

    #[test]
    fn search_and_get() {
        let list = identities(3);
        let roster = Roster::new(list.clone());
        let (i, si) = roster.search(&list[2].id).unwrap();
        assert_eq!(i, 2);
        assert_eq!(si, &list[2]);
        assert_eq!(roster.get(1), Some(&list[1]));
        assert!(roster.get(3).is_none());
        assert!(roster.search(&ServerIdentityId::random()).is_none());
    }

    #[test]
    fn roster_with_root_swaps_first() {
        let list = identities(4);
        let roster = Roster::new(list.clone());
        let swapped = roster.new_roster_with_root(&list[2]).unwrap();
        assert_eq!(swapped.list[0], list[2]);
        assert_eq!(swapped.list[2], list[0]);
        assert_eq!(swapped.aggregate, roster.aggregate);
    }

    #[test]
    fn random_subset_starts_with_root() {
        let list = identities(6);
        let roster = Roster::new(list.clone());
        let sub = roster.random_subset(&list[3], 2);
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.list[0], list[3]);
        assert!(sub.list[1..].iter().all(|si| si.id != list[3].id));

        let all = roster.random_subset(&list[0], 100);
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn toml_roundtrip_keeps_id_and_order() {
        let roster = Roster::new(identities(3));
        let text = roster.to_toml().to_toml_string().unwrap();
        let back = RosterToml::from_toml_str(&text).unwrap().to_roster().unwrap();
        assert_eq!(back.id, roster.id);
        assert_eq!(back.list, roster.list);
        assert_eq!(back.aggregate, roster.aggregate);
    }
}
