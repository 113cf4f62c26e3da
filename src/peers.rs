//! # Peer Lists
//!
//! [`PeerList`] is an ordered, duplicate-free container of [`Peer`]s. Order is
//! meaningful to callers (buckets keep it freshest-first), so every mutator
//! preserves the relative order of untouched elements.
//!
//! Membership is tracked in a hash index keyed by identifier, which gives
//! O(1) containment checks. Bootstrap peers carry no identifier: they are
//! never "contained" and are always appended, since they never compare equal
//! to anything.

use std::collections::HashSet;

use crate::identity::Identifier;
use crate::peer::Peer;

/// Positional access outside `[0, len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfRange {
    pub index: usize,
    pub len: usize,
}

impl std::fmt::Display for IndexOutOfRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index {} out of range for peer list of length {}", self.index, self.len)
    }
}

impl std::error::Error for IndexOutOfRange {}

#[derive(Clone, Debug, Default)]
pub struct PeerList {
    peers: Vec<Peer>,
    index: HashSet<Identifier>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list around a backing vector used verbatim.
    ///
    /// No de-duplication happens here: callers must only pass vectors already
    /// known to be duplicate-free (slices or filtered views of a list).
    pub(crate) fn from_unique(peers: Vec<Peer>) -> Self {
        let index = peers.iter().filter_map(|p| p.id().copied()).collect();
        Self { peers, index }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Append every peer not already present. Duplicates are ignored.
    pub fn add<I>(&mut self, peers: I) -> &mut Self
    where
        I: IntoIterator<Item = Peer>,
    {
        for peer in peers {
            self.add_peer(peer);
        }
        self
    }

    /// Append `peer` unless an equal one is present. Returns whether it was added.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        self.insert_at(self.peers.len(), peer)
    }

    /// Insert at `position` (clamped to `len`) unless an equal peer is present.
    pub(crate) fn insert_at(&mut self, position: usize, peer: Peer) -> bool {
        if let Some(id) = peer.id()
            && !self.index.insert(*id)
        {
            return false;
        }
        let position = position.min(self.peers.len());
        self.peers.insert(position, peer);
        true
    }

    /// Remove every element equal to any of `peers`. Absent peers are no-ops.
    pub fn remove<'a, I>(&mut self, peers: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a Peer>,
    {
        let doomed: HashSet<Identifier> = peers
            .into_iter()
            .filter_map(|p| p.id().copied())
            .filter(|id| self.index.contains(id))
            .collect();
        if doomed.is_empty() {
            return self;
        }
        self.peers
            .retain(|p| p.id().is_none_or(|id| !doomed.contains(id)));
        self.index.retain(|id| !doomed.contains(id));
        self
    }

    /// Remove and return the element equal to `peer`, if any.
    pub fn remove_peer(&mut self, peer: &Peer) -> Option<Peer> {
        let position = self.find(peer)?;
        Some(self.remove_at(position))
    }

    /// Remove and return the element at `position`. The only way to drop a
    /// specific bootstrap peer, since those never match by identity.
    pub fn remove_index(&mut self, position: usize) -> Result<Peer, IndexOutOfRange> {
        if position >= self.peers.len() {
            return Err(IndexOutOfRange {
                index: position,
                len: self.peers.len(),
            });
        }
        Ok(self.remove_at(position))
    }

    /// Keep only the elements for which `keep` returns true, in order.
    pub fn retain<P>(&mut self, mut keep: P) -> &mut Self
    where
        P: FnMut(&Peer) -> bool,
    {
        let index = &mut self.index;
        self.peers.retain(|peer| {
            let kept = keep(peer);
            if !kept && let Some(id) = peer.id() {
                index.remove(id);
            }
            kept
        });
        self
    }

    pub(crate) fn remove_at(&mut self, position: usize) -> Peer {
        let removed = self.peers.remove(position);
        if let Some(id) = removed.id() {
            self.index.remove(id);
        }
        removed
    }

    pub(crate) fn pop_back(&mut self) -> Option<Peer> {
        let removed = self.peers.pop()?;
        if let Some(id) = removed.id() {
            self.index.remove(id);
        }
        Some(removed)
    }

    /// Relocate the element at `old` to `new`, shifting the others.
    pub fn move_peer(&mut self, old: usize, new: usize) -> Result<(), IndexOutOfRange> {
        let len = self.peers.len();
        if new >= len {
            return Err(IndexOutOfRange { index: new, len });
        }
        if old >= len {
            return Err(IndexOutOfRange { index: old, len });
        }
        let peer = self.peers.remove(old);
        self.peers.insert(new, peer);
        Ok(())
    }

    pub fn sort_by<F>(&mut self, compare: F) -> &mut Self
    where
        F: FnMut(&Peer, &Peer) -> std::cmp::Ordering,
    {
        self.peers.sort_by(compare);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn get(&self, position: usize) -> Result<&Peer, IndexOutOfRange> {
        self.peers.get(position).ok_or(IndexOutOfRange {
            index: position,
            len: self.peers.len(),
        })
    }

    /// The stored element equal to `peer`, if any.
    pub fn lookup(&self, peer: &Peer) -> Option<&Peer> {
        self.find(peer).map(|i| &self.peers[i])
    }

    pub fn front(&self) -> Option<&Peer> {
        self.peers.first()
    }

    pub fn back(&self) -> Option<&Peer> {
        self.peers.last()
    }

    /// Position of the element equal to `peer`.
    pub fn find(&self, peer: &Peer) -> Option<usize> {
        let id = peer.id()?;
        if !self.index.contains(id) {
            return None;
        }
        self.peers.iter().position(|p| p.id() == Some(id))
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        peer.id().is_some_and(|id| self.index.contains(id))
    }

    pub fn contains_id(&self, id: &Identifier) -> bool {
        self.index.contains(id)
    }

    /// True iff every one of `peers` is present (vacuously true when empty).
    pub fn contains_all<'a, I>(&self, peers: I) -> bool
    where
        I: IntoIterator<Item = &'a Peer>,
    {
        peers.into_iter().all(|p| self.contains(p))
    }

    /// Set equality: mutual containment, order ignored.
    pub fn set_eq(&self, other: &PeerList) -> bool {
        self.contains_all(other) && other.contains_all(self)
    }

    /// `(address, identifier)` pairs in list order.
    pub fn triples(&self) -> Vec<(String, String)> {
        self.peers.iter().map(Peer::triple).collect()
    }

    pub fn as_slice(&self) -> &[Peer] {
        &self.peers
    }

    pub fn into_vec(self) -> Vec<Peer> {
        self.peers
    }

    // ========================================================================
    // Set algebra
    // ========================================================================

    /// `self ∪ peers`. Existing elements keep their positions; new ones follow.
    pub fn union<I>(&self, peers: I) -> PeerList
    where
        I: IntoIterator<Item = Peer>,
    {
        let mut out = self.clone();
        out.add(peers);
        out
    }

    /// `self \ peers`. The receiver is left untouched.
    pub fn difference<'a, I>(&self, peers: I) -> PeerList
    where
        I: IntoIterator<Item = &'a Peer>,
    {
        let mut out = self.clone();
        out.remove(peers);
        out
    }

    /// The first `n` elements.
    pub fn first(&self, n: usize) -> PeerList {
        let end = n.min(self.peers.len());
        Self::from_unique(self.peers[..end].to_vec())
    }

    /// The first `n` elements satisfying `predicate`, scanning front to back and
    /// stopping as soon as `n` matches are found.
    pub fn first_matching<P>(&self, n: usize, mut predicate: P) -> PeerList
    where
        P: FnMut(&Peer) -> bool,
    {
        let picked: Vec<Peer> = self
            .peers
            .iter()
            .filter(|p| predicate(p))
            .take(n)
            .cloned()
            .collect();
        Self::from_unique(picked)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    pub fn iter(&self) -> std::slice::Iter<'_, Peer> {
        self.peers.iter()
    }

    pub fn for_each<F>(&self, f: F) -> &Self
    where
        F: FnMut(&Peer),
    {
        self.peers.iter().for_each(f);
        self
    }

    pub fn map<T, F>(&self, f: F) -> Vec<T>
    where
        F: FnMut(&Peer) -> T,
    {
        self.peers.iter().map(f).collect()
    }

    pub fn fold<T, F>(&self, init: T, f: F) -> T
    where
        F: FnMut(T, &Peer) -> T,
    {
        self.peers.iter().fold(init, f)
    }

    pub fn filter<P>(&self, mut predicate: P) -> PeerList
    where
        P: FnMut(&Peer) -> bool,
    {
        Self::from_unique(self.peers.iter().filter(|p| predicate(p)).cloned().collect())
    }

    pub fn any<P>(&self, predicate: P) -> bool
    where
        P: FnMut(&Peer) -> bool,
    {
        self.peers.iter().any(predicate)
    }

    pub fn all<P>(&self, predicate: P) -> bool
    where
        P: FnMut(&Peer) -> bool,
    {
        self.peers.iter().all(predicate)
    }
}

impl FromIterator<Peer> for PeerList {
    fn from_iter<I: IntoIterator<Item = Peer>>(iter: I) -> Self {
        let mut list = PeerList::new();
        list.add(iter);
        list
    }
}

impl Extend<Peer> for PeerList {
    fn extend<I: IntoIterator<Item = Peer>>(&mut self, iter: I) {
        self.add(iter);
    }
}

impl IntoIterator for PeerList {
    type Item = Peer;
    type IntoIter = std::vec::IntoIter<Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

impl<'a> IntoIterator for &'a PeerList {
    type Item = &'a Peer;
    type IntoIter = std::slice::Iter<'a, Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

impl std::fmt::Display for PeerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{peer}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> Peer {
        Peer::with_id(format!("10.0.0.{n}:4000"), Identifier::from_bytes([n; 20]))
    }

    fn ids(list: &PeerList) -> Vec<u8> {
        list.map(|p| p.id().unwrap().as_bytes()[0])
    }

    #[test]
    fn add_ignores_duplicates() {
        let mut list = PeerList::new();
        list.add([peer(1), peer(2), peer(1), peer(3), peer(2)]);
        assert_eq!(ids(&list), vec![1, 2, 3]);
        assert!(!list.add_peer(peer(3)));
        assert!(list.add_peer(peer(4)));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn bootstrap_peers_are_always_appended() {
        let mut list = PeerList::new();
        assert!(list.add_peer(Peer::bootstrap("a:1")));
        assert!(list.add_peer(Peer::bootstrap("a:1")));
        assert_eq!(list.len(), 2);
        assert!(!list.contains(&Peer::bootstrap("a:1")));
        assert_eq!(list.find(&Peer::bootstrap("a:1")), None);
    }

    #[test]
    fn remove_drops_matching_identifiers_only() {
        let mut list: PeerList = (1..=5).map(peer).collect();
        let other_address = Peer::with_id("elsewhere:1", Identifier::from_bytes([2; 20]));
        list.remove([&other_address, &peer(4), &peer(9)]);
        assert_eq!(ids(&list), vec![1, 3, 5]);
        assert!(!list.contains(&peer(2)));

        assert_eq!(list.remove_peer(&peer(3)).map(|p| p.address().to_string()), Some("10.0.0.3:4000".into()));
        assert!(list.remove_peer(&peer(3)).is_none());
        assert_eq!(ids(&list), vec![1, 5]);
    }

    #[test]
    fn bootstrap_peers_are_removed_by_position_or_predicate() {
        let mut list = PeerList::new();
        list.add([peer(1), Peer::bootstrap("boot:1"), peer(2), Peer::bootstrap("boot:2")]);

        let boot = Peer::bootstrap("boot:1");
        list.remove([&boot]);
        assert!(list.remove_peer(&boot).is_none());
        assert_eq!(list.len(), 4);

        let taken = list.remove_index(1).unwrap();
        assert_eq!(taken.address(), "boot:1");
        assert_eq!(list.remove_index(3), Err(IndexOutOfRange { index: 3, len: 3 }));

        list.retain(|p| !p.is_bootstrap());
        assert_eq!(ids(&list), vec![1, 2]);

        list.retain(|p| p.id() != Some(&Identifier::from_bytes([1; 20])));
        assert_eq!(ids(&list), vec![2]);
        assert!(!list.contains(&peer(1)));
        assert!(list.add_peer(peer(1)));
    }

    #[test]
    fn move_relocates_and_checks_bounds() {
        let mut list: PeerList = (1..=4).map(peer).collect();
        list.move_peer(3, 0).unwrap();
        assert_eq!(ids(&list), vec![4, 1, 2, 3]);
        list.move_peer(0, 2).unwrap();
        assert_eq!(ids(&list), vec![1, 2, 4, 3]);
        assert_eq!(list.move_peer(0, 4), Err(IndexOutOfRange { index: 4, len: 4 }));
        assert_eq!(list.move_peer(7, 0), Err(IndexOutOfRange { index: 7, len: 4 }));
        assert_eq!(ids(&list), vec![1, 2, 4, 3]);
    }

    #[test]
    fn get_reports_out_of_range() {
        let list: PeerList = (1..=2).map(peer).collect();
        assert_eq!(list.get(1).unwrap(), &peer(2));
        assert_eq!(list.get(2).unwrap_err(), IndexOutOfRange { index: 2, len: 2 });
    }

    #[test]
    fn find_and_contains() {
        let list: PeerList = (1..=3).map(peer).collect();
        assert_eq!(list.find(&peer(2)), Some(1));
        assert_eq!(list.find(&peer(7)), None);
        assert!(list.contains(&peer(3)));
        assert!(list.contains_all(&[peer(1), peer(3)]));
        assert!(!list.contains_all(&[peer(1), peer(8)]));
        assert!(list.contains_all(std::iter::empty::<&Peer>()));
        assert_eq!(list.lookup(&peer(1)).map(Peer::address), Some("10.0.0.1:4000"));
    }

    #[test]
    fn union_keeps_existing_order() {
        let list: PeerList = [peer(3), peer(1)].into_iter().collect();
        let merged = list.union([peer(2), peer(1), peer(4)]);
        assert_eq!(ids(&merged), vec![3, 1, 2, 4]);
        assert_eq!(ids(&list), vec![3, 1]);
    }

    #[test]
    fn difference_leaves_original_untouched() {
        let list: PeerList = (1..=4).map(peer).collect();
        let diff = list.difference(&[peer(2), peer(4)]);
        assert_eq!(ids(&diff), vec![1, 3]);
        assert_eq!(list.len(), 4);
        assert!(diff.contains_id(&Identifier::from_bytes([3; 20])));
        assert!(!diff.contains_id(&Identifier::from_bytes([2; 20])));
    }

    #[test]
    fn set_equality_ignores_order() {
        let a: PeerList = (1..=3).map(peer).collect();
        let b: PeerList = [peer(3), peer(1), peer(2)].into_iter().collect();
        let c: PeerList = (1..=2).map(peer).collect();
        assert!(a.set_eq(&b));
        assert!(!a.set_eq(&c));
        assert!(!c.set_eq(&a));
    }

    #[test]
    fn first_slices_the_front() {
        let list: PeerList = (1..=5).map(peer).collect();
        assert_eq!(ids(&list.first(2)), vec![1, 2]);
        assert_eq!(ids(&list.first(9)), vec![1, 2, 3, 4, 5]);
        assert!(list.first(0).is_empty());
    }

    #[test]
    fn first_matching_stops_early() {
        let list: PeerList = (1..=8).map(peer).collect();
        let mut calls = 0;
        let evens = list.first_matching(2, |p| {
            calls += 1;
            p.id().unwrap().as_bytes()[0] % 2 == 0
        });
        assert_eq!(ids(&evens), vec![2, 4]);
        assert_eq!(calls, 4);
    }

    #[test]
    fn iteration_primitives() {
        let list: PeerList = (1..=4).map(peer).collect();
        let total = list.fold(0u32, |acc, p| acc + p.id().unwrap().as_bytes()[0] as u32);
        assert_eq!(total, 10);
        assert!(list.any(|p| p.address().ends_with(".3:4000")));
        assert!(list.all(|p| !p.is_bootstrap()));
        assert_eq!(ids(&list.filter(|p| p.id().unwrap().as_bytes()[0] > 2)), vec![3, 4]);

        let mut seen = Vec::new();
        list.for_each(|p| seen.push(p.address().to_string()));
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn uniqueness_survives_mixed_operations() {
        let mut list = PeerList::new();
        for round in 0..5u8 {
            list.add((0..6).map(|n| peer(n + round)));
            list.remove([&peer(round)]);
            list.extend([peer(round), peer(round + 1)]);
        }
        let mut seen = HashSet::new();
        assert!(list.all(|p| seen.insert(*p.id().unwrap())));
    }
}
