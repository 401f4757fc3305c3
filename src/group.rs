//! The ordered peer directory for one round.
//!
//! A [Group] is an immutable, ordered list of peer identities. The order is
//! load-bearing: it fixes each peer's index, the shuffle pipeline (peer 0
//! collects submissions and shuffles first, peer N-1 broadcasts the common
//! view), and the reversed slot each peer's onion keys occupy.

use crate::crypto::ed25519::PublicKey;

/// An immutable ordered set of N >= 2 peers.
#[derive(Clone)]
pub struct Group {
    members: Vec<PublicKey>,
}

impl Group {
    /// Builds a group from an ordered list of peer identities.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two peers are supplied or any identity repeats.
    pub fn new(members: Vec<PublicKey>) -> Self {
        assert!(members.len() >= 2, "a shuffle needs at least two peers");
        for (i, member) in members.iter().enumerate() {
            assert!(
                !members[..i].contains(member),
                "group members must be distinct"
            );
        }
        Self { members }
    }

    /// Number of peers in the group.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false: a group holds at least two peers.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the index of `id`, or `None` for a non-member.
    pub fn index(&self, id: &PublicKey) -> Option<usize> {
        self.members.iter().position(|member| member == id)
    }

    /// Returns the identity at `index`.
    ///
    /// The identity is also the peer's envelope verification key.
    pub fn id(&self, index: usize) -> &PublicKey {
        &self.members[index]
    }

    /// Returns the peer before `id` in ring order, or `None` for the first.
    pub fn previous(&self, id: &PublicKey) -> Option<&PublicKey> {
        match self.index(id)? {
            0 => None,
            index => Some(&self.members[index - 1]),
        }
    }

    /// Returns the peer after `id` in ring order, or `None` for the last.
    pub fn next(&self, id: &PublicKey) -> Option<&PublicKey> {
        let index = self.index(id)?;
        self.members.get(index + 1)
    }

    /// Returns the slot the peer at `index` occupies in the onion key
    /// vectors.
    ///
    /// Slots run in reverse group order so that the vector can be applied
    /// front-to-back by the onion encryptor while peeling still proceeds in
    /// forward group order (peer 0's layer ends up outermost).
    pub fn onion_slot(&self, index: usize) -> usize {
        self.members.len() - 1 - index
    }

    /// Iterates the members in group order.
    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::PrivateKey;

    fn group(n: usize) -> Group {
        Group::new(
            (0..n)
                .map(|i| PrivateKey::from_seed(i as u64).public_key())
                .collect(),
        )
    }

    #[test]
    fn ring_order() {
        let group = group(3);
        let (a, b, c) = (
            group.id(0).clone(),
            group.id(1).clone(),
            group.id(2).clone(),
        );
        assert_eq!(group.index(&b), Some(1));
        assert_eq!(group.previous(&a), None);
        assert_eq!(group.previous(&c), Some(&b));
        assert_eq!(group.next(&b), Some(&c));
        assert_eq!(group.next(&c), None);
    }

    #[test]
    fn two_peer_ring() {
        let group = group(2);
        let (a, b) = (group.id(0).clone(), group.id(1).clone());
        assert_eq!(group.previous(&b), Some(&a));
        assert_eq!(group.next(&b), None);
    }

    #[test]
    fn onion_slots_reverse() {
        let group = group(4);
        assert_eq!(group.onion_slot(0), 3);
        assert_eq!(group.onion_slot(3), 0);
    }

    #[test]
    fn non_member_lookup() {
        let group = group(2);
        let outsider = PrivateKey::from_seed(99).public_key();
        assert_eq!(group.index(&outsider), None);
        assert_eq!(group.previous(&outsider), None);
    }

    #[test]
    #[should_panic(expected = "at least two peers")]
    fn singleton_rejected() {
        Group::new(vec![PrivateKey::from_seed(0).public_key()]);
    }

    #[test]
    #[should_panic(expected = "distinct")]
    fn duplicate_member_rejected() {
        let id = PrivateKey::from_seed(0).public_key();
        Group::new(vec![id.clone(), id]);
    }
}
