//! Physics ownership arbitration.
//!
//! Exactly one client authors an object's transform at a time. Ownership
//! changes carry the time they were taken; the most recent change wins and a
//! tie keeps whatever is already held locally.

use super::object::WorldObject;
use super::{ChangedFlags, ClientId, DirtyFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipDecision {
    Adopted,
    KeptLocal,
}

/// Last-writer-wins on the change timestamp. Strictly newer wins.
pub fn arbitrate(local_change_time: f64, incoming_change_time: f64) -> OwnershipDecision {
    if incoming_change_time > local_change_time {
        OwnershipDecision::Adopted
    } else {
        OwnershipDecision::KeptLocal
    }
}

/// Whether `sender` may write the transform of an object owned by `owner`.
pub fn may_author_transform(owner: ClientId, sender: ClientId) -> bool {
    owner.is_none() || owner == sender
}

impl WorldObject {
    /// Takes ownership locally and queues the change for broadcast.
    pub fn claim_physics_ownership(&mut self, client: ClientId, now: f64) {
        if self.physics_owner_id != client {
            self.changed_flags |= ChangedFlags::PHYSICS_OWNER;
        }
        self.physics_owner_id = client;
        self.last_ownership_change_time = now;
        self.from_local_dirty |= DirtyFlags::PHYSICS_OWNERSHIP;
        log::debug!("[ownership] client {client} claimed object {} at {now}", self.uid);
    }

    /// Applies an ownership change received from elsewhere.
    pub fn apply_ownership_change(&mut self, owner: ClientId, change_time: f64) -> OwnershipDecision {
        let decision = arbitrate(self.last_ownership_change_time, change_time);
        match decision {
            OwnershipDecision::Adopted => {
                if self.physics_owner_id != owner {
                    self.changed_flags |= ChangedFlags::PHYSICS_OWNER;
                    self.from_remote_dirty |= DirtyFlags::PHYSICS_OWNERSHIP;
                }
                self.physics_owner_id = owner;
                self.last_ownership_change_time = change_time;
            }
            OwnershipDecision::KeptLocal => {
                log::debug!(
                    "[ownership] object {} kept owner {} (local {} >= incoming {change_time})",
                    self.uid,
                    self.physics_owner_id,
                    self.last_ownership_change_time
                );
            }
        }
        decision
    }

    pub fn may_author_transform(&self, sender: ClientId) -> bool {
        may_author_transform(self.physics_owner_id, sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_change_wins_in_either_arrival_order() {
        let mut a = WorldObject::default();
        a.apply_ownership_change(ClientId(1), 10.0);
        a.apply_ownership_change(ClientId(2), 20.0);

        let mut b = WorldObject::default();
        b.apply_ownership_change(ClientId(2), 20.0);
        b.apply_ownership_change(ClientId(1), 10.0);

        assert_eq!(a.physics_owner_id, ClientId(2));
        assert_eq!(b.physics_owner_id, ClientId(2));
        assert_eq!(a.last_ownership_change_time, 20.0);
        assert_eq!(b.last_ownership_change_time, 20.0);
    }

    #[test]
    fn equal_timestamp_keeps_local_owner() {
        let mut ob = WorldObject::default();
        ob.apply_ownership_change(ClientId(1), 10.0);
        assert_eq!(
            ob.apply_ownership_change(ClientId(2), 10.0),
            OwnershipDecision::KeptLocal
        );
        assert_eq!(ob.physics_owner_id, ClientId(1));
    }

    #[test]
    fn adopting_new_owner_raises_changed_flag() {
        let mut ob = WorldObject::default();
        ob.apply_ownership_change(ClientId(4), 1.0);
        assert!(ob.changed_flags.contains(ChangedFlags::PHYSICS_OWNER));
        assert!(ob.from_remote_dirty.contains(DirtyFlags::PHYSICS_OWNERSHIP));
    }

    #[test]
    fn claim_marks_ownership_for_broadcast() {
        let mut ob = WorldObject::default();
        ob.claim_physics_ownership(ClientId(3), 2.5);
        assert_eq!(ob.physics_owner_id, ClientId(3));
        assert!(ob.from_local_dirty.contains(DirtyFlags::PHYSICS_OWNERSHIP));
        assert!(!ob.may_author_transform(ClientId(4)));
        assert!(ob.may_author_transform(ClientId(3)));
    }

    #[test]
    fn unowned_object_accepts_any_author() {
        assert!(may_author_transform(ClientId::NONE, ClientId(8)));
    }
}
