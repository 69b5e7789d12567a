use std::collections::{HashMap, HashSet};

/// Named sets of identities used for `GROUP:` fan-out.
///
/// Rooms are created on first join and never deleted; an empty room simply
/// has no members.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: HashMap<String, HashSet<String>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, room: &str, identity: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(identity.to_string());
    }

    pub fn leave(&mut self, room: &str, identity: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(identity);
        }
    }

    pub fn members_of(&self, room: &str) -> HashSet<String> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_idempotent() {
        let mut rooms = RoomMembership::new();
        rooms.join("team", "u1");
        let once = rooms.members_of("team");
        rooms.join("team", "u1");
        assert_eq!(rooms.members_of("team"), once);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn leave_of_non_member_is_noop() {
        let mut rooms = RoomMembership::new();
        rooms.join("team", "u1");
        rooms.leave("team", "u2");
        rooms.leave("nowhere", "u1");

        assert_eq!(rooms.members_of("team"), HashSet::from(["u1".to_string()]));
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn unknown_room_has_no_members() {
        let rooms = RoomMembership::new();
        assert!(rooms.members_of("ghost").is_empty());
    }

    #[test]
    fn emptied_room_stays_inert() {
        let mut rooms = RoomMembership::new();
        rooms.join("team", "u1");
        rooms.leave("team", "u1");
        assert!(rooms.members_of("team").is_empty());
        assert_eq!(rooms.room_count(), 1);
    }
}
