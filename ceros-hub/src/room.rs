//! Room registry: room id → member connections.
//!
//! Rooms exist only while they have members. They are created on first join
//! and pruned on the transition to zero members, so the registry never holds
//! an empty set.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;

const DIRECT_PREFIX: &str = "dm_";
const GROUP_PREFIX: &str = "group_";
const COMMITTEE_PREFIX: &str = "committee_";

/// Opaque room key. Callers own the naming convention; the constructors
/// below are the conventions the chat clients use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Classification derived from the room id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Direct,
    Group,
    Committee,
    Other,
}

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Direct room for two users. Ids are ordered so both sides agree.
    ///
    /// `None` if either id is not a valid direct participant.
    pub fn direct(a: &str, b: &str) -> Option<Self> {
        if !is_direct_id(a) || !is_direct_id(b) {
            return None;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        Some(Self(format!("{DIRECT_PREFIX}{lo}_{hi}")))
    }

    pub fn group(group_id: &str) -> Self {
        Self(format!("{GROUP_PREFIX}{group_id}"))
    }

    pub fn committee(committee_id: &str) -> Self {
        Self(format!("{COMMITTEE_PREFIX}{committee_id}"))
    }

    pub fn kind(&self) -> RoomKind {
        if self.0.starts_with(DIRECT_PREFIX) {
            RoomKind::Direct
        } else if self.0.starts_with(GROUP_PREFIX) {
            RoomKind::Group
        } else if self.0.starts_with(COMMITTEE_PREFIX) {
            RoomKind::Committee
        } else {
            RoomKind::Other
        }
    }

    /// Whether `user` is one of the two participants of a direct room.
    ///
    /// A direct room names exactly two `_`-free ids; anything else admits
    /// nobody.
    pub fn is_direct_participant(&self, user: &str) -> bool {
        let Some((a, b)) = self
            .0
            .strip_prefix(DIRECT_PREFIX)
            .and_then(|pair| pair.split_once('_'))
        else {
            return false;
        };
        is_direct_id(a) && is_direct_id(b) && (user == a || user == b)
    }

    /// Committee id of a committee room.
    pub fn committee_id(&self) -> Option<&str> {
        self.0.strip_prefix(COMMITTEE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Ids usable in a direct room name: non-empty, no `_` separator.
pub fn is_direct_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('_')
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Membership sets keyed by room.
///
/// Not synchronized: the hub actor is the only owner.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room on first join.
    ///
    /// Returns `false` if the connection was already a member.
    pub fn join(&mut self, room: RoomId, connection: ConnectionId) -> bool {
        let members = self.rooms.entry(room).or_default();
        members.insert(connection)
    }

    /// Remove a member, pruning the room when it empties.
    ///
    /// Returns `false` if the connection was not a member.
    pub fn leave(&mut self, room: &RoomId, connection: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            self.rooms.remove(room);
            log::debug!("Room {room} removed (empty)");
        }
        removed
    }

    pub fn members(&self, room: &str) -> Option<&HashSet<ConnectionId>> {
        self.rooms.get(room)
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn is_member(&self, room: &str, connection: ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&connection))
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }
}
