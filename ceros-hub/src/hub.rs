//! The hub: single owner of the connection set and the room registry.
//!
//! Architecture:
//! ```text
//! read pump A ──┐                         ┌──► outbound buffer A ──► write pump A
//! read pump B ──┼── HubCommand (mpsc) ──► Hub ─► outbound buffer B ──► write pump B
//! HTTP / other ─┘    one event stream      │  └► outbound buffer C ──► write pump C
//!                                          └── RoomRegistry
//! ```
//!
//! Every mutation (register, unregister, join, leave) and every broadcast is
//! applied by one task in the order the commands arrive, so a broadcast sent
//! after a join always reaches the new member. Fan-out never blocks: each
//! member's bounded buffer gets a `try_send`, and a full buffer evicts that
//! member through the same unregister path used for ordinary disconnects.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};

use crate::connection::{ConnectionId, UserId};
use crate::error::HubError;
use crate::protocol::{Envelope, Frame};
use crate::room::{RoomId, RoomRegistry};

/// What a connection hands the hub when it registers.
///
/// The hub keeps the only sender of the outbound buffer, so dropping the
/// member entry closes the buffer and ends the write pump.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub outbound: mpsc::Sender<Frame>,
}

/// Hub-side record of a live connection.
#[derive(Debug)]
struct Member {
    user_id: UserId,
    outbound: mpsc::Sender<Frame>,
    rooms: HashSet<RoomId>,
}

/// Counters for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub total_connections: u64,
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub evictions: u64,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Events processed by the hub task.
#[derive(Debug)]
pub enum HubCommand {
    Register(Registration),
    Unregister(ConnectionId),
    Join {
        connection: ConnectionId,
        room: RoomId,
    },
    Leave {
        connection: ConnectionId,
        room: RoomId,
    },
    Broadcast {
        room: RoomId,
        envelope: Envelope,
    },
    SendTo {
        connection: ConnectionId,
        envelope: Envelope,
    },
    RoomMembers {
        room: RoomId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    RoomsOf {
        connection: ConnectionId,
        reply: oneshot::Sender<Vec<RoomId>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Hub state. Owned by exactly one task once spawned.
#[derive(Debug, Default)]
pub struct Hub {
    connections: HashMap<ConnectionId, Member>,
    rooms: RoomRegistry,
    total_connections: u64,
    broadcasts: u64,
    frames_delivered: u64,
    evictions: u64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the hub onto its own task and return the handle that feeds it.
    pub fn spawn(self, queue_capacity: usize) -> HubHandle {
        let (tx, rx) = mpsc::channel(queue_capacity);
        tokio::spawn(self.run(rx));
        HubHandle { tx }
    }

    /// Process commands until every handle has been dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        log::info!("Hub started");
        while let Some(cmd) = rx.recv().await {
            self.apply(cmd);
        }
        log::info!(
            "Hub stopped with {} connections in {} rooms",
            self.connections.len(),
            self.rooms.room_count()
        );
    }

    /// Apply one command. Query replies to a dropped receiver are ignored.
    pub fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(registration) => self.register(registration),
            HubCommand::Unregister(id) => {
                self.unregister(id);
            }
            HubCommand::Join { connection, room } => {
                self.join_room(connection, room);
            }
            HubCommand::Leave { connection, room } => {
                self.leave_room(connection, &room);
            }
            HubCommand::Broadcast { room, envelope } => {
                self.broadcast_to_room(&room, &envelope);
            }
            HubCommand::SendTo { connection, envelope } => {
                self.send_to(connection, &envelope);
            }
            HubCommand::RoomMembers { room, reply } => {
                let _ = reply.send(self.room_members(&room));
            }
            HubCommand::RoomsOf { connection, reply } => {
                let _ = reply.send(self.rooms_of(connection));
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Admit a connection.
    pub fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            user_id,
            outbound,
        } = registration;

        // A second registration under the same id replaces the first; drop
        // the stale entry through the normal path so its rooms stay consistent.
        if self.connections.contains_key(&id) {
            log::warn!("Connection {id} registered twice, replacing");
            self.unregister(id);
        }

        log::info!("Client connected: {user_id} ({id})");
        self.connections.insert(
            id,
            Member {
                user_id,
                outbound,
                rooms: HashSet::new(),
            },
        );
        self.total_connections += 1;
    }

    /// Drop a connection, close its buffer and remove it from every room.
    ///
    /// Returns `false` if it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let Some(member) = self.connections.remove(&id) else {
            return false;
        };
        for room in &member.rooms {
            self.rooms.leave(room, id);
        }
        log::info!(
            "Client disconnected: {} ({id}), left {} rooms",
            member.user_id,
            member.rooms.len()
        );
        // `member.outbound` drops here, closing the buffer.
        true
    }

    /// Add a registered connection to a room.
    ///
    /// Returns `false` for unknown connections, which never enter the registry.
    pub fn join_room(&mut self, id: ConnectionId, room: RoomId) -> bool {
        let Some(member) = self.connections.get_mut(&id) else {
            log::debug!("Ignoring join of {room} from unregistered connection {id}");
            return false;
        };
        if member.rooms.insert(room.clone()) {
            log::info!("Client {} joined room {room}", member.user_id);
        }
        self.rooms.join(room, id);
        true
    }

    /// Remove a connection from a room. No-op if it was not a member.
    pub fn leave_room(&mut self, id: ConnectionId, room: &RoomId) -> bool {
        let Some(member) = self.connections.get_mut(&id) else {
            return false;
        };
        if !member.rooms.remove(room) {
            return false;
        }
        self.rooms.leave(room, id);
        log::info!("Client {} left room {room}", member.user_id);
        true
    }

    /// Serialize once and offer the frame to every member without blocking.
    ///
    /// Members whose buffer is full (or already closed) are unregistered after
    /// the fan-out; the remaining members still receive the frame.
    pub fn broadcast_to_room(&mut self, room: &RoomId, envelope: &Envelope) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let Some(members) = self.rooms.members(room.as_str()) else {
            return outcome;
        };

        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} for room {room}: {e}", envelope.action);
                return outcome;
            }
        };

        self.broadcasts += 1;
        for id in members {
            let Some(member) = self.connections.get(id) else {
                continue;
            };
            match member.outbound.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "Evicting {} ({id}): outbound buffer full in room {room}",
                        member.user_id
                    );
                    outcome.evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Dropping {id}: write pump already gone");
                    outcome.evicted.push(*id);
                }
            }
        }

        for id in &outcome.evicted {
            if self.unregister(*id) {
                self.evictions += 1;
            }
        }
        self.frames_delivered += outcome.delivered as u64;
        log::trace!(
            "Broadcast {} to {room}: {} delivered, {} evicted",
            envelope.action,
            outcome.delivered,
            outcome.evicted.len()
        );
        outcome
    }

    /// Deliver to a single connection, evicting it if its buffer is full.
    pub fn send_to(&mut self, id: ConnectionId, envelope: &Envelope) -> bool {
        let Some(member) = self.connections.get(&id) else {
            return false;
        };
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} for {id}: {e}", envelope.action);
                return false;
            }
        };
        if member.outbound.try_send(frame).is_ok() {
            self.frames_delivered += 1;
            return true;
        }
        log::warn!("Evicting {} ({id}): direct send failed", member.user_id);
        if self.unregister(id) {
            self.evictions += 1;
        }
        false
    }

    pub fn room_members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .members(room.as_str())
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(&id)
            .map(|member| member.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.connections.len(),
            active_rooms: self.rooms.room_count(),
            total_connections: self.total_connections,
            broadcasts: self.broadcasts,
            frames_delivered: self.frames_delivered,
            evictions: self.evictions,
        }
    }
}

/// Cloneable front door to a spawned hub.
///
/// Every call is queued onto the hub's single event stream. The only error is
/// [`HubError::HubClosed`], returned once the hub task has stopped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).await.map_err(|_| HubError::HubClosed)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| HubError::HubClosed)
    }

    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        self.send(HubCommand::Register(registration)).await
    }

    pub async fn unregister(&self, connection: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(connection)).await
    }

    pub async fn join_room(&self, connection: ConnectionId, room: RoomId) -> Result<(), HubError> {
        self.send(HubCommand::Join { connection, room }).await
    }

    pub async fn leave_room(&self, connection: ConnectionId, room: RoomId) -> Result<(), HubError> {
        self.send(HubCommand::Leave { connection, room }).await
    }

    /// Fan an envelope out to a room. Usable by collaborators outside the
    /// socket path, e.g. to push `reaction_update` after an HTTP call.
    pub async fn broadcast_to_room(&self, room: RoomId, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast { room, envelope }).await
    }

    pub async fn send_to(&self, connection: ConnectionId, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::SendTo { connection, envelope }).await
    }

    pub async fn room_members(&self, room: RoomId) -> Result<Vec<ConnectionId>, HubError> {
        self.ask(|reply| HubCommand::RoomMembers { room, reply }).await
    }

    pub async fn rooms_of(&self, connection: ConnectionId) -> Result<Vec<RoomId>, HubError> {
        self.ask(|reply| HubCommand::RoomsOf { connection, reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.ask(|reply| HubCommand::Stats { reply }).await
    }
}
