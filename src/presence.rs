//! Ephemeral presence: who is connected and which rooms they have joined
//!
//! Nothing here is persisted. Losing it on restart only means clients
//! rejoin their rooms.

use crate::db::ParticipantId;
use crate::events::ServerEvent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Identifies one socket connection of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<ServerEvent>,
}

/// Room membership and outbound channels
///
/// Rooms are keyed by conversation id; each room maps a participant to the
/// time they joined. Mutation of one room entry is atomic with respect to
/// concurrent joins and leaves on the same room.
#[derive(Default)]
pub struct PresenceHub {
    rooms: DashMap<String, HashMap<ParticipantId, DateTime<Utc>>>,
    connections: DashMap<ParticipantId, Connection>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A newer connection replaces an older one for
    /// the same participant.
    pub fn connect(
        &self,
        participant: &ParticipantId,
    ) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = unbounded_channel();
        let id = ConnectionId::new();
        if self
            .connections
            .insert(participant.clone(), Connection { id, sender })
            .is_some()
        {
            tracing::debug!(participant = %participant, "Replaced existing connection");
        }
        (id, receiver)
    }

    /// Returns whether the participant was not already in the room
    pub fn join(
        &self,
        conversation_id: &str,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> bool {
        let mut room = self.rooms.entry(conversation_id.to_string()).or_default();
        match room.entry(participant.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(at);
                true
            }
        }
    }

    /// Returns whether the participant was in the room
    pub fn leave(&self, conversation_id: &str, participant: &ParticipantId) -> bool {
        let removed = match self.rooms.get_mut(conversation_id) {
            Some(mut room) => room.remove(participant).is_some(),
            None => false,
        };
        self.rooms.remove_if(conversation_id, |_, room| room.is_empty());
        removed
    }

    /// Drop a connection and every room membership of its participant.
    ///
    /// Only acts when `connection_id` is still the participant's current
    /// connection, so a stale socket closing cannot evict a newer one.
    /// Returns the rooms left, or `None` for a stale connection.
    pub fn disconnect(
        &self,
        participant: &ParticipantId,
        connection_id: ConnectionId,
    ) -> Option<Vec<String>> {
        self.connections
            .remove_if(participant, |_, conn| conn.id == connection_id)?;

        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| room.value().contains_key(participant))
            .map(|room| room.key().clone())
            .collect();

        Some(
            joined
                .into_iter()
                .filter(|conversation_id| self.leave(conversation_id, participant))
                .collect(),
        )
    }

    /// Participants joined to a room, sorted
    pub fn list_online(&self, conversation_id: &str) -> Vec<ParticipantId> {
        let mut online: Vec<ParticipantId> = self
            .rooms
            .get(conversation_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        online.sort();
        online
    }

    pub fn is_joined(&self, conversation_id: &str, participant: &ParticipantId) -> bool {
        self.rooms
            .get(conversation_id)
            .is_some_and(|room| room.contains_key(participant))
    }

    /// Deliver to one participant's connection. Returns false if they have
    /// none or it has closed.
    pub fn send_to(&self, participant: &ParticipantId, event: ServerEvent) -> bool {
        let Some(sender) = self.connections.get(participant).map(|c| c.sender.clone()) else {
            return false;
        };
        sender.send(event).is_ok()
    }

    /// Deliver to everyone joined to a room except `exclude`. Returns the
    /// number of deliveries.
    pub fn broadcast(
        &self,
        conversation_id: &str,
        event: &ServerEvent,
        exclude: Option<&ParticipantId>,
    ) -> usize {
        self.list_online(conversation_id)
            .iter()
            .filter(|p| Some(*p) != exclude)
            .filter(|p| self.send_to(p, event.clone()))
            .count()
    }
}
