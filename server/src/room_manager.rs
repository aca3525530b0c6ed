//! Room bookkeeping for the signaling server
//!
//! This module tracks which sessions sit in which room, including:
//! - Room creation with short random identifiers
//! - Capacity enforcement on join
//! - Master election (first member, then first remaining member)
//! - Game started/ended flags, changeable by the master only
//!
//! It performs no I/O. The network layer turns each outcome into the
//! notifications that drive every client's peer mesh.

use log::info;
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{PeerId, Player, Room};
use std::collections::HashMap;
use thiserror::Error;

const ROOM_ID_LEN: usize = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room not found")]
    NotFound,
    #[error("Room is full")]
    Full,
    #[error("You are not a master")]
    NotMaster,
    #[error("Already a member of this room")]
    AlreadyMember,
    #[error("Not a member of this room")]
    NotMember,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Room snapshot including the new member
    pub room: Room,
    /// Members that were present before the join, in join order
    pub existing: Vec<PeerId>,
    /// Whether the joining player is the room's master
    pub joiner_is_master: bool,
}

/// Result of a successful leave
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room_id: String,
    /// Room snapshot after the departure, `None` if the room was deleted
    pub remaining: Option<Room>,
    pub new_master_id: Option<PeerId>,
}

/// Owns every open room on the server
pub struct RoomManager {
    rooms: HashMap<String, Room>,
    max_players: usize,
}

impl RoomManager {
    /// Creates an empty registry where every new room holds at most `max_players`
    pub fn new(max_players: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_players,
        }
    }

    /// Creates a room with `creator` as its first member and master
    pub fn create_room(&mut self, name: &str, creator: Player) -> Room {
        let mut room_id = generate_room_id();
        while self.rooms.contains_key(&room_id) {
            room_id = generate_room_id();
        }

        let mut room = Room::new(room_id.clone(), name, self.max_players);
        room.master_id = Some(creator.id.clone());
        info!("Room {} ({}) created by {}", room_id, name, creator.id);
        room.players.push(creator);

        self.rooms.insert(room_id, room.clone());
        room
    }

    /// Adds `player` to an existing room
    ///
    /// A room that lost all members is deleted, so the first player in a
    /// room is always the one that created it and holds the master role.
    pub fn join_room(&mut self, room_id: &str, player: Player) -> Result<JoinOutcome, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;

        if room.is_member(&player.id) {
            return Err(RoomError::AlreadyMember);
        }
        if room.is_full() {
            return Err(RoomError::Full);
        }

        let existing: Vec<PeerId> = room.players.iter().map(|p| p.id.clone()).collect();
        if room.players.is_empty() {
            room.master_id = Some(player.id.clone());
        }

        info!("Player {} joined room {}", player.id, room_id);
        let joiner_is_master = room.is_master(&player.id);
        room.players.push(player);

        Ok(JoinOutcome {
            room: room.clone(),
            existing,
            joiner_is_master,
        })
    }

    /// Removes a player, re-electing the master and deleting empty rooms
    pub fn leave_room(&mut self, room_id: &str, player_id: &PeerId) -> Result<LeaveOutcome, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;

        if !room.is_member(player_id) {
            return Err(RoomError::NotMember);
        }

        room.players.retain(|p| &p.id != player_id);
        info!("Player {} left room {}", player_id, room_id);

        if room.is_master(player_id) {
            room.master_id = room.players.first().map(|p| p.id.clone());
            if let Some(master) = &room.master_id {
                info!("Room {} master handed over to {}", room_id, master);
            }
        }

        let new_master_id = room.master_id.clone();

        if room.players.is_empty() {
            self.rooms.remove(room_id);
            info!("Room {} deleted", room_id);
            return Ok(LeaveOutcome {
                room_id: room_id.to_string(),
                remaining: None,
                new_master_id: None,
            });
        }

        Ok(LeaveOutcome {
            room_id: room_id.to_string(),
            remaining: Some(room.clone()),
            new_master_id,
        })
    }

    /// Marks the room's game as started; only the master may do so
    pub fn start_game(&mut self, room_id: &str, requester: &PeerId) -> Result<Room, RoomError> {
        self.set_game_started(room_id, requester, true)
    }

    /// Clears the room's started flag; only the master may do so
    pub fn end_game(&mut self, room_id: &str, requester: &PeerId) -> Result<Room, RoomError> {
        self.set_game_started(room_id, requester, false)
    }

    fn set_game_started(
        &mut self,
        room_id: &str,
        requester: &PeerId,
        started: bool,
    ) -> Result<Room, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;

        if !room.is_master(requester) {
            return Err(RoomError::NotMaster);
        }

        room.is_game_started = started;
        info!("Room {} game started: {}", room_id, started);
        Ok(room.clone())
    }

    /// Identifiers of every room the player is a member of
    pub fn rooms_of(&self, player_id: &PeerId) -> Vec<String> {
        self.rooms
            .values()
            .filter(|room| room.is_member(player_id))
            .map(|room| room.id.clone())
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// All rooms, ordered by identifier
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

fn generate_room_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn player(id: &str) -> Player {
        Player::new(id, format!("player-{}", id))
    }

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn test_create_room() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));

        assert_eq!(room.id.len(), ROOM_ID_LEN);
        assert_eq!(room.players.len(), 1);
        assert!(room.is_master(&peer("a")));
        assert!(!room.is_game_started);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_join_room_reports_existing_members() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("b"));
        manager.join_room(&room.id, player("c")).unwrap();

        let outcome = manager.join_room(&room.id, player("a")).unwrap();

        assert_eq!(outcome.existing, vec![peer("b"), peer("c")]);
        assert!(!outcome.joiner_is_master);
        assert_eq!(outcome.room.players.len(), 3);
        assert!(outcome.room.is_master(&peer("b")));
    }

    #[test]
    fn test_join_missing_room() {
        let mut manager = RoomManager::new(4);
        let result = manager.join_room("nope", player("a"));
        assert_eq!(result.unwrap_err(), RoomError::NotFound);
    }

    #[test]
    fn test_join_room_max_capacity() {
        let mut manager = RoomManager::new(2);
        let room = manager.create_room("duo", player("a"));
        manager.join_room(&room.id, player("b")).unwrap();

        let result = manager.join_room(&room.id, player("c"));
        assert_eq!(result.unwrap_err(), RoomError::Full);
        assert_eq!(manager.room(&room.id).unwrap().players.len(), 2);
    }

    #[test]
    fn test_join_twice_rejected() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));

        let result = manager.join_room(&room.id, player("a"));
        assert_eq!(result.unwrap_err(), RoomError::AlreadyMember);
    }

    #[test]
    fn test_leave_hands_master_to_first_remaining() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));
        manager.join_room(&room.id, player("b")).unwrap();
        manager.join_room(&room.id, player("c")).unwrap();

        let outcome = manager.leave_room(&room.id, &peer("a")).unwrap();

        assert_eq!(outcome.new_master_id, Some(peer("b")));
        let remaining = outcome.remaining.unwrap();
        assert!(remaining.is_master(&peer("b")));
        assert_eq!(remaining.players.len(), 2);
    }

    #[test]
    fn test_leave_non_master_keeps_master() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));
        manager.join_room(&room.id, player("b")).unwrap();

        let outcome = manager.leave_room(&room.id, &peer("b")).unwrap();
        assert_eq!(outcome.new_master_id, Some(peer("a")));
    }

    #[test]
    fn test_last_leave_deletes_room() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));

        let outcome = manager.leave_room(&room.id, &peer("a")).unwrap();

        assert!(outcome.remaining.is_none());
        assert!(manager.is_empty());
        assert!(manager.room(&room.id).is_none());
    }

    #[test]
    fn test_leave_as_stranger() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));

        let result = manager.leave_room(&room.id, &peer("z"));
        assert_eq!(result.unwrap_err(), RoomError::NotMember);
    }

    #[test]
    fn test_only_master_starts_and_ends_game() {
        let mut manager = RoomManager::new(4);
        let room = manager.create_room("lobby", player("a"));
        manager.join_room(&room.id, player("b")).unwrap();

        let refused = assert_err!(manager.start_game(&room.id, &peer("b")));
        assert_eq!(refused, RoomError::NotMaster);
        assert_err!(manager.end_game(&room.id, &peer("b")));

        let started = assert_ok!(manager.start_game(&room.id, &peer("a")));
        assert!(started.is_game_started);

        let ended = assert_ok!(manager.end_game(&room.id, &peer("a")));
        assert!(!ended.is_game_started);
    }

    #[test]
    fn test_rooms_of_player() {
        let mut manager = RoomManager::new(4);
        let first = manager.create_room("one", player("a"));
        let _second = manager.create_room("two", player("b"));

        assert_eq!(manager.rooms_of(&peer("a")), vec![first.id]);
        assert!(manager.rooms_of(&peer("z")).is_empty());
        assert_eq!(manager.rooms().len(), 2);
    }
}
