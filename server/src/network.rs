//! Signaling server network layer: TCP sessions, room events and negotiation relay

use crate::room_manager::{LeaveOutcome, RoomManager};
use log::{debug, error, info, warn};
use shared::{read_frame, write_frame, ClientMessage, PeerId, Player, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages sent from session tasks to the main server loop
#[derive(Debug)]
pub enum SessionEvent {
    Connected {
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    MessageReceived {
        peer_id: PeerId,
        message: ClientMessage,
    },
    Disconnected {
        peer_id: PeerId,
    },
}

/// Signaling server owning the room registry and every connected session
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    rooms: RoomManager,
    sessions: HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,

    // Communication channels
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Server {
    pub async fn bind(addr: &str, max_players: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Signaling server listening on {}", local_addr);

        let (session_tx, session_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            rooms: RoomManager::new(max_players),
            sessions: HashMap::new(),
            session_tx,
            session_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns task that accepts new TCP sessions
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let session_tx = self.session_tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        Self::spawn_session(stream, session_tx.clone());
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the reader and writer tasks of one session
    fn spawn_session(stream: TcpStream, session_tx: mpsc::UnboundedSender<SessionEvent>) {
        let peer_id = PeerId::new(Uuid::new_v4().to_string());
        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        if session_tx
            .send(SessionEvent::Connected {
                peer_id: peer_id.clone(),
                outbound: outbound_tx,
            })
            .is_err()
        {
            return;
        }

        let writer_peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    warn!("Failed to write to session {}: {}", writer_peer, e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match read_frame::<_, ClientMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        let event = SessionEvent::MessageReceived {
                            peer_id: peer_id.clone(),
                            message,
                        };
                        if session_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read from session {}: {}", peer_id, e);
                        break;
                    }
                }
            }
            let _ = session_tx.send(SessionEvent::Disconnected { peer_id });
        });
    }

    fn send(&self, peer_id: &PeerId, message: ServerMessage) {
        match self.sessions.get(peer_id) {
            Some(outbound) => {
                if outbound.send(message).is_err() {
                    debug!("Session {} already closed", peer_id);
                }
            }
            None => debug!("No session {} to deliver to", peer_id),
        }
    }

    /// Pushes the current room list to every session
    fn broadcast_rooms(&self) {
        let rooms = self.rooms.rooms();
        for outbound in self.sessions.values() {
            let _ = outbound.send(ServerMessage::Rooms {
                rooms: rooms.clone(),
            });
        }
    }

    fn send_error(&self, peer_id: &PeerId, reason: impl ToString) {
        self.send(
            peer_id,
            ServerMessage::Error {
                reason: reason.to_string(),
            },
        );
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { peer_id, outbound } => {
                info!("Session {} connected", peer_id);
                let _ = outbound.send(ServerMessage::Welcome {
                    peer_id: peer_id.clone(),
                });
                let _ = outbound.send(ServerMessage::Rooms {
                    rooms: self.rooms.rooms(),
                });
                self.sessions.insert(peer_id, outbound);
            }
            SessionEvent::MessageReceived { peer_id, message } => {
                self.handle_message(&peer_id, message);
            }
            SessionEvent::Disconnected { peer_id } => {
                info!("Session {} disconnected", peer_id);
                self.sessions.remove(&peer_id);
                for room_id in self.rooms.rooms_of(&peer_id) {
                    self.leave(&peer_id, &room_id);
                }
            }
        }
    }

    /// Processes one frame received from a session
    fn handle_message(&mut self, peer_id: &PeerId, message: ClientMessage) {
        match message {
            ClientMessage::ListRooms => {
                self.send(
                    peer_id,
                    ServerMessage::Rooms {
                        rooms: self.rooms.rooms(),
                    },
                );
            }

            ClientMessage::CreateRoom { name, player_name } => {
                self.leave_all(peer_id);
                let room = self
                    .rooms
                    .create_room(&name, Player::new(peer_id.clone(), player_name));
                self.send(peer_id, ServerMessage::RoomJoined { room });
                self.broadcast_rooms();
            }

            ClientMessage::JoinRoom {
                room_id,
                player_name,
            } => {
                if self
                    .rooms
                    .room(&room_id)
                    .is_some_and(|room| room.is_member(peer_id))
                {
                    self.send_error(peer_id, "Already a member of this room");
                    return;
                }
                self.leave_all(peer_id);

                let player = Player::new(peer_id.clone(), player_name);
                match self.rooms.join_room(&room_id, player.clone()) {
                    Ok(outcome) => {
                        self.send(
                            peer_id,
                            ServerMessage::RoomJoined {
                                room: outcome.room.clone(),
                            },
                        );

                        // Only members already present initiate towards the newcomer
                        for member in &outcome.existing {
                            self.send(
                                member,
                                ServerMessage::RoomUpdated {
                                    room: outcome.room.clone(),
                                },
                            );
                            self.send(
                                member,
                                ServerMessage::PeerJoined {
                                    peer: player.clone(),
                                    should_initiate_connection: true,
                                    is_master: outcome.joiner_is_master,
                                },
                            );
                        }
                        self.broadcast_rooms();
                    }
                    Err(e) => {
                        warn!("Session {} failed to join room {}: {}", peer_id, room_id, e);
                        self.send_error(peer_id, e);
                    }
                }
            }

            ClientMessage::LeaveRoom { room_id } => {
                self.leave(peer_id, &room_id);
            }

            ClientMessage::StartGame { room_id } => match self.rooms.start_game(&room_id, peer_id) {
                Ok(room) => {
                    for member in &room.players {
                        self.send(
                            &member.id,
                            ServerMessage::GameStarted {
                                room_id: room.id.clone(),
                            },
                        );
                        self.send(&member.id, ServerMessage::RoomUpdated { room: room.clone() });
                    }
                    self.broadcast_rooms();
                }
                Err(e) => self.send_error(peer_id, e),
            },

            ClientMessage::EndGame { room_id } => match self.rooms.end_game(&room_id, peer_id) {
                Ok(room) => {
                    for member in &room.players {
                        self.send(&member.id, ServerMessage::RoomUpdated { room: room.clone() });
                    }
                    self.broadcast_rooms();
                }
                Err(e) => self.send_error(peer_id, e),
            },

            ClientMessage::Offer { target_id, offer } => {
                self.relay(
                    peer_id,
                    &target_id,
                    ServerMessage::Offer {
                        from: peer_id.clone(),
                        offer,
                    },
                );
            }

            ClientMessage::Answer { target_id, answer } => {
                self.relay(
                    peer_id,
                    &target_id,
                    ServerMessage::Answer {
                        from: peer_id.clone(),
                        answer,
                    },
                );
            }

            ClientMessage::IceCandidate {
                target_id,
                candidate,
            } => {
                self.relay(
                    peer_id,
                    &target_id,
                    ServerMessage::IceCandidate {
                        from: peer_id.clone(),
                        candidate,
                    },
                );
            }
        }
    }

    /// Forwards a negotiation message, re-stamped with its sender
    fn relay(&self, from: &PeerId, target_id: &PeerId, message: ServerMessage) {
        if !self.sessions.contains_key(target_id) {
            warn!("Dropping relay from {} to unknown peer {}", from, target_id);
            return;
        }
        debug!("Relaying from {} to {}", from, target_id);
        self.send(target_id, message);
    }

    fn leave_all(&mut self, peer_id: &PeerId) {
        for room_id in self.rooms.rooms_of(peer_id) {
            self.leave(peer_id, &room_id);
        }
    }

    fn leave(&mut self, peer_id: &PeerId, room_id: &str) {
        match self.rooms.leave_room(room_id, peer_id) {
            Ok(outcome) => {
                self.send(
                    peer_id,
                    ServerMessage::RoomLeft {
                        room_id: outcome.room_id.clone(),
                    },
                );
                self.notify_departure(peer_id, outcome);
                self.broadcast_rooms();
            }
            Err(e) => self.send_error(peer_id, e),
        }
    }

    fn notify_departure(&self, peer_id: &PeerId, outcome: LeaveOutcome) {
        let Some(room) = outcome.remaining else {
            return;
        };

        for member in &room.players {
            self.send(
                &member.id,
                ServerMessage::PeerLeft {
                    peer_id: peer_id.clone(),
                    new_master_id: outcome.new_master_id.clone(),
                },
            );
            self.send(&member.id, ServerMessage::RoomUpdated { room: room.clone() });
        }
    }

    /// Main server loop processing session events in arrival order
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_acceptor();

        info!("Server started successfully");

        while let Some(event) = self.session_rx.recv().await {
            self.handle_event(event);
        }

        info!("Server shutting down");
        Ok(())
    }
}
