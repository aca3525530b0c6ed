use super::{EventFanout, OutboundSignal, SignalEvent, SignalStream, SignalingChannel};
use crate::error::SignalingError;
use log::{debug, info, warn};
use shared::{encode_frame, read_frame, ClientMessage, PeerId, Room, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Client connection to the signaling server
///
/// Besides the mesh-facing [`SignalingChannel`] it exposes the lobby commands
/// and two watch streams: the room this client is in and the room list.
/// Subscribe (build the mesh) before joining a room, events are not replayed.
pub struct TcpSignaling {
    local_id: PeerId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: EventFanout,
    room: watch::Receiver<Option<Room>>,
    rooms: watch::Receiver<Vec<Room>>,
    connected: Arc<AtomicBool>,
}

impl TcpSignaling {
    /// Connects and waits for the server to assign an identity
    pub async fn connect(addr: &str) -> Result<Self, SignalingError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let local_id = match read_frame::<_, ServerMessage>(&mut reader).await? {
            Some(ServerMessage::Welcome { peer_id }) => peer_id,
            Some(other) => {
                return Err(SignalingError::Handshake(format!(
                    "expected welcome, got {:?}",
                    other
                )))
            }
            None => return Err(SignalingError::Disconnected),
        };
        info!("Connected to signaling server {} as {}", addr, local_id);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let events = EventFanout::new();
        let (room_tx, room) = watch::channel::<Option<Room>>(None);
        let (rooms_tx, rooms) = watch::channel(Vec::new());
        let connected = Arc::new(AtomicBool::new(true));

        // Writer task
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Failed to write to signaling server: {}", e);
                    break;
                }
            }
        });

        // Reader task
        let reader_events = events.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            loop {
                let message = match read_frame::<_, ServerMessage>(&mut reader).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        info!("Signaling server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read from signaling server: {}", e);
                        break;
                    }
                };

                match message {
                    ServerMessage::Rooms { rooms } => {
                        rooms_tx.send_replace(rooms);
                    }
                    ServerMessage::RoomLeft { room_id } => {
                        let left = room_tx.borrow().as_ref().is_some_and(|room| room.id == room_id);
                        if left {
                            room_tx.send_replace(None);
                            reader_events.publish(SignalEvent::RoomChanged(None));
                        }
                    }
                    ServerMessage::GameStarted { room_id } => {
                        info!("Game started in room {}", room_id);
                    }
                    ServerMessage::Error { reason } => {
                        warn!("Signaling server error: {}", reason);
                    }
                    ServerMessage::Welcome { peer_id } => {
                        debug!("Ignoring repeated welcome for {}", peer_id);
                    }
                    other => {
                        if let Some(event) = SignalEvent::from_server(other) {
                            if let SignalEvent::RoomChanged(room) = &event {
                                room_tx.send_replace(room.clone());
                            }
                            // No subscribers is not an error
                            reader_events.publish(event);
                        }
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            if room_tx.send_replace(None).is_some() {
                reader_events.publish(SignalEvent::RoomChanged(None));
            }
        });

        Ok(Self {
            local_id,
            outbound,
            events,
            room,
            rooms,
            connected,
        })
    }

    fn send_message(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }
        let frame = encode_frame(&message)?;
        self.outbound
            .send(frame)
            .map_err(|_| SignalingError::Disconnected)
    }

    fn current_room_id(&self) -> Result<String, SignalingError> {
        self.room
            .borrow()
            .as_ref()
            .map(|room| room.id.clone())
            .ok_or(SignalingError::NotInRoom)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn list_rooms(&self) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::ListRooms)
    }

    pub fn create_room(&self, name: &str, player_name: &str) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::CreateRoom {
            name: name.to_string(),
            player_name: player_name.to_string(),
        })
    }

    pub fn join_room(&self, room_id: &str, player_name: &str) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            player_name: player_name.to_string(),
        })
    }

    pub fn leave_room(&self) -> Result<(), SignalingError> {
        let room_id = self.current_room_id()?;
        self.send_message(ClientMessage::LeaveRoom { room_id })
    }

    /// Asks the server to start the game; only honoured for the master
    pub fn start_game(&self) -> Result<(), SignalingError> {
        let room_id = self.current_room_id()?;
        self.send_message(ClientMessage::StartGame { room_id })
    }

    pub fn end_game(&self) -> Result<(), SignalingError> {
        let room_id = self.current_room_id()?;
        self.send_message(ClientMessage::EndGame { room_id })
    }

    pub fn current_room(&self) -> Option<Room> {
        self.room.borrow().clone()
    }

    pub fn room_updates(&self) -> watch::Receiver<Option<Room>> {
        self.room.clone()
    }

    pub fn rooms(&self) -> watch::Receiver<Vec<Room>> {
        self.rooms.clone()
    }

    /// Waits until this client is in a room matching `pred`
    pub async fn wait_for_room(&self, pred: impl Fn(&Room) -> bool) -> Result<Room, SignalingError> {
        let mut updates = self.room.clone();
        loop {
            if let Some(room) = updates.borrow_and_update().as_ref().filter(|room| pred(*room)) {
                return Ok(room.clone());
            }
            updates
                .changed()
                .await
                .map_err(|_| SignalingError::Disconnected)?;
        }
    }
}

impl SignalingChannel for TcpSignaling {
    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }

    fn subscribe(&self) -> SignalStream {
        self.events.subscribe()
    }

    fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        debug!("Relaying signal to {}", signal.target());
        self.send_message(signal.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{write_frame, IceCandidate, Player};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn fake_server() -> (String, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(
                &mut stream,
                &ServerMessage::Welcome {
                    peer_id: PeerId::from("me"),
                },
            )
            .await
            .unwrap();
            stream
        });
        (addr, handle)
    }

    async fn next_event(events: &mut SignalStream) -> SignalEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_event_order() {
        let (addr, server) = fake_server().await;
        let signaling = TcpSignaling::connect(&addr).await.unwrap();
        assert_eq!(signaling.local_id(), PeerId::from("me"));

        let mut events = signaling.subscribe();
        let mut stream = server.await.unwrap();

        let mut room = Room::new("r1", "arena", 4);
        room.players.push(Player::new("me", "Me"));
        room.players.push(Player::new("b", "Bob"));

        write_frame(&mut stream, &ServerMessage::RoomJoined { room: room.clone() })
            .await
            .unwrap();
        write_frame(
            &mut stream,
            &ServerMessage::IceCandidate {
                from: PeerId::from("b"),
                candidate: IceCandidate::new("candidate:1"),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut stream,
            &ServerMessage::RoomLeft {
                room_id: "r1".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::RoomChanged(Some(room))
        );
        assert!(matches!(
            next_event(&mut events).await,
            SignalEvent::IceCandidate { .. }
        ));
        assert_eq!(next_event(&mut events).await, SignalEvent::RoomChanged(None));
        assert!(signaling.current_room().is_none());
    }

    #[tokio::test]
    async fn test_leaving_another_room_keeps_current_room() {
        let (addr, server) = fake_server().await;
        let signaling = TcpSignaling::connect(&addr).await.unwrap();
        let mut events = signaling.subscribe();
        let mut stream = server.await.unwrap();

        let mut room = Room::new("r1", "arena", 4);
        room.players.push(Player::new("me", "Me"));
        write_frame(&mut stream, &ServerMessage::RoomJoined { room: room.clone() })
            .await
            .unwrap();
        write_frame(
            &mut stream,
            &ServerMessage::RoomLeft {
                room_id: "r0".to_string(),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut stream,
            &ServerMessage::PeerLeft {
                peer_id: PeerId::from("b"),
                new_master_id: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::RoomChanged(Some(room.clone()))
        );
        // The stale leave produced no event
        assert!(matches!(
            next_event(&mut events).await,
            SignalEvent::PeerLeft { .. }
        ));
        assert_eq!(signaling.current_room(), Some(room));
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_server() {
        let (addr, server) = fake_server().await;
        let signaling = TcpSignaling::connect(&addr).await.unwrap();
        let mut stream = server.await.unwrap();

        assert!(matches!(
            signaling.start_game(),
            Err(SignalingError::NotInRoom)
        ));

        signaling.create_room("arena", "Me").unwrap();
        signaling
            .send(OutboundSignal::IceCandidate {
                target_id: PeerId::from("b"),
                candidate: IceCandidate::new("candidate:1"),
            })
            .unwrap();

        let first: ClientMessage = read_frame(&mut stream).await.unwrap().unwrap();
        let second: ClientMessage = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(first, ClientMessage::CreateRoom { .. }));
        assert!(matches!(
            second,
            ClientMessage::IceCandidate { target_id, .. } if target_id == PeerId::from("b")
        ));
    }

    #[tokio::test]
    async fn test_server_loss_clears_room() {
        let (addr, server) = fake_server().await;
        let signaling = TcpSignaling::connect(&addr).await.unwrap();
        let mut events = signaling.subscribe();
        let mut stream = server.await.unwrap();

        let mut room = Room::new("r1", "arena", 4);
        room.players.push(Player::new("me", "Me"));
        write_frame(&mut stream, &ServerMessage::RoomJoined { room })
            .await
            .unwrap();
        signaling.wait_for_room(|_| true).await.unwrap();
        drop(stream);

        let mut last = None;
        while let Ok(Some(event)) = timeout(Duration::from_secs(1), events.recv()).await {
            last = Some(event);
            if last == Some(SignalEvent::RoomChanged(None)) {
                break;
            }
        }
        assert_eq!(last, Some(SignalEvent::RoomChanged(None)));

        timeout(Duration::from_secs(1), async {
            while signaling.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            signaling.list_rooms(),
            Err(SignalingError::Disconnected)
        ));
    }
}
