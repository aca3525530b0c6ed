use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DATA_CHANNEL_LABEL: &str = "gameState";
pub const DEFAULT_MAX_PLAYERS: usize = 4;
pub const STATS_INTERVAL_MS: u64 = 2000;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Identity assigned by the signaling server for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PeerId,
    pub name: String,
}

impl Player {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Snapshot of one room as known by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub players: Vec<Player>,
    pub max_players: usize,
    pub master_id: Option<PeerId>,
    pub is_game_started: bool,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>, max_players: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            players: Vec::new(),
            max_players,
            master_id: None,
            is_game_started: false,
        }
    }

    pub fn is_member(&self, id: &PeerId) -> bool {
        self.players.iter().any(|p| &p.id == id)
    }

    pub fn is_master(&self, id: &PeerId) -> bool {
        self.master_id.as_ref() == Some(id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Members other than `id`, in join order.
    pub fn others<'a>(&'a self, id: &'a PeerId) -> impl Iterator<Item = &'a Player> + 'a {
        self.players.iter().filter(move |p| &p.id != id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description exchanged during link negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path, in the shape of an ICE candidate init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Frames sent from a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    ListRooms,
    CreateRoom {
        name: String,
        player_name: String,
    },
    JoinRoom {
        room_id: String,
        player_name: String,
    },
    LeaveRoom {
        room_id: String,
    },
    StartGame {
        room_id: String,
    },
    EndGame {
        room_id: String,
    },

    Offer {
        target_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        target_id: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        target_id: PeerId,
        candidate: IceCandidate,
    },
}

/// Frames sent from the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome {
        peer_id: PeerId,
    },
    Rooms {
        rooms: Vec<Room>,
    },
    RoomJoined {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomLeft {
        room_id: String,
    },
    GameStarted {
        room_id: String,
    },
    PeerJoined {
        peer: Player,
        should_initiate_connection: bool,
        is_master: bool,
    },
    PeerLeft {
        peer_id: PeerId,
        new_master_id: Option<PeerId>,
    },

    Offer {
        from: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },

    Error {
        reason: String,
    },
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Serializes a message with bincode behind a big-endian u32 length prefix.
pub fn encode_frame<T: Serialize>(message: &T) -> bincode::Result<Vec<u8>> {
    let body = bincode::serialize(message)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame =
        encode_frame(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
