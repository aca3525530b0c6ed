//! Signaling channel seam
//!
//! The mesh consumes one ordered stream of [`SignalEvent`]s per client and
//! publishes [`OutboundSignal`]s addressed to a single remote peer. Room
//! snapshots travel on the same stream as the negotiation events, which keeps
//! the order the server emitted them in: a peer is always admitted by a
//! snapshot before any offer it sends can be seen.

use crate::error::SignalingError;
use parking_lot::Mutex;
use shared::{ClientMessage, IceCandidate, PeerId, Player, Room, ServerMessage, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use tcp::TcpSignaling;

/// Inbound event delivered to the mesh
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Latest snapshot of the room this client is in, `None` once it left
    RoomChanged(Option<Room>),
    PeerJoined {
        peer: Player,
        should_initiate: bool,
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
}

impl SignalEvent {
    /// Maps the mesh-relevant server frames; lobby-only frames yield `None`
    pub fn from_server(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::RoomJoined { room } | ServerMessage::RoomUpdated { room } => {
                Some(SignalEvent::RoomChanged(Some(room)))
            }
            ServerMessage::PeerJoined {
                peer,
                should_initiate_connection,
                is_master,
            } => Some(SignalEvent::PeerJoined {
                peer,
                should_initiate: should_initiate_connection,
                is_master,
            }),
            ServerMessage::PeerLeft {
                peer_id,
                new_master_id,
            } => Some(SignalEvent::PeerLeft {
                peer_id,
                new_master_id,
            }),
            ServerMessage::Offer { from, offer } => Some(SignalEvent::Offer { from, offer }),
            ServerMessage::Answer { from, answer } => Some(SignalEvent::Answer { from, answer }),
            ServerMessage::IceCandidate { from, candidate } => {
                Some(SignalEvent::IceCandidate { from, candidate })
            }
            ServerMessage::Welcome { .. }
            | ServerMessage::Rooms { .. }
            | ServerMessage::RoomLeft { .. }
            | ServerMessage::GameStarted { .. }
            | ServerMessage::Error { .. } => None,
        }
    }
}

/// Negotiation message addressed to one remote peer
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
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

impl OutboundSignal {
    pub fn target(&self) -> &PeerId {
        match self {
            OutboundSignal::Offer { target_id, .. }
            | OutboundSignal::Answer { target_id, .. }
            | OutboundSignal::IceCandidate { target_id, .. } => target_id,
        }
    }

    /// The event the target receives, stamped with the sender
    pub fn into_event(self, from: PeerId) -> SignalEvent {
        match self {
            OutboundSignal::Offer { offer, .. } => SignalEvent::Offer { from, offer },
            OutboundSignal::Answer { answer, .. } => SignalEvent::Answer { from, answer },
            OutboundSignal::IceCandidate { candidate, .. } => {
                SignalEvent::IceCandidate { from, candidate }
            }
        }
    }
}

impl From<OutboundSignal> for ClientMessage {
    fn from(signal: OutboundSignal) -> Self {
        match signal {
            OutboundSignal::Offer { target_id, offer } => ClientMessage::Offer { target_id, offer },
            OutboundSignal::Answer { target_id, answer } => ClientMessage::Answer { target_id, answer },
            OutboundSignal::IceCandidate {
                target_id,
                candidate,
            } => ClientMessage::IceCandidate {
                target_id,
                candidate,
            },
        }
    }
}

/// Inbound events of one subscriber, in the order they were received
pub type SignalStream = mpsc::UnboundedReceiver<SignalEvent>;

/// Hands every inbound event to each subscriber's own queue
///
/// Queues are unbounded: a subscriber that falls behind still sees every
/// event, in order. Subscribers whose stream was dropped are forgotten on
/// the next publish.
#[derive(Clone, Default)]
pub struct EventFanout {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SignalEvent>>>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Returns the number of subscribers the event reached
    pub fn publish(&self, event: SignalEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// A connection to the signaling server as seen by the mesh
pub trait SignalingChannel: Send + Sync {
    /// Identity the server assigned to this client
    fn local_id(&self) -> PeerId;

    /// Stream of every inbound event from now on
    fn subscribe(&self) -> SignalStream;

    /// Queues a message for relay; never waits for the network
    fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;
}
