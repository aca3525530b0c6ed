//! In-process signaling hub
//!
//! Relays negotiation messages between clients living in the same process,
//! stamping each with its sender like the real server does. Room events are
//! not generated automatically; callers push them with [`SignalingHub::deliver`]
//! or [`SignalingHub::deliver_room`], which makes the hub convenient for
//! replaying exact event orders.

use super::{EventFanout, OutboundSignal, SignalEvent, SignalStream, SignalingChannel};
use crate::error::SignalingError;
use log::debug;
use parking_lot::Mutex;
use shared::{PeerId, Room};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct SignalingHub {
    peers: Arc<Mutex<HashMap<PeerId, EventFanout>>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client under `id`
    pub fn connect(&self, id: impl Into<PeerId>) -> MemorySignaling {
        let local = id.into();
        let events = EventFanout::new();
        self.peers.lock().insert(local.clone(), events.clone());

        MemorySignaling {
            local,
            hub: self.clone(),
            events,
        }
    }

    /// Unregisters `id`; later messages addressed to it are dropped
    pub fn disconnect(&self, id: &PeerId) {
        self.peers.lock().remove(id);
    }

    /// Pushes an event to one client; `false` if nobody is listening
    pub fn deliver(&self, to: &PeerId, event: SignalEvent) -> bool {
        let events = self.peers.lock().get(to).cloned();
        events.is_some_and(|events| events.publish(event) > 0)
    }

    /// Pushes a room snapshot to every member of the room
    pub fn deliver_room(&self, room: &Room) {
        for player in &room.players {
            self.deliver(&player.id, SignalEvent::RoomChanged(Some(room.clone())));
        }
    }

    fn relay(&self, from: &PeerId, signal: OutboundSignal) -> Result<(), SignalingError> {
        let target = {
            let peers = self.peers.lock();
            if !peers.contains_key(from) {
                return Err(SignalingError::Disconnected);
            }
            peers.get(signal.target()).cloned()
        };

        match target {
            Some(target) => {
                target.publish(signal.into_event(from.clone()));
            }
            None => debug!("Dropping relay from {} to unknown peer {}", from, signal.target()),
        }
        Ok(())
    }
}

/// One client's end of a [`SignalingHub`]
#[derive(Clone)]
pub struct MemorySignaling {
    local: PeerId,
    hub: SignalingHub,
    events: EventFanout,
}

impl SignalingChannel for MemorySignaling {
    fn local_id(&self) -> PeerId {
        self.local.clone()
    }

    fn subscribe(&self) -> SignalStream {
        self.events.subscribe()
    }

    fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.hub.relay(&self.local, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{IceCandidate, Player};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_relay_stamps_sender() {
        let hub = SignalingHub::new();
        let a = hub.connect("a");
        let b = hub.connect("b");
        let mut b_events = b.subscribe();

        a.send(OutboundSignal::IceCandidate {
            target_id: PeerId::from("b"),
            candidate: IceCandidate::new("candidate:1"),
        })
        .unwrap();

        assert_eq!(
            b_events.recv().await.unwrap(),
            SignalEvent::IceCandidate {
                from: PeerId::from("a"),
                candidate: IceCandidate::new("candidate:1"),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped() {
        let hub = SignalingHub::new();
        let a = hub.connect("a");

        assert_ok!(a.send(OutboundSignal::IceCandidate {
            target_id: PeerId::from("ghost"),
            candidate: IceCandidate::new("candidate:1"),
        }));

        hub.disconnect(&PeerId::from("a"));
        let error = assert_err!(a.send(OutboundSignal::IceCandidate {
            target_id: PeerId::from("ghost"),
            candidate: IceCandidate::new("candidate:2"),
        }));
        assert!(matches!(error, SignalingError::Disconnected));
    }

    #[tokio::test]
    async fn test_room_snapshot_reaches_members() {
        let hub = SignalingHub::new();
        let a = hub.connect("a");
        let outsider = hub.connect("z");
        let mut a_events = a.subscribe();
        let mut outsider_events = outsider.subscribe();

        let mut room = Room::new("r1", "arena", 4);
        room.players.push(Player::new("a", "Alice"));
        hub.deliver_room(&room);

        assert_eq!(
            a_events.recv().await.unwrap(),
            SignalEvent::RoomChanged(Some(room))
        );
        assert!(outsider_events.try_recv().is_err());
    }
}
