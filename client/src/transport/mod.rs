//! Link transport seam
//!
//! The mesh never talks to a concrete peer connection. It asks a [`Transport`]
//! for one [`PeerLink`] per remote peer and drives the handshake through the
//! link's async operations. Everything the transport discovers on its own
//! (local candidates, channel open/close, inbound text) is reported through
//! the [`LinkEvents`] sink handed over at creation, tagged with the peer and
//! the link generation so that late events of a replaced link can be told
//! apart from the current one.

use crate::error::LinkResult;
use crate::health::CandidatePairStats;
use async_trait::async_trait;
use shared::{IceCandidate, PeerId, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

/// Factory of links towards remote peers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_link(&self, peer: &PeerId, events: LinkEvents) -> LinkResult<Arc<dyn PeerLink>>;
}

/// One transport-level connection to a single remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> LinkResult<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> LinkResult<SessionDescription>;
    async fn create_answer(&self) -> LinkResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()>;
    /// Candidate-pair statistics of the underlying connection
    async fn stats(&self) -> LinkResult<Vec<CandidatePairStats>>;
    async fn close(&self);
}

/// Reliable ordered text stream carried by a link
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> LinkResult<()>;
    async fn close(&self);
}

/// Something the transport noticed without being asked
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    Message(String),
    ChannelClosed,
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::ChannelOpen(channel) => f.debug_tuple("ChannelOpen").field(&channel.label()).finish(),
            LinkEvent::Message(text) => f.debug_tuple("Message").field(&text.len()).finish(),
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

#[derive(Debug)]
pub struct TaggedLinkEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Sink for the events of one link generation
#[derive(Clone)]
pub struct LinkEvents {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEvents {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<TaggedLinkEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn emit(&self, event: LinkEvent) {
        // The receiver is gone once the mesh is dropped
        let _ = self.tx.send(TaggedLinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEvent::LocalCandidate(candidate));
    }

    pub fn channel_open(&self, channel: Arc<dyn DataChannel>) {
        self.emit(LinkEvent::ChannelOpen(channel));
    }

    pub fn message(&self, text: String) {
        self.emit(LinkEvent::Message(text));
    }

    pub fn channel_closed(&self) {
        self.emit(LinkEvent::ChannelClosed);
    }
}
