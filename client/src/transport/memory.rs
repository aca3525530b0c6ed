//! In-process loopback transport
//!
//! Links are endpoints inside one [`MemoryNetwork`]. A session description
//! simply names the endpoint that produced it, so two endpoints are paired
//! once each holds a local description and a remote description naming the
//! other. Pairing opens the data channels on both sides. Text sent on a
//! channel is handed to the counterpart's event sink in order.
//!
//! The network also records every candidate applied to an endpoint so tests
//! can observe the negotiation from the outside. An endpoint is forgotten
//! once it and its counterpart are both closed.

use super::{DataChannel, LinkEvents, PeerLink, Transport};
use crate::error::{LinkError, LinkResult};
use crate::health::{CandidatePairStats, PairState};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use shared::{IceCandidate, PeerId, SessionDescription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const SDP_PREFIX: &str = "memory-endpoint:";
const CANDIDATE_PREFIX: &str = "candidate:";

struct Endpoint {
    owner: PeerId,
    remote: PeerId,
    events: LinkEvents,
    local: Option<SessionDescription>,
    remote_endpoint: Option<u64>,
    channels: Vec<Arc<MemoryChannel>>,
    applied: Vec<IceCandidate>,
    counterpart: Option<u64>,
    closed: bool,
}

struct NetworkState {
    next_endpoint: u64,
    endpoints: HashMap<u64, Endpoint>,
    round_trip: Duration,
}

/// Shared medium connecting every [`MemoryTransport`] created from it
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                next_endpoint: 1,
                endpoints: HashMap::new(),
                round_trip: Duration::from_millis(1),
            })),
        }
    }

    /// Transport creating links owned by `local`
    pub fn transport(&self, local: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            local: local.into(),
            network: self.clone(),
        }
    }

    /// Round-trip time reported by the statistics of connected links
    pub fn set_round_trip(&self, round_trip: Duration) {
        self.state.lock().round_trip = round_trip;
    }

    /// Candidates applied so far by the newest link `owner` holds towards `remote`
    pub fn applied_candidates(&self, owner: &PeerId, remote: &PeerId) -> Vec<IceCandidate> {
        let state = self.state.lock();
        newest(&state, owner, remote)
            .map(|endpoint| endpoint.applied.clone())
            .unwrap_or_default()
    }

    /// Whether the newest link `owner` holds towards `remote` is paired and open
    pub fn is_connected(&self, owner: &PeerId, remote: &PeerId) -> bool {
        let state = self.state.lock();
        newest(&state, owner, remote)
            .map(|endpoint| endpoint.counterpart.is_some() && !endpoint.closed)
            .unwrap_or(false)
    }

    /// Number of links created by `owner` that have not been closed
    pub fn live_links(&self, owner: &PeerId) -> usize {
        self.state
            .lock()
            .endpoints
            .values()
            .filter(|endpoint| &endpoint.owner == owner && !endpoint.closed)
            .count()
    }

    fn add_endpoint(&self, owner: PeerId, remote: PeerId, events: LinkEvents) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                owner,
                remote,
                events,
                local: None,
                remote_endpoint: None,
                channels: Vec::new(),
                applied: Vec::new(),
                counterpart: None,
                closed: false,
            },
        );
        id
    }

    /// Pairs `id` with the endpoint its remote description names, if both sides are ready
    fn try_pair(&self, id: u64) {
        let mut opened = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(endpoint) = state.endpoints.get(&id) else {
                return;
            };
            let Some(other_id) = endpoint.remote_endpoint else {
                return;
            };
            if endpoint.local.is_none() || endpoint.counterpart.is_some() || endpoint.closed {
                return;
            }
            let Some(other) = state.endpoints.get(&other_id) else {
                return;
            };
            if other.local.is_none() || other.remote_endpoint != Some(id) || other.closed {
                return;
            }

            // Whichever side created channels is mirrored on the other
            let mut labels: Vec<String> = Vec::new();
            for endpoint_id in [id, other_id] {
                if let Some(endpoint) = state.endpoints.get(&endpoint_id) {
                    for channel in &endpoint.channels {
                        if !labels.contains(&channel.label) {
                            labels.push(channel.label.clone());
                        }
                    }
                }
            }

            for (this, that) in [(id, other_id), (other_id, id)] {
                if let Some(endpoint) = state.endpoints.get_mut(&this) {
                    endpoint.counterpart = Some(that);
                    for label in &labels {
                        if !endpoint.channels.iter().any(|c| &c.label == label) {
                            endpoint
                                .channels
                                .push(Arc::new(MemoryChannel::new(label, this, self)));
                        }
                    }
                    for channel in &endpoint.channels {
                        channel.open.store(true, Ordering::SeqCst);
                        opened.push((endpoint.events.clone(), channel.clone()));
                    }
                }
            }
            debug!("Memory endpoints {} and {} paired", id, other_id);
        }

        for (events, channel) in opened {
            events.channel_open(channel);
        }
    }

    fn close_endpoint(&self, id: u64) {
        let mut notify = Vec::new();
        {
            let mut state = self.state.lock();
            let counterpart = match state.endpoints.get_mut(&id) {
                Some(endpoint) if !endpoint.closed => {
                    endpoint.closed = true;
                    endpoint.counterpart
                }
                _ => return,
            };

            for endpoint_id in std::iter::once(id).chain(counterpart) {
                if let Some(endpoint) = state.endpoints.get(&endpoint_id) {
                    let mut was_open = false;
                    for channel in &endpoint.channels {
                        was_open |= channel.open.swap(false, Ordering::SeqCst);
                    }
                    if was_open {
                        notify.push(endpoint.events.clone());
                    }
                }
            }

            // Forget the pair once neither side is live
            let counterpart_live = counterpart
                .and_then(|other| state.endpoints.get(&other))
                .is_some_and(|other| !other.closed);
            if !counterpart_live {
                state.endpoints.remove(&id);
                if let Some(other) = counterpart {
                    state.endpoints.remove(&other);
                }
            }
        }

        for events in notify {
            events.channel_closed();
        }
    }
}

fn newest<'a>(state: &'a NetworkState, owner: &PeerId, remote: &PeerId) -> Option<&'a Endpoint> {
    state
        .endpoints
        .iter()
        .filter(|(_, endpoint)| &endpoint.owner == owner && &endpoint.remote == remote)
        .max_by_key(|(id, _)| **id)
        .map(|(_, endpoint)| endpoint)
}

/// Creates loopback links on behalf of one peer
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_link(&self, peer: &PeerId, events: LinkEvents) -> LinkResult<Arc<dyn PeerLink>> {
        let id = self
            .network
            .add_endpoint(self.local.clone(), peer.clone(), events);
        debug!("Memory link {} created from {} to {}", id, self.local, peer);
        Ok(Arc::new(MemoryLink {
            id,
            network: self.network.clone(),
        }))
    }
}

pub struct MemoryLink {
    id: u64,
    network: MemoryNetwork,
}

impl MemoryLink {
    fn with_endpoint<T>(&self, f: impl FnOnce(&mut Endpoint) -> LinkResult<T>) -> LinkResult<T> {
        let mut state = self.network.state.lock();
        match state.endpoints.get_mut(&self.id) {
            Some(endpoint) if !endpoint.closed => f(endpoint),
            _ => Err(LinkError::Closed),
        }
    }

    fn description(&self) -> String {
        format!("{}{}", SDP_PREFIX, self.id)
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_data_channel(&self, label: &str) -> LinkResult<Arc<dyn DataChannel>> {
        let channel = Arc::new(MemoryChannel::new(label, self.id, &self.network));
        self.with_endpoint(|endpoint| {
            endpoint.channels.push(channel.clone());
            Ok(())
        })?;
        Ok(channel)
    }

    async fn create_offer(&self) -> LinkResult<SessionDescription> {
        self.with_endpoint(|_| Ok(()))?;
        Ok(SessionDescription::offer(self.description()))
    }

    async fn create_answer(&self) -> LinkResult<SessionDescription> {
        self.with_endpoint(|endpoint| match endpoint.remote_endpoint {
            Some(_) => Ok(()),
            None => Err(LinkError::InvalidState("no remote offer to answer")),
        })?;
        Ok(SessionDescription::answer(self.description()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()> {
        let events = self.with_endpoint(|endpoint| {
            endpoint.local = Some(description);
            Ok(endpoint.events.clone())
        })?;

        events.local_candidate(IceCandidate::new(format!("{}memory {}", CANDIDATE_PREFIX, self.id)));
        self.network.try_pair(self.id);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()> {
        let remote_id = description
            .sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|id| id.parse::<u64>().ok())
            .filter(|id| self.network.state.lock().endpoints.contains_key(id))
            .ok_or_else(|| LinkError::InvalidDescription(description.sdp.clone()))?;

        self.with_endpoint(|endpoint| {
            endpoint.remote_endpoint = Some(remote_id);
            Ok(())
        })?;
        self.network.try_pair(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()> {
        self.with_endpoint(|endpoint| {
            if endpoint.remote_endpoint.is_none() {
                return Err(LinkError::InvalidState("remote description not set"));
            }
            if !candidate.candidate.starts_with(CANDIDATE_PREFIX) {
                return Err(LinkError::InvalidCandidate(candidate.candidate.clone()));
            }
            endpoint.applied.push(candidate);
            Ok(())
        })
    }

    async fn stats(&self) -> LinkResult<Vec<CandidatePairStats>> {
        let round_trip = self.network.state.lock().round_trip;
        self.with_endpoint(|endpoint| {
            let state = if endpoint.counterpart.is_some() {
                PairState::Succeeded
            } else {
                PairState::InProgress
            };
            Ok(vec![CandidatePairStats {
                state,
                current_round_trip_time: round_trip.as_secs_f64(),
                packets_lost: 0,
            }])
        })
    }

    async fn close(&self) {
        self.network.close_endpoint(self.id);
    }
}

pub struct MemoryChannel {
    label: String,
    endpoint: u64,
    open: AtomicBool,
    // Channels live inside the network state they point back to
    network: Weak<Mutex<NetworkState>>,
}

impl MemoryChannel {
    fn new(label: &str, endpoint: u64, network: &MemoryNetwork) -> Self {
        Self {
            label: label.to_string(),
            endpoint,
            open: AtomicBool::new(false),
            network: Arc::downgrade(&network.state),
        }
    }

    fn network(&self) -> Option<MemoryNetwork> {
        self.network.upgrade().map(|state| MemoryNetwork { state })
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }

        let network = self.network().ok_or(LinkError::Closed)?;
        let events = {
            let state = network.state.lock();
            state
                .endpoints
                .get(&self.endpoint)
                .and_then(|endpoint| endpoint.counterpart)
                .and_then(|counterpart| state.endpoints.get(&counterpart))
                .filter(|counterpart| !counterpart.closed)
                .map(|counterpart| counterpart.events.clone())
        };

        match events {
            Some(events) => {
                events.message(text);
                Ok(())
            }
            None => Err(LinkError::Closed),
        }
    }

    async fn close(&self) {
        if let Some(network) = self.network() {
            network.close_endpoint(self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LinkEvent, TaggedLinkEvent};
    use tokio::sync::mpsc;

    fn events(peer: &str) -> (LinkEvents, mpsc::UnboundedReceiver<TaggedLinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkEvents::new(PeerId::from(peer), 1, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedLinkEvent>) -> Vec<LinkEvent> {
        let mut seen = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            seen.push(tagged.event);
        }
        seen
    }

    #[tokio::test]
    async fn test_offer_answer_opens_channels() {
        let network = MemoryNetwork::new();
        let (a_events, mut a_rx) = events("b");
        let (b_events, mut b_rx) = events("a");
        let a = network.transport("a").create_link(&PeerId::from("b"), a_events).await.unwrap();
        let b = network.transport("b").create_link(&PeerId::from("a"), b_events).await.unwrap();

        let a_channel = a.create_data_channel("gameState").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        assert!(!a_channel.is_open());

        a.set_remote_description(answer).await.unwrap();
        assert!(a_channel.is_open());
        assert!(network.is_connected(&PeerId::from("a"), &PeerId::from("b")));

        let a_seen = drain(&mut a_rx);
        assert!(matches!(a_seen[0], LinkEvent::LocalCandidate(_)));
        assert!(matches!(a_seen[1], LinkEvent::ChannelOpen(_)));

        let b_channel = drain(&mut b_rx)
            .into_iter()
            .find_map(|event| match event {
                LinkEvent::ChannelOpen(channel) => Some(channel),
                _ => None,
            })
            .unwrap();
        assert_eq!(b_channel.label(), "gameState");

        a_channel.send_text("first".to_string()).await.unwrap();
        a_channel.send_text("second".to_string()).await.unwrap();
        let texts: Vec<String> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|event| match event {
                LinkEvent::Message(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let network = MemoryNetwork::new();
        let (a_events, _a_rx) = events("b");
        let a = network.transport("a").create_link(&PeerId::from("b"), a_events).await.unwrap();

        let early = a.add_ice_candidate(IceCandidate::new("candidate:memory 9")).await;
        assert!(matches!(early, Err(LinkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_malformed_description_rejected() {
        let network = MemoryNetwork::new();
        let (a_events, _a_rx) = events("b");
        let a = network.transport("a").create_link(&PeerId::from("b"), a_events).await.unwrap();

        let result = a
            .set_remote_description(SessionDescription::offer("v=0 garbage"))
            .await;
        assert!(matches!(result, Err(LinkError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn test_close_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (a_events, mut a_rx) = events("b");
        let (b_events, mut b_rx) = events("a");
        let a = network.transport("a").create_link(&PeerId::from("b"), a_events).await.unwrap();
        let b = network.transport("b").create_link(&PeerId::from("a"), b_events).await.unwrap();

        a.create_data_channel("gameState").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.close().await;

        assert!(matches!(drain(&mut a_rx).as_slice(), [LinkEvent::ChannelClosed]));
        assert!(matches!(drain(&mut b_rx).as_slice(), [LinkEvent::ChannelClosed]));
        assert!(matches!(a.create_offer().await, Err(LinkError::Closed)));
        assert_eq!(network.live_links(&PeerId::from("a")), 0);
        assert_eq!(network.live_links(&PeerId::from("b")), 1);
    }

    #[tokio::test]
    async fn test_closed_endpoints_are_reclaimed() {
        let network = MemoryNetwork::new();
        let (a_events, _a_rx) = events("b");
        let (b_events, _b_rx) = events("a");
        let (c_events, _c_rx) = events("b");
        let a = network.transport("a").create_link(&PeerId::from("b"), a_events).await.unwrap();
        let b = network.transport("b").create_link(&PeerId::from("a"), b_events).await.unwrap();
        let unpaired = network.transport("c").create_link(&PeerId::from("b"), c_events).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(network.state.lock().endpoints.len(), 3);

        unpaired.close().await;
        assert_eq!(network.state.lock().endpoints.len(), 2);

        // Kept while the counterpart is still live
        a.close().await;
        assert_eq!(network.state.lock().endpoints.len(), 2);
        assert!(matches!(
            b.add_ice_candidate(IceCandidate::new("candidate:memory 1")).await,
            Ok(())
        ));

        b.close().await;
        assert!(network.state.lock().endpoints.is_empty());
        assert_eq!(network.live_links(&PeerId::from("b")), 0);
    }
}
