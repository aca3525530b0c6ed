//! Per-link negotiation state machine
//!
//! Every link generation gets its own task. The task creates the link, runs
//! the initiator half of the handshake straight away when it has that role,
//! and then executes the commands the mesh forwards (remote offer, remote
//! answer, remote candidate) strictly one after the other. Progress and
//! outcomes are reported back through [`NegotiationHost`], which is also
//! asked whether the generation is still current before each state change.
//! A negotiation whose generation was replaced or removed stops silently.

use crate::error::LinkError;
use crate::signaling::OutboundSignal;
use crate::transport::{LinkEvents, PeerLink, Transport};
use log::{debug, warn};
use shared::{IceCandidate, PeerId, SessionDescription};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
}

impl LinkState {
    /// Whether `next` follows `self` on either negotiation path
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Offering) | (Offering, AwaitingAnswer) | (AwaitingAnswer, Connected) => true,
            (New, Answering) | (Answering, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::New => "new",
            LinkState::Offering => "offering",
            LinkState::AwaitingAnswer => "awaiting-answer",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Work forwarded by the mesh to a running negotiation
#[derive(Debug, Clone)]
pub enum NegotiatorCommand {
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    AddCandidate(IceCandidate),
}

/// The owner of the link bookkeeping, as seen by a negotiation
pub(crate) trait NegotiationHost: Send + Sync + 'static {
    /// Records a state change; `false` if the generation is no longer current
    fn advance(&self, peer: &PeerId, generation: u64, state: LinkState) -> bool;

    /// Hands over the freshly created link; `false` if the generation is no longer current
    fn attach_link(&self, peer: &PeerId, generation: u64, link: Arc<dyn PeerLink>) -> bool;

    /// Opens the candidate gate for the generation and returns what queued up behind it
    fn remote_description_applied(&self, peer: &PeerId, generation: u64) -> Option<Vec<IceCandidate>>;

    fn publish(&self, signal: OutboundSignal);

    /// Reports an unrecoverable negotiation error
    fn fail(&self, peer: &PeerId, generation: u64, error: LinkError);
}

/// Everything one negotiation task needs
pub(crate) struct Negotiation {
    pub peer: PeerId,
    pub generation: u64,
    pub role: Role,
    pub channel_label: String,
    pub transport: Arc<dyn Transport>,
    pub events: LinkEvents,
    pub commands: mpsc::UnboundedReceiver<NegotiatorCommand>,
}

enum Halt {
    /// The generation was replaced or the host is gone
    Abandoned,
    Failed(LinkError),
}

impl From<LinkError> for Halt {
    fn from(error: LinkError) -> Self {
        Halt::Failed(error)
    }
}

pub(crate) fn spawn_negotiation<H: NegotiationHost>(host: Weak<H>, negotiation: Negotiation) -> JoinHandle<()> {
    tokio::spawn(negotiation.run(host))
}

impl Negotiation {
    async fn run<H: NegotiationHost>(mut self, host: Weak<H>) {
        let link = match self
            .transport
            .create_link(&self.peer, self.events.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                if let Some(host) = host.upgrade() {
                    host.fail(&self.peer, self.generation, e);
                }
                return;
            }
        };

        let attached = host
            .upgrade()
            .is_some_and(|host| host.attach_link(&self.peer, self.generation, link.clone()));
        if !attached {
            debug!(
                "Link to {} (generation {}) no longer wanted",
                self.peer, self.generation
            );
            link.close().await;
            return;
        }

        match self.drive(&host, link.as_ref()).await {
            Ok(()) => debug!(
                "Negotiation with {} (generation {}) finished",
                self.peer, self.generation
            ),
            Err(Halt::Abandoned) => debug!(
                "Negotiation with {} (generation {}) abandoned",
                self.peer, self.generation
            ),
            Err(Halt::Failed(e)) => {
                if let Some(host) = host.upgrade() {
                    host.fail(&self.peer, self.generation, e);
                }
            }
        }
    }

    async fn drive<H: NegotiationHost>(&mut self, host: &Weak<H>, link: &dyn PeerLink) -> Result<(), Halt> {
        if self.role == Role::Initiator {
            self.advance(host, LinkState::Offering)?;
            link.create_data_channel(&self.channel_label).await?;
            let offer = link.create_offer().await?;
            self.advance(host, LinkState::AwaitingAnswer)?;

            // Published before gathering starts so no local candidate can overtake it
            self.publish(
                host,
                OutboundSignal::Offer {
                    target_id: self.peer.clone(),
                    offer: offer.clone(),
                },
            )?;
            link.set_local_description(offer).await?;
        }

        while let Some(command) = self.commands.recv().await {
            match command {
                NegotiatorCommand::RemoteOffer(offer) => {
                    if self.role != Role::Responder {
                        warn!("Ignoring offer from {} on an initiated link", self.peer);
                        continue;
                    }
                    self.advance(host, LinkState::Answering)?;
                    link.set_remote_description(offer).await?;
                    self.apply_buffered(host, link).await?;

                    let answer = link.create_answer().await?;
                    link.set_local_description(answer.clone()).await?;
                    self.publish(
                        host,
                        OutboundSignal::Answer {
                            target_id: self.peer.clone(),
                            answer,
                        },
                    )?;
                    self.advance(host, LinkState::Connected)?;
                }
                NegotiatorCommand::RemoteAnswer(answer) => {
                    link.set_remote_description(answer).await?;
                    self.apply_buffered(host, link).await?;
                    self.advance(host, LinkState::Connected)?;
                }
                NegotiatorCommand::AddCandidate(candidate) => {
                    link.add_ice_candidate(candidate).await?;
                }
            }
        }

        Ok(())
    }

    async fn apply_buffered<H: NegotiationHost>(&self, host: &Weak<H>, link: &dyn PeerLink) -> Result<(), Halt> {
        let buffered = host
            .upgrade()
            .and_then(|host| host.remote_description_applied(&self.peer, self.generation))
            .ok_or(Halt::Abandoned)?;

        if !buffered.is_empty() {
            debug!(
                "Applying {} buffered candidates for {}",
                buffered.len(),
                self.peer
            );
        }
        for candidate in buffered {
            link.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn advance<H: NegotiationHost>(&self, host: &Weak<H>, state: LinkState) -> Result<(), Halt> {
        match host.upgrade() {
            Some(host) if host.advance(&self.peer, self.generation, state) => Ok(()),
            _ => Err(Halt::Abandoned),
        }
    }

    fn publish<H: NegotiationHost>(&self, host: &Weak<H>, signal: OutboundSignal) -> Result<(), Halt> {
        let host = host.upgrade().ok_or(Halt::Abandoned)?;
        host.publish(signal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate_buffer::CandidateBuffer;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::TaggedLinkEvent;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        current: Mutex<u64>,
        states: Mutex<Vec<LinkState>>,
        published: Mutex<Vec<OutboundSignal>>,
        failures: Mutex<Vec<String>>,
        buffer: Mutex<CandidateBuffer>,
        attached: Mutex<usize>,
    }

    impl NegotiationHost for Recorder {
        fn advance(&self, _peer: &PeerId, generation: u64, state: LinkState) -> bool {
            if generation != *self.current.lock() {
                return false;
            }
            self.states.lock().push(state);
            true
        }

        fn attach_link(&self, _peer: &PeerId, generation: u64, _link: Arc<dyn PeerLink>) -> bool {
            *self.attached.lock() += 1;
            generation == *self.current.lock()
        }

        fn remote_description_applied(&self, peer: &PeerId, generation: u64) -> Option<Vec<IceCandidate>> {
            Some(self.buffer.lock().open(peer, generation))
        }

        fn publish(&self, signal: OutboundSignal) {
            self.published.lock().push(signal);
        }

        fn fail(&self, _peer: &PeerId, _generation: u64, error: LinkError) {
            self.failures.lock().push(error.to_string());
        }
    }

    struct Harness {
        network: MemoryNetwork,
        host: Arc<Recorder>,
        commands: mpsc::UnboundedSender<NegotiatorCommand>,
        _events: mpsc::UnboundedReceiver<TaggedLinkEvent>,
        handle: JoinHandle<()>,
    }

    /// Starts a negotiation run by "a" towards "b"
    fn start(role: Role, generation: u64, current: u64) -> Harness {
        let network = MemoryNetwork::new();
        let host = Arc::new(Recorder::default());
        *host.current.lock() = current;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let negotiation = Negotiation {
            peer: PeerId::from("b"),
            generation,
            role,
            channel_label: "gameState".to_string(),
            transport: Arc::new(network.transport("a")),
            events: LinkEvents::new(PeerId::from("b"), generation, event_tx),
            commands: command_rx,
        };
        let handle = spawn_negotiation(Arc::downgrade(&host), negotiation);

        Harness {
            network,
            host,
            commands: command_tx,
            _events: event_rx,
            handle,
        }
    }

    /// A link owned by "b" towards "a", driven by hand
    async fn remote_link(network: &MemoryNetwork) -> Arc<dyn PeerLink> {
        let (tx, _rx) = mpsc::unbounded_channel();
        network
            .transport("b")
            .create_link(&PeerId::from("a"), LinkEvents::new(PeerId::from("a"), 1, tx))
            .await
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_state_transitions() {
        use LinkState::*;

        assert!(New.can_transition_to(Offering));
        assert!(Offering.can_transition_to(AwaitingAnswer));
        assert!(AwaitingAnswer.can_transition_to(Connected));
        assert!(New.can_transition_to(Answering));
        assert!(Answering.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(New.can_transition_to(Closed));

        assert!(!New.can_transition_to(Connected));
        assert!(!Offering.can_transition_to(Answering));
        assert!(!Closed.can_transition_to(New));
        assert!(!Connected.can_transition_to(Offering));
    }

    #[tokio::test]
    async fn test_initiator_offers_then_connects_on_answer() {
        let harness = start(Role::Initiator, 1, 1);
        settle().await;

        assert_eq!(
            *harness.host.states.lock(),
            vec![LinkState::Offering, LinkState::AwaitingAnswer]
        );
        let offer = match harness.host.published.lock().first().cloned() {
            Some(OutboundSignal::Offer { target_id, offer }) => {
                assert_eq!(target_id, PeerId::from("b"));
                offer
            }
            other => panic!("Expected an offer, got {:?}", other),
        };

        let remote = remote_link(&harness.network).await;
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();

        harness
            .commands
            .send(NegotiatorCommand::RemoteAnswer(answer))
            .unwrap();
        settle().await;

        assert_eq!(harness.host.states.lock().last(), Some(&LinkState::Connected));
        assert!(harness
            .network
            .is_connected(&PeerId::from("a"), &PeerId::from("b")));
        assert!(harness.host.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_responder_applies_buffered_candidates_in_order() {
        let harness = start(Role::Responder, 1, 1);
        let peer = PeerId::from("b");

        let candidates: Vec<IceCandidate> = (1..=3)
            .map(|n| IceCandidate::new(format!("candidate:{} early", n)))
            .collect();
        for candidate in &candidates {
            harness.host.buffer.lock().admit(&peer, 1, candidate.clone());
        }
        settle().await;
        assert!(harness
            .network
            .applied_candidates(&PeerId::from("a"), &peer)
            .is_empty());

        let remote = remote_link(&harness.network).await;
        remote.create_data_channel("gameState").await.unwrap();
        let offer = remote.create_offer().await.unwrap();
        remote.set_local_description(offer.clone()).await.unwrap();

        harness
            .commands
            .send(NegotiatorCommand::RemoteOffer(offer))
            .unwrap();
        settle().await;

        assert_eq!(
            harness.network.applied_candidates(&PeerId::from("a"), &peer),
            candidates
        );
        assert_eq!(
            *harness.host.states.lock(),
            vec![LinkState::Answering, LinkState::Connected]
        );
        assert!(matches!(
            harness.host.published.lock().as_slice(),
            [OutboundSignal::Answer { .. }]
        ));
    }

    #[tokio::test]
    async fn test_malformed_offer_fails_link() {
        let harness = start(Role::Responder, 1, 1);
        harness
            .commands
            .send(NegotiatorCommand::RemoteOffer(SessionDescription::offer("garbage")))
            .unwrap();

        tokio::time::timeout(Duration::from_millis(500), harness.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(harness.host.failures.lock().len(), 1);
        assert!(harness.host.published.lock().is_empty());
        assert!(!harness.host.states.lock().contains(&LinkState::Connected));
    }

    #[tokio::test]
    async fn test_replaced_generation_closes_link_silently() {
        let harness = start(Role::Initiator, 1, 2);
        tokio::time::timeout(Duration::from_millis(500), harness.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*harness.host.attached.lock(), 1);
        assert!(harness.host.states.lock().is_empty());
        assert!(harness.host.published.lock().is_empty());
        assert!(harness.host.failures.lock().is_empty());
        assert_eq!(harness.network.live_links(&PeerId::from("a")), 0);
    }

    #[tokio::test]
    async fn test_dropped_command_queue_ends_task() {
        let harness = start(Role::Responder, 1, 1);
        settle().await;
        drop(harness.commands);

        tokio::time::timeout(Duration::from_millis(500), harness.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(harness.host.failures.lock().is_empty());
    }
}
