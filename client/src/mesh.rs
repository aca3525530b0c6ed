//! Peer mesh manager
//!
//! [`PeerMesh`] turns "the players in my room" into one data channel per
//! remote player. It listens to the signaling stream, decides per remote
//! peer whether to offer or to answer, forwards negotiation traffic to the
//! per-link negotiator tasks and fans application payloads out over every
//! open channel.
//!
//! All bookkeeping sits behind one mutex that is never held across an
//! `.await`. Public operations are therefore plain synchronous calls, and a
//! teardown is complete (from the caller's point of view) when `destroy`
//! returns; the transport-level closing happens afterwards in spawned tasks.
//!
//! Every link carries a generation number. Events coming back from
//! transports and negotiators name the generation they belong to, and
//! anything that names a replaced or removed generation is dropped.

use crate::candidate_buffer::{Admission, CandidateBuffer};
use crate::config::MeshConfig;
use crate::error::LinkError;
use crate::health::{self, PeerStats, StatsSource, StatsTable};
use crate::negotiator::{
    spawn_negotiation, LinkState, Negotiation, NegotiationHost, NegotiatorCommand, Role,
};
use crate::room::MembershipTransition;
use crate::signaling::{OutboundSignal, SignalEvent, SignalStream, SignalingChannel};
use crate::transport::{DataChannel, LinkEvent, LinkEvents, PeerLink, TaggedLinkEvent, Transport};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use shared::{IceCandidate, PeerId, Player, Room, SessionDescription};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type StateCallback = Arc<dyn Fn(Value) + Send + Sync>;
type PeerCallback = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Single-slot hooks; registering again replaces the previous one
#[derive(Default)]
struct Hooks {
    state_update: Option<StateCallback>,
    on_connected: Option<PeerCallback>,
    before_destroy: Option<PeerCallback>,
}

struct LinkEntry {
    generation: u64,
    role: Role,
    state: LinkState,
    link: Option<Arc<dyn PeerLink>>,
    commands: mpsc::UnboundedSender<NegotiatorCommand>,
    connected_notified: bool,
}

struct ChannelEntry {
    generation: u64,
    channel: Arc<dyn DataChannel>,
    outbound: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

/// Link and channel taken out of the mesh, still to be closed
#[derive(Default)]
struct Detached {
    link: Option<Arc<dyn PeerLink>>,
    channel: Option<ChannelEntry>,
}

#[derive(Default)]
struct MeshState {
    active: bool,
    previous_room: Option<Room>,
    is_master: bool,
    members: HashSet<PeerId>,
    links: HashMap<PeerId, LinkEntry>,
    channels: HashMap<PeerId, ChannelEntry>,
    candidates: CandidateBuffer,
    next_generation: u64,
}

impl MeshState {
    fn is_current(&self, peer: &PeerId, generation: u64) -> bool {
        self.links
            .get(peer)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Removes everything held for `peer`
    fn detach(&mut self, peer: &PeerId) -> Detached {
        self.candidates.remove(peer);
        Detached {
            link: self.links.remove(peer).and_then(|entry| entry.link),
            channel: self.channels.remove(peer),
        }
    }
}

struct MeshShared {
    local_id: PeerId,
    signaling: Arc<dyn SignalingChannel>,
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    runtime: Handle,
    state: Mutex<MeshState>,
    hooks: Mutex<Hooks>,
    stats: StatsTable,
    link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
    // Background tasks stop once this is dropped
    _shutdown: watch::Sender<()>,
}

/// Handle to the peer mesh of one client
///
/// Cloning is cheap and every clone drives the same mesh. Hooks that need
/// the mesh themselves should capture a [`WeakPeerMesh`] to avoid keeping it
/// alive through its own hook.
#[derive(Clone)]
pub struct PeerMesh {
    shared: Arc<MeshShared>,
}

/// Non-owning counterpart of [`PeerMesh`]
#[derive(Clone)]
pub struct WeakPeerMesh {
    shared: Weak<MeshShared>,
}

impl WeakPeerMesh {
    pub fn upgrade(&self) -> Option<PeerMesh> {
        self.shared.upgrade().map(|shared| PeerMesh { shared })
    }
}

impl PeerMesh {
    /// Creates the mesh and starts listening to `signaling`
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        transport: Arc<dyn Transport>,
        config: MeshConfig,
    ) -> Self {
        let runtime = Handle::current();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let signals = signaling.subscribe();
        let stats_interval = config.stats_interval;

        let shared = Arc::new(MeshShared {
            local_id: signaling.local_id(),
            signaling,
            transport,
            config,
            runtime: runtime.clone(),
            state: Mutex::new(MeshState::default()),
            hooks: Mutex::new(Hooks::default()),
            stats: StatsTable::new(),
            link_events: link_tx,
            _shutdown: shutdown_tx,
        });

        let weak = Arc::downgrade(&shared);
        runtime.spawn(signal_pump(weak.clone(), signals, shutdown_rx.clone()));
        runtime.spawn(link_event_pump(weak.clone(), link_rx, shutdown_rx));
        health::spawn_monitor(weak, stats_interval);

        info!("Peer mesh created for {}", shared.local_id);
        PeerMesh { shared }
    }

    pub fn downgrade(&self) -> WeakPeerMesh {
        WeakPeerMesh {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local_id.clone()
    }

    /// Applies a new room snapshot, or `None` once the client left its room
    ///
    /// Entering a room starts listening for peer events. Leaving it, or the
    /// room's game going from started to not started, tears the whole mesh
    /// down. Moving straight to a different room does both.
    pub fn on_room_membership_changed(&self, room: Option<Room>) {
        self.shared.on_room_membership_changed(room);
    }

    /// Processes one inbound signaling event
    ///
    /// The mesh calls this itself for every event of its signaling channel;
    /// it is public for drivers that feed events from elsewhere.
    pub fn handle_signal(&self, event: SignalEvent) {
        self.shared.handle_signal(event);
    }

    /// Registers the consumer of every inbound payload, replacing the previous one
    pub fn set_state_update_callback<F>(&self, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().state_update = Some(Arc::new(callback));
    }

    /// Called the first time a channel opens for a peer
    pub fn set_on_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().on_connected = Some(Arc::new(callback));
    }

    /// Called with the local identity right before a teardown, while channels are still open
    pub fn set_before_destroy_callback<F>(&self, callback: F)
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().before_destroy = Some(Arc::new(callback));
    }

    /// Serializes `payload` to JSON and queues it on every open channel
    ///
    /// Returns the number of channels written to. Channels that are not open
    /// are skipped without queueing.
    pub fn broadcast_game_state<T: Serialize + ?Sized>(&self, payload: &T) -> usize {
        self.shared.broadcast(payload)
    }

    /// Tears the mesh down; every link is gone when this returns
    pub fn destroy(&self) {
        self.shared.teardown();
    }

    /// Number of tracked links, open or not
    pub fn peers_len(&self) -> usize {
        self.shared.state.lock().links.len()
    }

    /// Number of channels currently open
    pub fn open_channels(&self) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .values()
            .filter(|entry| entry.channel.is_open())
            .count()
    }

    /// Peers with a tracked link, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.state.lock().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerStats> {
        self.shared.stats.get(peer)
    }

    pub fn is_master_peer(&self) -> bool {
        self.shared.state.lock().is_master
    }

    /// Whether peer and negotiation events are currently acted upon
    pub fn is_listening(&self) -> bool {
        self.shared.state.lock().active
    }

    pub fn link_state(&self, peer: &PeerId) -> Option<LinkState> {
        self.shared.state.lock().links.get(peer).map(|entry| entry.state)
    }

    pub fn link_role(&self, peer: &PeerId) -> Option<Role> {
        self.shared.state.lock().links.get(peer).map(|entry| entry.role)
    }

    /// Remote candidates waiting for `peer`'s remote description
    pub fn pending_candidates(&self, peer: &PeerId) -> usize {
        self.shared.state.lock().candidates.pending(peer)
    }
}

async fn signal_pump(
    owner: Weak<MeshShared>,
    mut signals: SignalStream,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = signals.recv() => {
                let Some(event) = received else {
                    info!("Signaling stream closed");
                    break;
                };
                let Some(mesh) = owner.upgrade() else {
                    break;
                };
                mesh.handle_signal(event);
            }
        }
    }
}

async fn link_event_pump(
    owner: Weak<MeshShared>,
    mut events: mpsc::UnboundedReceiver<TaggedLinkEvent>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = events.recv() => {
                let (Some(event), Some(mesh)) = (received, owner.upgrade()) else {
                    break;
                };
                mesh.handle_link_event(event);
            }
        }
    }
}

impl MeshShared {
    fn on_room_membership_changed(self: &Arc<Self>, current: Option<Room>) {
        let transition = {
            let state = self.state.lock();
            MembershipTransition::between(state.previous_room.as_ref(), current.as_ref())
        };

        if transition.tears_down() {
            self.teardown();
        }

        let mut pruned = Vec::new();
        {
            let mut state = self.state.lock();
            state.previous_room = current.clone();

            if let Some(room) = &current {
                if transition.enters() {
                    state.active = true;
                    info!(
                        "Entered room {} ({} players), listening for peers",
                        room.id,
                        room.players.len()
                    );
                }

                state.is_master = room.is_master(&self.local_id);
                state.members = room
                    .others(&self.local_id)
                    .map(|player| player.id.clone())
                    .collect();

                let gone: Vec<PeerId> = state
                    .links
                    .keys()
                    .filter(|peer| !state.members.contains(*peer))
                    .cloned()
                    .collect();
                for peer in gone {
                    info!("Peer {} no longer in room {}, dropping link", peer, room.id);
                    pruned.push(state.detach(&peer));
                    self.stats.remove(&peer);
                }
            }
        }

        self.close_detached(pruned);
    }

    fn handle_signal(self: &Arc<Self>, event: SignalEvent) {
        if let SignalEvent::RoomChanged(room) = event {
            self.on_room_membership_changed(room);
            return;
        }

        if !self.state.lock().active {
            debug!("Not in a room, ignoring {:?}", event);
            return;
        }

        match event {
            SignalEvent::PeerJoined {
                peer,
                should_initiate,
                is_master,
            } => self.on_peer_joined(peer, should_initiate, is_master),
            SignalEvent::PeerLeft {
                peer_id,
                new_master_id,
            } => self.on_peer_left(&peer_id, new_master_id.as_ref()),
            SignalEvent::Offer { from, offer } => self.on_offer(from, offer),
            SignalEvent::Answer { from, answer } => self.on_answer(&from, answer),
            SignalEvent::IceCandidate { from, candidate } => {
                self.on_remote_candidate(&from, candidate)
            }
            SignalEvent::RoomChanged(_) => {}
        }
    }

    fn on_peer_joined(self: &Arc<Self>, peer: Player, should_initiate: bool, is_master: bool) {
        if peer.id == self.local_id {
            warn!("Ignoring join notification about ourselves");
            return;
        }

        // The master flag only ever comes from room snapshots
        debug!(
            "Join of {} announced master flag {}, keeping snapshot value",
            peer.id, is_master
        );
        info!("Peer {} ({}) joined", peer.id, peer.name);

        let replaced = {
            let mut state = self.state.lock();
            state.members.insert(peer.id.clone());
            if !should_initiate {
                return;
            }
            self.start_link(&mut state, peer.id, Role::Initiator).0
        };
        self.close_detached(vec![replaced]);
    }

    fn on_peer_left(self: &Arc<Self>, peer: &PeerId, new_master_id: Option<&PeerId>) {
        info!("Peer {} left", peer);
        if let Some(master) = new_master_id {
            debug!("Room master is now {}", master);
        }

        let detached = {
            let mut state = self.state.lock();
            state.members.remove(peer);
            state.detach(peer)
        };
        self.stats.remove(peer);
        self.close_detached(vec![detached]);
    }

    fn on_offer(self: &Arc<Self>, from: PeerId, offer: SessionDescription) {
        let replaced = {
            let mut state = self.state.lock();
            if !state.members.contains(&from) {
                warn!("Dropping offer from {} who is not in the room", from);
                return;
            }

            debug!("Offer from {}", from);
            let (replaced, commands) = self.start_link(&mut state, from, Role::Responder);
            let _ = commands.send(NegotiatorCommand::RemoteOffer(offer));
            replaced
        };
        self.close_detached(vec![replaced]);
    }

    fn on_answer(&self, from: &PeerId, answer: SessionDescription) {
        let state = self.state.lock();
        match state.links.get(from) {
            Some(entry) if entry.role == Role::Initiator && entry.state == LinkState::AwaitingAnswer => {
                debug!("Answer from {}", from);
                let _ = entry.commands.send(NegotiatorCommand::RemoteAnswer(answer));
            }
            Some(entry) => warn!(
                "Dropping answer from {}: link is {:?} in state {}",
                from, entry.role, entry.state
            ),
            None => warn!("Dropping answer from unknown peer {}", from),
        }
    }

    fn on_remote_candidate(&self, from: &PeerId, candidate: IceCandidate) {
        let mut state = self.state.lock();
        let Some((generation, commands)) = state
            .links
            .get(from)
            .map(|entry| (entry.generation, entry.commands.clone()))
        else {
            warn!("Dropping candidate from unknown peer {}", from);
            return;
        };

        match state.candidates.admit(from, generation, candidate) {
            Admission::Apply(candidate) => {
                let _ = commands.send(NegotiatorCommand::AddCandidate(candidate));
            }
            Admission::Buffered => {}
        }
    }

    /// Registers a new link generation for `peer`, replacing any previous one
    fn start_link(
        self: &Arc<Self>,
        state: &mut MeshState,
        peer: PeerId,
        role: Role,
    ) -> (Detached, mpsc::UnboundedSender<NegotiatorCommand>) {
        let replaced = state.detach(&peer);
        if replaced.link.is_some() || replaced.channel.is_some() {
            info!("Replacing existing link to {}", peer);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (commands, command_rx) = mpsc::unbounded_channel();

        state.links.insert(
            peer.clone(),
            LinkEntry {
                generation,
                role,
                state: LinkState::New,
                link: None,
                commands: commands.clone(),
                connected_notified: false,
            },
        );
        info!("Creating link to {} as {:?}", peer, role);

        let negotiation = Negotiation {
            events: LinkEvents::new(peer.clone(), generation, self.link_events.clone()),
            peer,
            generation,
            role,
            channel_label: self.config.channel_label.clone(),
            transport: self.transport.clone(),
            commands: command_rx,
        };
        let _guard = self.runtime.enter();
        spawn_negotiation(Arc::downgrade(self), negotiation);

        (replaced, commands)
    }

    fn handle_link_event(self: &Arc<Self>, tagged: TaggedLinkEvent) {
        let TaggedLinkEvent {
            peer,
            generation,
            event,
        } = tagged;

        let mut state = self.state.lock();
        if !state.is_current(&peer, generation) {
            debug!(
                "Dropping {:?} from replaced link to {} (generation {})",
                event, peer, generation
            );
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                drop(state);
                self.send_signal(OutboundSignal::IceCandidate {
                    target_id: peer,
                    candidate,
                });
            }
            LinkEvent::ChannelOpen(channel) => {
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let writer = self
                    .runtime
                    .spawn(channel_writer(peer.clone(), channel.clone(), outbound_rx));
                state.channels.insert(
                    peer.clone(),
                    ChannelEntry {
                        generation,
                        channel,
                        outbound,
                        writer,
                    },
                );

                let first_open = match state.links.get_mut(&peer) {
                    Some(entry) if !entry.connected_notified => {
                        entry.connected_notified = true;
                        true
                    }
                    _ => false,
                };
                drop(state);

                info!("Channel to {} open", peer);
                if first_open {
                    let hook = self.hooks.lock().on_connected.clone();
                    if let Some(hook) = hook {
                        hook(&peer);
                    }
                }
            }
            LinkEvent::Message(text) => {
                drop(state);
                self.deliver(&peer, &text);
            }
            LinkEvent::ChannelClosed => {
                let same_generation = state
                    .channels
                    .get(&peer)
                    .is_some_and(|entry| entry.generation == generation);
                if same_generation {
                    state.channels.remove(&peer);
                    info!("Channel to {} closed", peer);
                }
            }
        }
    }

    fn deliver(&self, peer: &PeerId, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed payload from {}: {}", peer, e);
                return;
            }
        };

        let callback = self.hooks.lock().state_update.clone();
        match callback {
            Some(callback) => callback(payload),
            None => debug!("No consumer for payload from {}", peer),
        }
    }

    fn broadcast<T: Serialize + ?Sized>(&self, payload: &T) -> usize {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize game state: {}", e);
                return 0;
            }
        };

        let state = self.state.lock();
        let mut written = 0;
        for (peer, entry) in &state.channels {
            if entry.channel.is_open() && entry.outbound.send(text.clone()).is_ok() {
                written += 1;
            } else {
                debug!("Skipping broadcast to {}, channel not open", peer);
            }
        }
        written
    }

    fn send_signal(&self, signal: OutboundSignal) {
        let target = signal.target().clone();
        if let Err(e) = self.signaling.send(signal) {
            warn!("Failed to send signal to {}: {}", target, e);
        }
    }

    fn teardown(self: &Arc<Self>) {
        let had_anything = {
            let state = self.state.lock();
            state.active || !state.links.is_empty()
        };
        if !had_anything {
            return;
        }

        let hook = self.hooks.lock().before_destroy.clone();
        if let Some(hook) = hook {
            hook(&self.local_id);
        }

        let detached: Vec<Detached> = {
            let mut state = self.state.lock();
            let mut channels = std::mem::take(&mut state.channels);
            let mut detached: Vec<Detached> = state
                .links
                .drain()
                .map(|(peer, entry)| Detached {
                    link: entry.link,
                    channel: channels.remove(&peer),
                })
                .collect();
            detached.extend(channels.into_values().map(|channel| Detached {
                link: None,
                channel: Some(channel),
            }));

            state.candidates.clear();
            state.members.clear();
            state.previous_room = None;
            state.is_master = false;
            state.active = false;
            detached
        };
        self.stats.clear();

        info!("Mesh torn down, closing {} links", detached.len());
        self.close_detached(detached);
    }

    /// Closes links and channels in the background, flushing queued writes first
    fn close_detached(&self, detached: Vec<Detached>) {
        for Detached { link, channel } in detached {
            if link.is_none() && channel.is_none() {
                continue;
            }

            self.runtime.spawn(async move {
                if let Some(ChannelEntry {
                    channel,
                    outbound,
                    writer,
                    ..
                }) = channel
                {
                    drop(outbound);
                    let _ = writer.await;
                    channel.close().await;
                }
                if let Some(link) = link {
                    link.close().await;
                }
            });
        }
    }
}

/// Writes queued payloads to one channel, in order
async fn channel_writer(
    peer: PeerId,
    channel: Arc<dyn DataChannel>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outbound.recv().await {
        if let Err(e) = channel.send_text(text).await {
            debug!("Dropped payload for {}: {}", peer, e);
        }
    }
}

impl NegotiationHost for MeshShared {
    fn advance(&self, peer: &PeerId, generation: u64, next: LinkState) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state
            .links
            .get_mut(peer)
            .filter(|entry| entry.generation == generation)
        else {
            return false;
        };

        if entry.state.can_transition_to(next) {
            debug!("Link to {}: {} -> {}", peer, entry.state, next);
            entry.state = next;
            if next == LinkState::Connected {
                info!("Link to {} connected", peer);
            }
        } else {
            warn!(
                "Unexpected transition {} -> {} on link to {}",
                entry.state, next, peer
            );
        }
        true
    }

    fn attach_link(&self, peer: &PeerId, generation: u64, link: Arc<dyn PeerLink>) -> bool {
        let mut state = self.state.lock();
        match state
            .links
            .get_mut(peer)
            .filter(|entry| entry.generation == generation)
        {
            Some(entry) => {
                entry.link = Some(link);
                true
            }
            None => false,
        }
    }

    fn remote_description_applied(&self, peer: &PeerId, generation: u64) -> Option<Vec<IceCandidate>> {
        let mut state = self.state.lock();
        if !state.is_current(peer, generation) {
            return None;
        }
        Some(state.candidates.open(peer, generation))
    }

    fn publish(&self, signal: OutboundSignal) {
        self.send_signal(signal);
    }

    fn fail(&self, peer: &PeerId, generation: u64, error: LinkError) {
        error!("Negotiation with {} failed: {}", peer, error);

        let detached = {
            let mut state = self.state.lock();
            if !state.is_current(peer, generation) {
                return;
            }
            state.detach(peer)
        };
        self.stats.remove(peer);
        self.close_detached(vec![detached]);
    }
}

impl StatsSource for MeshShared {
    fn sample_targets(&self) -> Vec<(PeerId, u64, Arc<dyn PeerLink>)> {
        self.state
            .lock()
            .links
            .iter()
            .filter_map(|(peer, entry)| {
                entry
                    .link
                    .clone()
                    .map(|link| (peer.clone(), entry.generation, link))
            })
            .collect()
    }

    fn record_sample(&self, peer: PeerId, generation: u64, stats: PeerStats) {
        let state = self.state.lock();
        if state.is_current(&peer, generation) {
            self.stats.record(peer, stats);
        }
    }
}
