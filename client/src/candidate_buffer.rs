//! Per-peer gate holding remote candidates until a remote description is applied
//!
//! Candidates can overtake the offer or answer they belong to, because the
//! handshake round trip is asynchronous. Each peer therefore gets a gate that
//! starts closed. While closed, candidates queue in receipt order. Opening the
//! gate hands the queue back exactly once; after that every candidate is
//! applied immediately.
//!
//! Entries are keyed by link generation as well as by peer. A candidate that
//! names another generation than the one currently gated for the peer starts
//! a fresh, closed entry, so nothing buffered for a replaced link can leak
//! into its successor.

use log::debug;
use shared::{IceCandidate, PeerId};
use std::collections::HashMap;

/// What to do with a candidate offered to the buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The gate is open, apply right away
    Apply(IceCandidate),
    /// Queued until the gate opens
    Buffered,
}

#[derive(Debug, Default)]
struct Gate {
    generation: u64,
    ready: bool,
    pending: Vec<IceCandidate>,
}

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    gates: HashMap<PeerId, Gate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, peer: &PeerId, generation: u64, candidate: IceCandidate) -> Admission {
        let gate = self.gate(peer, generation);

        if gate.ready {
            Admission::Apply(candidate)
        } else {
            gate.pending.push(candidate);
            debug!(
                "Buffered candidate for {} ({} pending)",
                peer,
                gate.pending.len()
            );
            Admission::Buffered
        }
    }

    /// Opens the gate for `peer`, returning the queued candidates in receipt order
    pub fn open(&mut self, peer: &PeerId, generation: u64) -> Vec<IceCandidate> {
        let gate = self.gate(peer, generation);
        gate.ready = true;
        std::mem::take(&mut gate.pending)
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.gates.remove(peer);
    }

    pub fn clear(&mut self) {
        self.gates.clear();
    }

    /// Number of candidates waiting for `peer`
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.gates.get(peer).map_or(0, |gate| gate.pending.len())
    }

    #[cfg(test)]
    fn is_ready(&self, peer: &PeerId, generation: u64) -> bool {
        self.gates
            .get(peer)
            .is_some_and(|gate| gate.generation == generation && gate.ready)
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    fn gate(&mut self, peer: &PeerId, generation: u64) -> &mut Gate {
        let gate = self.gates.entry(peer.clone()).or_insert_with(|| Gate {
            generation,
            ..Gate::default()
        });

        if gate.generation != generation {
            if !gate.pending.is_empty() {
                debug!(
                    "Discarding {} candidates of replaced link to {}",
                    gate.pending.len(),
                    peer
                );
            }
            *gate = Gate {
                generation,
                ..Gate::default()
            };
        }
        gate
    }
}
