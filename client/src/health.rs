//! Link health monitoring for per-peer connection diagnostics

use crate::transport::PeerLink;
use log::debug;
use parking_lot::RwLock;
use shared::{timestamp_ms, PeerId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// State of one candidate pair as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// One candidate-pair sample, in transport units
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePairStats {
    pub state: PairState,
    /// Seconds
    pub current_round_trip_time: f64,
    pub packets_lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionQuality::Excellent => "Excellent",
            ConnectionQuality::Good => "Good",
            ConnectionQuality::Fair => "Fair",
            ConnectionQuality::Poor => "Poor",
        };
        f.write_str(label)
    }
}

/// Latest statistics sampled for one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    pub rtt_ms: f64,
    pub packets_lost: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl PeerStats {
    /// Builds a snapshot from the first succeeded pair, if any
    pub fn from_pairs(pairs: &[CandidatePairStats], timestamp: u64) -> Option<Self> {
        pairs
            .iter()
            .find(|pair| pair.state == PairState::Succeeded)
            .map(|pair| PeerStats {
                rtt_ms: pair.current_round_trip_time * 1000.0,
                packets_lost: pair.packets_lost,
                timestamp,
            })
    }

    pub fn quality(&self) -> ConnectionQuality {
        if self.rtt_ms < 50.0 {
            ConnectionQuality::Excellent
        } else if self.rtt_ms < 100.0 {
            ConnectionQuality::Good
        } else if self.rtt_ms < 200.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// Per-peer snapshots, overwritten on every sample
#[derive(Default)]
pub struct StatsTable {
    stats: RwLock<HashMap<PeerId, PeerStats>>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: PeerId, stats: PeerStats) {
        self.stats.write().insert(peer, stats);
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerStats> {
        self.stats.read().get(peer).cloned()
    }

    pub fn remove(&self, peer: &PeerId) {
        self.stats.write().remove(peer);
    }

    pub fn clear(&self) {
        self.stats.write().clear();
    }

    pub fn len(&self) -> usize {
        self.stats.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.read().is_empty()
    }
}

/// The monitor's view of whoever owns the links
pub(crate) trait StatsSource: Send + Sync + 'static {
    /// Links to sample, with the generation each belongs to
    fn sample_targets(&self) -> Vec<(PeerId, u64, Arc<dyn PeerLink>)>;

    /// Stores a sample unless the link generation has since been replaced
    fn record_sample(&self, peer: PeerId, generation: u64, stats: PeerStats);
}

/// Samples every link of `source` once per `period` until the source is dropped
///
/// A link whose statistics take longer than one period is skipped for that tick.
pub(crate) fn spawn_monitor<S: StatsSource>(source: Weak<S>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(owner) = source.upgrade() else {
                break;
            };

            for (peer, generation, link) in owner.sample_targets() {
                let source = source.clone();
                tokio::spawn(async move {
                    let pairs = match timeout(period, link.stats()).await {
                        Ok(Ok(pairs)) => pairs,
                        Ok(Err(e)) => {
                            debug!("Stats for {} unavailable: {}", peer, e);
                            return;
                        }
                        Err(_) => {
                            debug!("Stats for {} timed out", peer);
                            return;
                        }
                    };

                    if let (Some(stats), Some(owner)) =
                        (PeerStats::from_pairs(&pairs, timestamp_ms()), source.upgrade())
                    {
                        owner.record_sample(peer, generation, stats);
                    }
                });
            }
        }

        debug!("Health monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LinkError, LinkResult};
    use crate::transport::DataChannel;
    use assert_approx_eq::assert_approx_eq;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shared::{IceCandidate, SessionDescription};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair(state: PairState, rtt_secs: f64) -> CandidatePairStats {
        CandidatePairStats {
            state,
            current_round_trip_time: rtt_secs,
            packets_lost: 3,
        }
    }

    #[test]
    fn test_snapshot_uses_succeeded_pair() {
        let pairs = vec![
            pair(PairState::InProgress, 0.5),
            pair(PairState::Succeeded, 0.042),
        ];
        let stats = PeerStats::from_pairs(&pairs, 1234).unwrap();

        assert_approx_eq!(stats.rtt_ms, 42.0, 1e-9);
        assert_eq!(stats.packets_lost, 3);
        assert_eq!(stats.timestamp, 1234);
    }

    #[test]
    fn test_no_succeeded_pair() {
        let pairs = vec![pair(PairState::Waiting, 0.0), pair(PairState::Failed, 0.0)];
        assert!(PeerStats::from_pairs(&pairs, 0).is_none());
    }

    #[test]
    fn test_quality_thresholds() {
        let quality = |rtt_ms: f64| {
            PeerStats {
                rtt_ms,
                packets_lost: 0,
                timestamp: 0,
            }
            .quality()
        };

        assert_eq!(quality(10.0), ConnectionQuality::Excellent);
        assert_eq!(quality(50.0), ConnectionQuality::Good);
        assert_eq!(quality(99.9), ConnectionQuality::Good);
        assert_eq!(quality(150.0), ConnectionQuality::Fair);
        assert_eq!(quality(200.0), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::Fair.to_string(), "Fair");
    }

    #[test]
    fn test_table_overwrites() {
        let table = StatsTable::new();
        let peer = PeerId::from("a");
        table.record(peer.clone(), PeerStats { rtt_ms: 10.0, packets_lost: 0, timestamp: 1 });
        table.record(peer.clone(), PeerStats { rtt_ms: 20.0, packets_lost: 1, timestamp: 2 });

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&peer).unwrap().timestamp, 2);

        table.remove(&peer);
        assert!(table.is_empty());
    }

    enum FakeStats {
        Ready,
        Fail,
        Hang(Arc<AtomicUsize>),
    }

    /// Counts a hung stats call until its future is dropped
    struct InFlight(Arc<AtomicUsize>);

    impl InFlight {
        fn enter(counter: &Arc<AtomicUsize>) -> Self {
            counter.fetch_add(1, Ordering::SeqCst);
            Self(counter.clone())
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeLink {
        stats: FakeStats,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn create_data_channel(&self, _label: &str) -> LinkResult<Arc<dyn DataChannel>> {
            Err(LinkError::Closed)
        }
        async fn create_offer(&self) -> LinkResult<SessionDescription> {
            Err(LinkError::Closed)
        }
        async fn create_answer(&self) -> LinkResult<SessionDescription> {
            Err(LinkError::Closed)
        }
        async fn set_local_description(&self, _description: SessionDescription) -> LinkResult<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _description: SessionDescription) -> LinkResult<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> LinkResult<()> {
            Ok(())
        }
        async fn stats(&self) -> LinkResult<Vec<CandidatePairStats>> {
            match &self.stats {
                FakeStats::Ready => Ok(vec![pair(PairState::Succeeded, 0.025)]),
                FakeStats::Fail => Err(LinkError::Transport("stats unavailable".to_string())),
                FakeStats::Hang(in_flight) => {
                    let _guard = InFlight::enter(in_flight);
                    std::future::pending().await
                }
            }
        }
        async fn close(&self) {}
    }

    fn fake_link(stats: FakeStats) -> Arc<dyn PeerLink> {
        Arc::new(FakeLink { stats })
    }

    struct FakeSource {
        table: StatsTable,
        current_generation: u64,
        links: Vec<(PeerId, u64, Arc<dyn PeerLink>)>,
        sampled: Mutex<usize>,
    }

    impl StatsSource for FakeSource {
        fn sample_targets(&self) -> Vec<(PeerId, u64, Arc<dyn PeerLink>)> {
            *self.sampled.lock() += 1;
            self.links.clone()
        }

        fn record_sample(&self, peer: PeerId, generation: u64, stats: PeerStats) {
            if generation == self.current_generation {
                self.table.record(peer, stats);
            }
        }
    }

    #[tokio::test]
    async fn test_monitor_samples_peers_independently() {
        let source = Arc::new(FakeSource {
            table: StatsTable::new(),
            current_generation: 1,
            links: vec![
                (PeerId::from("ok"), 1, fake_link(FakeStats::Ready)),
                (PeerId::from("broken"), 1, fake_link(FakeStats::Fail)),
                (PeerId::from("stale"), 0, fake_link(FakeStats::Ready)),
            ],
            sampled: Mutex::new(0),
        });

        let handle = spawn_monitor(Arc::downgrade(&source), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(*source.sampled.lock() >= 2);
        let ok = source.table.get(&PeerId::from("ok")).unwrap();
        assert_approx_eq!(ok.rtt_ms, 25.0, 1e-9);
        assert!(source.table.get(&PeerId::from("broken")).is_none());
        assert!(source.table.get(&PeerId::from("stale")).is_none());

        drop(source);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_hung_stats_calls_time_out() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(FakeSource {
            table: StatsTable::new(),
            current_generation: 1,
            links: vec![
                (PeerId::from("ok"), 1, fake_link(FakeStats::Ready)),
                (PeerId::from("hung"), 1, fake_link(FakeStats::Hang(in_flight.clone()))),
            ],
            sampled: Mutex::new(0),
        });

        let handle = spawn_monitor(Arc::downgrade(&source), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(*source.sampled.lock() >= 5);
        assert!(in_flight.load(Ordering::SeqCst) <= 3);
        assert!(source.table.get(&PeerId::from("ok")).is_some());
        assert!(source.table.get(&PeerId::from("hung")).is_none());

        drop(source);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
