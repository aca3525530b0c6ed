//! WebRTC transport backed by the `webrtc` crate
//!
//! One `RTCPeerConnection` per link, one reliable ordered data channel on it.
//! The initiator creates the channel; the responder receives it through the
//! connection's data channel callback. Both sides report it as open only
//! once the channel itself fires its open callback.

use super::{DataChannel, LinkEvents, PeerLink, Transport};
use crate::config::MeshConfig;
use crate::error::{LinkError, LinkResult};
use crate::health::{CandidatePairStats, PairState};
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{IceCandidate, PeerId, SdpType, SessionDescription};
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

fn transport_error(e: webrtc::Error) -> LinkError {
    LinkError::Transport(e.to_string())
}

pub struct WebRtcTransport {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcTransport {
    pub fn new(config: &MeshConfig) -> LinkResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = Vec::new();
        if !config.ice_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            });
        }
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_link(&self, peer: &PeerId, events: LinkEvents) -> LinkResult<Arc<dyn PeerLink>> {
        let connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(transport_error)?,
        );

        let link = WebRtcLink {
            peer: peer.clone(),
            connection,
            events,
        };
        link.install_handlers();
        debug!("WebRTC link to {} created", peer);
        Ok(Arc::new(link))
    }
}

pub struct WebRtcLink {
    peer: PeerId,
    connection: Arc<RTCPeerConnection>,
    events: LinkEvents,
}

impl WebRtcLink {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => events.local_candidate(from_candidate_init(init)),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            Box::pin(async move {
                debug!("Remote data channel '{}' announced", channel.label());
                wire_channel(&channel, events);
            })
        }));

        let peer = self.peer.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                match state {
                    RTCPeerConnectionState::Connected => info!("Connection to {} established", peer),
                    RTCPeerConnectionState::Failed => warn!("Connection to {} failed", peer),
                    other => debug!("Connection to {} is {}", peer, other),
                }
                Box::pin(async {})
            }));
    }
}

/// Forwards the channel's lifecycle and inbound text to the link's event sink
fn wire_channel(channel: &Arc<RTCDataChannel>, events: LinkEvents) {
    // Handlers live inside the channel; hold it weakly to avoid a cycle
    let weak: Weak<RTCDataChannel> = Arc::downgrade(channel);
    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            open_events.channel_open(Arc::new(WebRtcChannel { inner }));
        }
        Box::pin(async {})
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        match String::from_utf8(message.data.to_vec()) {
            Ok(text) => message_events.message(text),
            Err(_) => warn!(
                "Dropping binary message of {} bytes from {}",
                message.data.len(),
                message_events.peer()
            ),
        }
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        events.channel_closed();
        Box::pin(async {})
    }));
}

fn to_rtc_description(description: SessionDescription) -> LinkResult<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| LinkError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> LinkResult<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(LinkError::InvalidDescription(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn pair_state(state: CandidatePairState) -> PairState {
    match state {
        CandidatePairState::Succeeded => PairState::Succeeded,
        CandidatePairState::InProgress => PairState::InProgress,
        CandidatePairState::Failed => PairState::Failed,
        _ => PairState::Waiting,
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_data_channel(&self, label: &str) -> LinkResult<Arc<dyn DataChannel>> {
        // Default init is reliable and ordered
        let inner = self
            .connection
            .create_data_channel(label, None)
            .await
            .map_err(transport_error)?;
        wire_channel(&inner, self.events.clone());
        Ok(Arc::new(WebRtcChannel { inner }))
    }

    async fn create_offer(&self) -> LinkResult<SessionDescription> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(transport_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> LinkResult<SessionDescription> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(transport_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()> {
        let description = to_rtc_description(description)?;
        self.connection
            .set_local_description(description)
            .await
            .map_err(transport_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()> {
        let description = to_rtc_description(description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| LinkError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()> {
        self.connection
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| LinkError::InvalidCandidate(e.to_string()))
    }

    async fn stats(&self) -> LinkResult<Vec<CandidatePairStats>> {
        let report = self.connection.get_stats().await;
        let pairs = report
            .reports
            .values()
            .filter_map(|report| match report {
                StatsReportType::CandidatePair(pair) => Some(CandidatePairStats {
                    state: pair_state(pair.state),
                    current_round_trip_time: pair.current_round_trip_time,
                    // ICE pair reports carry no loss counter
                    packets_lost: 0,
                }),
                _ => None,
            })
            .collect();
        Ok(pairs)
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection to {} failed: {}", self.peer, e);
        }
    }
}

pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            debug!("Closing data channel failed: {}", e);
        }
    }
}
