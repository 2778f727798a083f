//! Session lifecycle coordination
//!
//! A session is one remote peer: the peer connection negotiated from its
//! offer, the local RTP port leased for it, the media producer feeding that
//! port, and the relay pumping units into the outbound track. The
//! coordinator owns the session registry and ties every piece to a single
//! cancellation token so teardown is one idempotent signal.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::port::{PortAllocator, PortLease};
use crate::relay::{PacketPump, TrackSink};
use crate::source::MediaSource;
use crate::{Error, Result};

/// Lifecycle of a single session
///
/// `Closed` and `Failed` are terminal; every other transition is forward
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Offer received, answer being produced
    Negotiating,
    /// Peer connection established, media flowing
    Active,
    /// Teardown in progress
    Closing,
    /// Torn down cleanly
    Closed,
    /// Peer connection failed before or after establishment
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Negotiating, Active)
                | (Negotiating, Closing)
                | (Negotiating, Failed)
                | (Active, Closing)
                | (Active, Failed)
                | (Closing, Closed)
        )
    }
}

/// One negotiated peer and the resources bound to it
pub struct Session {
    id: Uuid,
    port: u16,
    state: RwLock<SessionState>,
    cancel: CancellationToken,
    peer_connection: Arc<RTCPeerConnection>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Local port the producer targets for this session
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Apply a transition if the state machine allows it
    async fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.write().await;
        if !state.can_advance_to(next) {
            return false;
        }
        debug!(session_id = %self.id, from = %*state, to = %next, "session state change");
        *state = next;
        true
    }

    /// Tear the session down; safe to call any number of times, only the
    /// first caller does the work
    pub async fn shutdown(&self) {
        if !self.advance(SessionState::Closing).await {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.peer_connection.close().await {
            warn!(session_id = %self.id, error = %e, "peer connection close failed");
        }
        self.advance(SessionState::Closed).await;
        info!(session_id = %self.id, port = self.port, "session closed");
    }

    /// Mark the session failed and release its resources
    async fn fail(&self) {
        if !self.advance(SessionState::Failed).await {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.peer_connection.close().await {
            warn!(session_id = %self.id, error = %e, "peer connection close failed");
        }
        warn!(session_id = %self.id, port = self.port, "session failed");
    }
}

/// Builds peer connections and owns the live-session registry
///
/// The codec capability and API are assembled once at startup; sessions
/// share them read-only for their whole lifetime.
pub struct SessionCoordinator {
    config: Arc<Config>,
    allocator: Arc<PortAllocator>,
    api: API,
    capability: RTCRtpCodecCapability,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionCoordinator {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let codec = &config.webrtc.codec;
        let capability = RTCRtpCodecCapability {
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            channels: 0,
            sdp_fmtp_line: codec.fmtp_line.clone(),
            rtcp_feedback: vec![],
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: capability.clone(),
                    payload_type: codec.payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| Error::InvalidConfig(format!("codec registration failed: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::InvalidConfig(format!("interceptor registration failed: {}", e)))?;

        // Pin ICE host candidates to the configured ephemeral range so the
        // listening footprint is predictable.
        let mut setting_engine = SettingEngine::default();
        let ephemeral = EphemeralUDP::new(config.webrtc.ice_port_min, config.webrtc.ice_port_max)
            .map_err(|e| Error::InvalidConfig(format!("invalid ICE port range: {}", e)))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let allocator = Arc::new(PortAllocator::new(
            config.rtp.host.clone(),
            config.rtp.base_port,
            config.rtp.max_port,
            config.rtp.max_probes,
        ));

        Ok(Self {
            config,
            allocator,
            api,
            capability,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Number of sessions currently registered
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ports currently leased to sessions
    pub fn leased_ports(&self) -> usize {
        self.allocator.leased_count()
    }

    /// Negotiate a new session from a remote offer and return the answer SDP
    ///
    /// The local receive socket is bound before the producer is started, so
    /// no media is ever sent at an unbound port. Any failure mid-setup
    /// releases everything acquired so far.
    pub async fn negotiate(self: &Arc<Self>, offer_sdp: &str) -> Result<String> {
        if offer_sdp.trim().is_empty() {
            return Err(Error::SdpError("offer SDP is empty".to_string()));
        }
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("offer rejected: {}", e)))?;

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .webrtc
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::PeerConnectionError(format!("creation failed: {}", e)))?,
        );

        match self.establish(Arc::clone(&peer_connection), offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                // Partial setup: the port lease (if taken) was dropped on
                // the way out, only the peer connection remains.
                if let Err(close_err) = peer_connection.close().await {
                    warn!(error = %close_err, "cleanup close failed after setup error");
                }
                Err(e)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        peer_connection: Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
    ) -> Result<String> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            self.capability.clone(),
            "video".to_string(),
            "media-bridge".to_string(),
        ));
        let rtp_sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("add_track failed: {}", e)))?;

        // Drain sender reports so interceptors keep running; ends when the
        // peer connection closes.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });

        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("remote description rejected: {}", e)))?;
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("answer creation failed: {}", e)))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("local description rejected: {}", e)))?;

        // Non-trickle clients need the candidates inline; cap the wait so a
        // slow STUN round trip cannot stall the whole handshake.
        let gather_timeout = Duration::from_secs(self.config.webrtc.gather_timeout_seconds);
        if tokio::time::timeout(gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!("ICE gathering incomplete after {:?}, answering anyway", gather_timeout);
        }

        let local_description = peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::PeerConnectionError("no local description".to_string()))?;

        // Resource setup: lease a port, bind the receive socket, then start
        // the producer aimed at it. Errors here drop the lease on the way
        // out and the caller closes the peer connection.
        let lease = self.allocator.reserve()?;
        let port = lease.port();
        let socket = UdpSocket::bind((self.config.rtp.host.as_str(), port))
            .await
            .map_err(|e| Error::PeerConnectionError(format!("receive socket bind failed: {}", e)))?;

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            port,
            state: RwLock::new(SessionState::Negotiating),
            cancel: CancellationToken::new(),
            peer_connection: Arc::clone(&peer_connection),
        });

        let source_done = MediaSource::spawn(
            &self.config.source,
            &self.config.rtp.host,
            port,
            session.cancel.clone(),
        )?;

        let pump = PacketPump::new(socket, Arc::new(TrackSink::new(track)), session.cancel.clone());
        spawn_relay(pump, source_done, lease, session.id);

        self.watch_connection(&peer_connection, &session);
        self.sessions
            .write()
            .await
            .insert(session.id, Arc::clone(&session));
        info!(session_id = %session.id, port, "session negotiated");

        Ok(local_description.sdp)
    }

    /// Drive the session state machine from peer connection state changes
    ///
    /// Weak references only: the callback must not keep the peer connection
    /// or the session alive past teardown.
    fn watch_connection(self: &Arc<Self>, peer_connection: &Arc<RTCPeerConnection>, session: &Arc<Session>) {
        let coordinator = Arc::downgrade(self);
        let session = Arc::downgrade(session);
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let coordinator = Weak::clone(&coordinator);
            let session = Weak::clone(&session);
            Box::pin(async move {
                let Some(session) = session.upgrade() else {
                    return;
                };
                debug!(session_id = %session.id, state = %s, "peer connection state change");
                match s {
                    RTCPeerConnectionState::Connected => {
                        if session.advance(SessionState::Active).await {
                            info!(session_id = %session.id, "session active");
                        }
                    }
                    RTCPeerConnectionState::Failed => {
                        session.fail().await;
                        if let Some(coordinator) = coordinator.upgrade() {
                            coordinator.remove(session.id).await;
                        }
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        session.shutdown().await;
                        if let Some(coordinator) = coordinator.upgrade() {
                            coordinator.remove(session.id).await;
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    async fn remove(&self, id: Uuid) {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!(session_id = %id, "session deregistered");
        }
    }

    /// Tear down every live session; used on service shutdown
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            session.shutdown().await;
        }
    }
}

/// Run the relay and release the session's port only once both the relay
/// and the producer supervisor have stopped
///
/// Without the second wait a new session could lease the port while the
/// outgoing producer is still emitting into it.
fn spawn_relay(
    pump: PacketPump,
    source_done: tokio::task::JoinHandle<()>,
    lease: PortLease,
    session_id: Uuid,
) {
    tokio::spawn(async move {
        let forwarded = pump.run().await;
        debug!(session_id = %session_id, forwarded, "relay finished");
        if source_done.await.is_err() {
            warn!(session_id = %session_id, "media source supervisor panicked");
        }
        drop(lease);
    });
}

/// Build an SDP offer carrying one video media section, for exercising the
/// negotiation path without a live browser.
#[cfg(test)]
pub(crate) async fn video_offer_sdp() -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry =
        register_default_interceptors(Default::default(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let offerer = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    offerer
        .add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .unwrap();

    let offer = offerer.create_offer(None).await.unwrap();
    let mut gather_complete = offerer.gathering_complete_promise().await;
    offerer.set_local_description(offer).await.unwrap();
    let _ = gather_complete.recv().await;

    let sdp = offerer.local_description().await.unwrap().sdp;
    offerer.close().await.unwrap();
    sdp
}
