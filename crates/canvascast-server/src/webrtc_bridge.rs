use std::sync::Arc;

use async_trait::async_trait;
use canvascast_common::{Error, IceCandidate, Result, SdpType, SessionDescription};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::engine::{
    InboundTrack, LinkState, MediaPacket, MediaSink, PeerConnector, PeerEvent, PeerEvents,
    PeerLink,
};

const VP8_PAYLOAD_TYPE: u8 = 96;
const VIDEO_CLOCK_RATE: u32 = 90_000;
const RTCP_READ_BUFFER: usize = 1500;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// webrtc-rs backed transport engine. Owns the single outbound whiteboard
/// track that every connection subscribes to.
pub struct WebRtcEngine {
    api: API,
    config: RTCConfiguration,
    whiteboard: Arc<TrackLocalStaticRTP>,
}

impl WebRtcEngine {
    pub fn new(stun_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: vp8_capability(),
                    payload_type: VP8_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(Error::transport)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(Error::transport)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let whiteboard = Arc::new(TrackLocalStaticRTP::new(
            vp8_capability(),
            "whiteboard".to_string(),
            "whiteboard".to_string(),
        ));

        Ok(Self {
            api,
            config,
            whiteboard,
        })
    }

    /// The shared outbound track, as the relay's write target.
    pub fn whiteboard_sink(&self) -> Arc<dyn MediaSink> {
        self.whiteboard.clone()
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

#[async_trait]
impl PeerConnector for WebRtcEngine {
    async fn connect(&self, events: PeerEvents) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(Error::transport)?,
        );

        let sender = pc
            .add_track(Arc::clone(&self.whiteboard) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::transport)?;

        // Interceptors (NACK responder, sender reports) only run while RTCP is read.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_READ_BUFFER];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(PeerEvent::ConnectionState(link_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = tx.send(PeerEvent::IceConnectionState(state.to_string()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!("failed to encode local ICE candidate: {}", err),
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Video {
                    let _ = tx.send(PeerEvent::Track(Box::new(RemoteVideoTrack { track })));
                } else {
                    debug!("ignoring non-video track ssrc={}", track.ssrc());
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcLink {
            pc,
            pending_candidates: Mutex::new(Vec::new()),
        }))
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => return Err(Error::protocol("rollback descriptions are not supported")),
    };
    parsed.map_err(Error::protocol)
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

/// One `RTCPeerConnection`.
///
/// webrtc-rs rejects candidates added before a remote description, so they
/// are parked here and applied right after the remote description lands.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        let mut pending = self.pending_candidates.lock().await;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(Error::transport)?;
        for candidate in pending.drain(..) {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                warn!("buffered ICE candidate rejected: {}", err);
            }
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(Error::transport)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(Error::transport)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let candidate = to_rtc_candidate(candidate);
        let mut pending = self.pending_candidates.lock().await;
        if self.pc.remote_description().await.is_none() {
            debug!("buffering ICE candidate until remote description is set");
            pending.push(candidate);
            return Ok(());
        }
        drop(pending);
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(Error::transport)
    }

    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<()> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
            .map(|_| ())
            .map_err(Error::transport)
    }

    async fn close(&self) -> Result<()> {
        info!("closing peer connection");
        self.pc.close().await.map_err(Error::transport)
    }
}

struct RemoteVideoTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for RemoteVideoTrack {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    async fn read_packet(&self) -> Result<MediaPacket> {
        self.track
            .read_rtp()
            .await
            .map(|(packet, _)| packet)
            .map_err(Error::transport)
    }
}

#[async_trait]
impl MediaSink for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &MediaPacket) -> Result<()> {
        self.write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(Error::transport)
    }
}
