//! Seam between the broadcast core and the real-time transport engine.
//!
//! The core only needs a handful of capabilities from a peer connection:
//! apply/create session descriptions, add remote ICE candidates, send a
//! picture-loss indication and close. Engine callbacks are delivered as
//! [`PeerEvent`]s on a channel handed over at connect time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use canvascast_common::{IceCandidate, Result, SessionDescription};
use tokio::sync::mpsc;

/// RTP packet as read from and written to media tracks.
pub use webrtc::rtp::packet::Packet as MediaPacket;

/// Coarse peer-connection state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States the connection never recovers from.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Callback notifications from one peer connection.
pub enum PeerEvent {
    ConnectionState(LinkState),
    IceConnectionState(String),
    /// A locally gathered candidate that must be trickled to the browser.
    LocalCandidate(IceCandidate),
    /// The remote peer started sending media.
    Track(Box<dyn InboundTrack>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionState(state) => write!(f, "ConnectionState({state})"),
            Self::IceConnectionState(state) => write!(f, "IceConnectionState({state})"),
            Self::LocalCandidate(candidate) => write!(f, "LocalCandidate({})", candidate.candidate),
            Self::Track(track) => write!(f, "Track(ssrc={})", track.ssrc()),
        }
    }
}

pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Opens a connection with the shared outbound whiteboard track already
    /// attached. Engine callbacks are reported through `events`.
    async fn connect(&self, events: PeerEvents) -> Result<Arc<dyn PeerLink>>;
}

/// One transport-engine connection, exclusively owned by a peer session.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Applies a remote candidate. Candidates that arrive before the remote
    /// description are the engine's to buffer.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Sends an RTCP picture-loss indication for `media_ssrc`.
    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Inbound media track delivered by a producer.
#[async_trait]
pub trait InboundTrack: Send + Sync + 'static {
    fn ssrc(&self) -> u32;

    async fn read_packet(&self) -> Result<MediaPacket>;
}

/// Destination of the normalized outbound stream.
#[async_trait]
pub trait MediaSink: Send + Sync + 'static {
    async fn write_packet(&self, packet: &MediaPacket) -> Result<()>;
}
