//! One browser connection: signaling handshake, engine callbacks and, for
//! producers, the inbound media readers.
//!
//! ```text
//! Init --offer-request sent--> OfferRequested --offer applied--> Negotiating
//!                                                                    |
//!                                          link connected            v
//! Closed <--- channel ended / link failed --- any state      Established
//! ```
//!
//! ICE candidates are applied as soon as they arrive, in any state. The
//! session is registered with the hub for its whole lifetime and removes
//! itself on teardown.

use std::fmt;
use std::sync::{Arc, OnceLock};

use canvascast_common::{Error, Result, Signal, SignalPayload, SignalingChannel};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{InboundTrack, LinkState, PeerEvent, PeerLink};
use crate::hub::BroadcastHub;
use crate::relay::{InboundPacket, WhiteboardRelay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Receives the outbound whiteboard track only.
    Viewer,
    /// Delivered at least one inbound media track.
    Producer,
}

/// Role of a session, decided once when its first inbound track shows up.
#[derive(Debug, Default)]
pub struct RoleSlot(OnceLock<PeerRole>);

impl RoleSlot {
    /// Returns true only for the call that made the session a producer.
    pub fn promote_to_producer(&self) -> bool {
        self.0.set(PeerRole::Producer).is_ok()
    }

    pub fn get(&self) -> PeerRole {
        self.0.get().copied().unwrap_or(PeerRole::Viewer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    OfferRequested,
    Negotiating,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    OfferRequestSent,
    /// A remote offer was applied and our answer sent back.
    OfferApplied,
    /// A remote answer was applied.
    AnswerApplied,
    /// The engine reported the connection as connected.
    Connected,
    Closed,
}

impl HandshakeState {
    pub fn advance(self, transition: Transition) -> Result<Self> {
        use HandshakeState as S;
        use Transition as T;

        match (self, transition) {
            (S::Closed, _) => Err(Error::protocol(format!(
                "{transition:?} after the session closed"
            ))),
            (_, T::Closed) => Ok(S::Closed),
            (S::Init, T::OfferRequestSent) => Ok(S::OfferRequested),
            (S::OfferRequested | S::Negotiating, T::OfferApplied | T::AnswerApplied) => {
                Ok(S::Negotiating)
            }
            // Renegotiation keeps an established session established.
            (S::Established, T::OfferApplied | T::AnswerApplied) => Ok(S::Established),
            (S::Negotiating | S::Established, T::Connected) => Ok(S::Established),
            (state, transition) => Err(Error::protocol(format!(
                "unexpected {transition:?} in state {state:?}"
            ))),
        }
    }
}

/// Current handshake state, observable through a watch channel.
struct HandshakeTracker {
    tx: watch::Sender<HandshakeState>,
}

impl HandshakeTracker {
    fn new() -> Self {
        let (tx, _) = watch::channel(HandshakeState::Init);
        Self { tx }
    }

    fn advance(&self, transition: Transition) -> Result<HandshakeState> {
        let mut outcome = Err(Error::internal("handshake state not updated"));
        self.tx.send_if_modified(|state| match state.advance(transition) {
            Ok(next) => {
                let changed = next != *state;
                *state = next;
                outcome = Ok(next);
                changed
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        outcome
    }
}

struct SessionInner {
    id: SessionId,
    channel: SignalingChannel,
    link: Arc<dyn PeerLink>,
    role: Arc<RoleSlot>,
    handshake: HandshakeTracker,
    hub: Arc<BroadcastHub>,
    /// Signalled when the engine reports a terminal connection state.
    link_ended: Notify,
}

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    /// Opens the engine connection and registers the session. The channel
    /// is closed again if the engine refuses the connection.
    pub async fn open(
        hub: Arc<BroadcastHub>,
        channel: SignalingChannel,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = match hub.connector().connect(events_tx).await {
            Ok(link) => link,
            Err(err) => {
                channel.close().await;
                return Err(err);
            }
        };

        let id = SessionId::new();
        let role = Arc::new(RoleSlot::default());
        hub.registry().add(id, link.clone(), role.clone()).await;

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                channel,
                link,
                role,
                handshake: HandshakeTracker::new(),
                hub,
                link_ended: Notify::new(),
            }),
        };
        Ok((session, events_rx))
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role.get()
    }

    pub fn state(&self) -> watch::Receiver<HandshakeState> {
        self.inner.handshake.tx.subscribe()
    }

    /// Drives the session until the browser goes away or the connection
    /// fails, then releases everything it holds.
    pub async fn run(self, events: mpsc::UnboundedReceiver<PeerEvent>) -> Result<()> {
        let pump = tokio::spawn(self.clone().pump_events(events));

        let outcome = tokio::select! {
            result = self.handshake_loop() => result,
            _ = self.inner.link_ended.notified() => {
                debug!(session = %self.inner.id, "peer connection ended");
                Ok(())
            }
        };

        pump.abort();
        self.teardown().await;
        outcome
    }

    async fn handshake_loop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.channel.send(&Signal::offer_request()).await?;
        inner.handshake.advance(Transition::OfferRequestSent)?;
        debug!(session = %inner.id, "offer requested");

        loop {
            let signal = match inner.channel.receive().await {
                Ok(signal) => signal,
                Err(err) => {
                    debug!(session = %inner.id, "signaling ended: {}", err);
                    return Ok(());
                }
            };
            self.handle_signal(signal).await?;
        }
    }

    async fn handle_signal(&self, signal: Signal) -> Result<()> {
        let inner = &self.inner;
        match signal.decode()? {
            SignalPayload::Offer(offer) => {
                inner.link.set_remote_description(offer).await?;
                let answer = inner.link.create_answer().await?;
                inner.link.set_local_description(answer.clone()).await?;
                inner.channel.send(&Signal::answer(&answer)?).await?;
                let state = inner.handshake.advance(Transition::OfferApplied)?;
                debug!(session = %inner.id, ?state, "answer sent");
            }
            SignalPayload::Answer(answer) => {
                inner.link.set_remote_description(answer).await?;
                let state = inner.handshake.advance(Transition::AnswerApplied)?;
                debug!(session = %inner.id, ?state, "remote answer applied");
            }
            SignalPayload::Ice(candidate) => {
                inner.link.add_ice_candidate(candidate).await?;
            }
            SignalPayload::OfferRequest => {
                warn!(session = %inner.id, "ignoring offer-request from peer");
            }
        }
        Ok(())
    }

    /// Handles engine callbacks for this session's connection.
    async fn pump_events(self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let inner = &self.inner;
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    let sent = match Signal::ice(&candidate) {
                        Ok(signal) => inner.channel.send(&signal).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        debug!(session = %inner.id, "local candidate not sent: {}", err);
                    }
                }
                PeerEvent::ConnectionState(state) => {
                    info!(session = %inner.id, %state, "peer connection state changed");
                    if state == LinkState::Connected {
                        if let Err(err) = inner.handshake.advance(Transition::Connected) {
                            debug!(session = %inner.id, "{}", err);
                        }
                    }
                    if state.is_terminal() {
                        inner.link_ended.notify_one();
                    }
                }
                PeerEvent::IceConnectionState(state) => {
                    info!(session = %inner.id, state = %state, "ice connection state changed");
                }
                PeerEvent::Track(track) => {
                    if inner.role.promote_to_producer() {
                        info!(session = %inner.id, ssrc = track.ssrc(), "session is producing media");
                    }
                    tokio::spawn(forward_track(
                        inner.id,
                        track,
                        inner.hub.relay().clone(),
                        inner.link.clone(),
                    ));
                }
            }
        }
    }

    async fn teardown(&self) {
        let inner = &self.inner;
        let _ = inner.handshake.advance(Transition::Closed);
        inner.hub.registry().remove(inner.id).await;
        if let Err(err) = inner.link.close().await {
            debug!(session = %inner.id, "closing peer connection: {}", err);
        }
        inner.channel.close().await;
    }
}

/// Reads one inbound track until it ends and hands every packet to the relay.
async fn forward_track(
    session: SessionId,
    track: Box<dyn InboundTrack>,
    relay: WhiteboardRelay,
    producer: Arc<dyn PeerLink>,
) {
    let ssrc = track.ssrc();
    loop {
        let packet = match track.read_packet().await {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%session, ssrc, "inbound track ended: {}", err);
                break;
            }
        };
        let inbound = InboundPacket {
            packet,
            producer: producer.clone(),
        };
        if let Err(err) = relay.submit(inbound).await {
            warn!(%session, ssrc, "dropping inbound track: {}", err);
            break;
        }
    }
    relay.end_source(ssrc).await;
}

/// Runs one session to completion. Failures end this session only.
pub async fn serve(hub: Arc<BroadcastHub>, channel: SignalingChannel) {
    let (session, events) = match PeerSession::open(hub, channel).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = ?err, "failed to open peer session");
            return;
        }
    };

    let id = session.id();
    info!(session = %id, "session opened");
    match session.run(events).await {
        Ok(()) => info!(session = %id, "session closed"),
        Err(err) if err.is_disconnect() => info!(session = %id, "session closed: {}", err),
        Err(err) => error!(session = %id, error = ?err, "session aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::mock::{packet, LinkCall, MockConnector, MockTrack, RecordingSink};
    use crate::keyframe::KeyframeScope;
    use canvascast_common::{IceCandidate, SessionDescription, SignalEvent};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        hub: Arc<BroadcastHub>,
        connector: Arc<MockConnector>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new(config: ServerConfig) -> Self {
            let connector = Arc::new(MockConnector::default());
            let sink = Arc::new(RecordingSink::default());
            let (hub, _normalizer) = BroadcastHub::start(connector.clone(), sink.clone(), &config);
            Self {
                hub,
                connector,
                sink,
            }
        }

        /// Starts a session and consumes the initial offer-request.
        async fn connect(&self) -> (SignalingChannel, JoinHandle<()>) {
            let (server_side, browser) = SignalingChannel::pair();
            let task = tokio::spawn(serve(self.hub.clone(), server_side));
            let first = timeout(WAIT, browser.receive()).await.unwrap().unwrap();
            assert_eq!(first, Signal::offer_request());
            (browser, task)
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn wait_until_registry(hub: &BroadcastHub, expected: usize) {
        timeout(WAIT, async {
            while hub.registry().len().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_handshake_transitions() {
        let state = HandshakeState::Init
            .advance(Transition::OfferRequestSent)
            .unwrap();
        assert_eq!(state, HandshakeState::OfferRequested);
        let state = state.advance(Transition::OfferApplied).unwrap();
        assert_eq!(state, HandshakeState::Negotiating);
        let state = state.advance(Transition::Connected).unwrap();
        assert_eq!(state, HandshakeState::Established);
        assert_eq!(
            state.advance(Transition::OfferApplied).unwrap(),
            HandshakeState::Established
        );
        let state = state.advance(Transition::Closed).unwrap();
        assert_eq!(state, HandshakeState::Closed);
        assert!(state.advance(Transition::Closed).is_err());
    }

    #[test]
    fn test_handshake_rejects_out_of_order() {
        assert!(HandshakeState::Init
            .advance(Transition::OfferApplied)
            .is_err());
        assert!(HandshakeState::OfferRequested
            .advance(Transition::Connected)
            .is_err());
        assert!(HandshakeState::Negotiating
            .advance(Transition::OfferRequestSent)
            .is_err());
        assert_eq!(
            HandshakeState::Init.advance(Transition::Closed).unwrap(),
            HandshakeState::Closed
        );
    }

    #[test]
    fn test_role_promoted_once() {
        let role = RoleSlot::default();
        assert_eq!(role.get(), PeerRole::Viewer);
        assert!(role.promote_to_producer());
        assert!(!role.promote_to_producer());
        assert_eq!(role.get(), PeerRole::Producer);
    }

    #[tokio::test]
    async fn test_offer_is_answered_and_session_registered() {
        let harness = Harness::new(ServerConfig::default());
        let (browser, _task) = harness.connect().await;

        let offer = SessionDescription::offer("v=0 browser-offer");
        browser.send(&Signal::offer(&offer).unwrap()).await.unwrap();

        let reply = timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        assert_eq!(reply.event, SignalEvent::Answer);
        let SignalPayload::Answer(answer) = reply.decode().unwrap() else {
            panic!("expected answer payload");
        };
        assert_eq!(answer.sdp, "v=0 mock-answer");

        assert_eq!(harness.hub.registry().len().await, 1);
        assert_eq!(
            harness.connector.link(0).calls(),
            vec![
                LinkCall::SetRemote(offer),
                LinkCall::CreateAnswer,
                LinkCall::SetLocal(answer),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_viewer_leaves_registry_and_gets_no_keyframes() {
        let config = ServerConfig {
            keyframe_scope: KeyframeScope::All,
            ..ServerConfig::default()
        };
        let harness = Harness::new(config);
        let (browser, task) = harness.connect().await;
        browser
            .send(&Signal::offer(&SessionDescription::offer("v=0")).unwrap())
            .await
            .unwrap();
        timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        assert_eq!(harness.hub.registry().len().await, 1);

        browser.close().await;
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(harness.hub.registry().len().await, 0);
        let viewer_link = harness.connector.link(0);
        assert!(viewer_link.is_closed());

        let producer: Arc<dyn PeerLink> = Arc::new(crate::engine::mock::MockLink::default());
        harness
            .hub
            .relay()
            .submit(InboundPacket {
                packet: packet(3, 0, 0),
                producer,
            })
            .await
            .unwrap();
        timeout(WAIT, harness.sink.wait_for(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.hub.relay().stats().keyframe_requests(), 1);
        assert_eq!(viewer_link.picture_loss_count(), 0);
    }

    #[tokio::test]
    async fn test_ice_before_offer_is_applied_immediately() {
        let harness = Harness::new(ServerConfig::default());
        let (browser, _task) = harness.connect().await;

        browser
            .send(&Signal::ice(&candidate(1)).unwrap())
            .await
            .unwrap();
        let offer = SessionDescription::offer("v=0");
        browser.send(&Signal::offer(&offer).unwrap()).await.unwrap();
        timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        browser
            .send(&Signal::ice(&candidate(2)).unwrap())
            .await
            .unwrap();

        let link = harness.connector.link(0);
        timeout(WAIT, async {
            while !link.calls().contains(&LinkCall::AddCandidate(candidate(2))) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let calls = link.calls();
        assert_eq!(calls[0], LinkCall::AddCandidate(candidate(1)));
        assert_eq!(calls[1], LinkCall::SetRemote(offer));
        assert_eq!(harness.hub.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_local_candidates_are_trickled() {
        let harness = Harness::new(ServerConfig::default());
        let (browser, _task) = harness.connect().await;

        harness
            .connector
            .events(0)
            .send(PeerEvent::LocalCandidate(candidate(9)))
            .unwrap();
        let signal = timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        assert_eq!(signal.decode().unwrap(), SignalPayload::Ice(candidate(9)));
    }

    #[tokio::test]
    async fn test_connected_state_establishes_session() {
        let harness = Harness::new(ServerConfig::default());
        let (server_side, browser) = SignalingChannel::pair();
        let (session, events) = PeerSession::open(harness.hub.clone(), server_side)
            .await
            .unwrap();
        let mut state = session.state();
        tokio::spawn(session.run(events));

        timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        browser
            .send(&Signal::offer(&SessionDescription::offer("v=0")).unwrap())
            .await
            .unwrap();
        timeout(WAIT, browser.receive()).await.unwrap().unwrap();
        harness
            .connector
            .events(0)
            .send(PeerEvent::ConnectionState(LinkState::Connected))
            .unwrap();

        timeout(WAIT, state.wait_for(|s| *s == HandshakeState::Established))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_link_closes_session() {
        let harness = Harness::new(ServerConfig::default());
        let (browser, task) = harness.connect().await;

        harness
            .connector
            .events(0)
            .send(PeerEvent::ConnectionState(LinkState::Failed))
            .unwrap();

        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(harness.hub.registry().len().await, 0);
        assert!(harness.connector.link(0).is_closed());
        assert!(matches!(
            timeout(WAIT, browser.receive()).await.unwrap(),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_inbound_track_promotes_and_feeds_relay() {
        let harness = Harness::new(ServerConfig::default());
        let (_browser, _task) = harness.connect().await;

        let (track, packets) = MockTrack::new(77);
        harness
            .connector
            .events(0)
            .send(PeerEvent::Track(Box::new(track)))
            .unwrap();
        packets.send(packet(77, 1000, 90_000)).unwrap();
        packets.send(packet(77, 1001, 93_000)).unwrap();

        let written = timeout(WAIT, harness.sink.wait_for(2)).await.unwrap();
        assert_eq!(written[0].header.sequence_number, 0);
        assert_eq!(written[1].header.timestamp, 3_000);
        assert_eq!(harness.hub.snapshot().await.producers, 1);

        // Producer scope: the keyframe request goes back to the producer.
        let link = harness.connector.link(0);
        timeout(WAIT, async {
            while link.picture_loss_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(link.calls().contains(&LinkCall::PictureLoss(77)));
    }

    #[tokio::test]
    async fn test_bad_payload_aborts_only_that_session() {
        let harness = Harness::new(ServerConfig::default());
        let (bad, bad_task) = harness.connect().await;
        let (good, _good_task) = harness.connect().await;
        wait_until_registry(&harness.hub, 2).await;

        bad.send(&Signal {
            event: SignalEvent::Offer,
            data: "not a description".to_string(),
        })
        .await
        .unwrap();

        timeout(WAIT, bad_task).await.unwrap().unwrap();
        assert_eq!(harness.hub.registry().len().await, 1);

        good.send(&Signal::offer(&SessionDescription::offer("v=0")).unwrap())
            .await
            .unwrap();
        let reply = timeout(WAIT, good.receive()).await.unwrap().unwrap();
        assert_eq!(reply.event, SignalEvent::Answer);
    }

    #[tokio::test]
    async fn test_engine_failure_aborts_only_that_session() {
        let harness = Harness::new(ServerConfig::default());
        let (failing, failing_task) = harness.connect().await;
        let (healthy, _healthy_task) = harness.connect().await;
        wait_until_registry(&harness.hub, 2).await;
        harness
            .connector
            .link(0)
            .fail_remote_description
            .store(true, std::sync::atomic::Ordering::SeqCst);

        failing
            .send(&Signal::offer(&SessionDescription::offer("v=0")).unwrap())
            .await
            .unwrap();

        timeout(WAIT, failing_task).await.unwrap().unwrap();
        assert_eq!(harness.hub.registry().len().await, 1);
        assert!(harness.connector.link(0).is_closed());
        assert!(!harness.connector.link(1).is_closed());

        healthy
            .send(&Signal::offer(&SessionDescription::offer("v=0")).unwrap())
            .await
            .unwrap();
        let reply = timeout(WAIT, healthy.receive()).await.unwrap().unwrap();
        assert_eq!(reply.event, SignalEvent::Answer);
    }

    #[tokio::test]
    async fn test_engine_refusal_closes_channel() {
        let harness = Harness::new(ServerConfig::default());
        harness
            .connector
            .fail_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (server_side, browser) = SignalingChannel::pair();
        timeout(WAIT, serve(harness.hub.clone(), server_side))
            .await
            .unwrap();
        assert!(browser.receive().await.is_err());
        assert_eq!(harness.hub.registry().len().await, 0);
    }
}
