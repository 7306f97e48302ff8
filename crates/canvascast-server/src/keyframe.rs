//! Periodic keyframe refresh so that viewers joining mid-stream can start
//! decoding without waiting for the producer's own keyframe interval.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::PeerLink;
use crate::registry::PeerRegistry;
use crate::session::PeerRole;

pub const DEFAULT_KEYFRAME_INTERVAL: Duration = Duration::from_millis(500);

/// Which connections receive a picture-loss indication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum KeyframeScope {
    /// Only the connection that delivered the packet.
    #[default]
    Producer,
    /// Every registered viewer. Sessions promoted to producer are skipped,
    /// including the one that delivered the packet.
    All,
}

/// Rate limiter for keyframe requests.
#[derive(Debug, Clone)]
pub struct KeyframePolicy {
    interval: Duration,
    last_request: Option<Instant>,
}

impl KeyframePolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: None,
        }
    }

    /// Returns true when a request is due at `now`, and records it as sent.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = match self.last_request {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_request = Some(now);
        }
        due
    }
}

impl Default for KeyframePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_KEYFRAME_INTERVAL)
    }
}

/// Driven by inbound packet arrival; sends picture-loss indications in the
/// background so the caller never waits on the network.
pub struct KeyframeRefresher {
    policy: KeyframePolicy,
    scope: KeyframeScope,
    registry: Arc<PeerRegistry>,
}

impl KeyframeRefresher {
    pub fn new(policy: KeyframePolicy, scope: KeyframeScope, registry: Arc<PeerRegistry>) -> Self {
        Self {
            policy,
            scope,
            registry,
        }
    }

    /// Returns whether a request was issued for this packet.
    pub fn on_packet(
        &mut self,
        now: Instant,
        producer: &Arc<dyn PeerLink>,
        media_ssrc: u32,
    ) -> bool {
        if !self.policy.poll(now) {
            return false;
        }
        trace!(ssrc = media_ssrc, scope = ?self.scope, "requesting keyframe");
        tokio::spawn(request_keyframe(
            self.scope,
            self.registry.clone(),
            producer.clone(),
            media_ssrc,
        ));
        true
    }
}

async fn request_keyframe(
    scope: KeyframeScope,
    registry: Arc<PeerRegistry>,
    producer: Arc<dyn PeerLink>,
    media_ssrc: u32,
) {
    match scope {
        KeyframeScope::Producer => {
            if let Err(err) = producer.send_picture_loss_indication(media_ssrc).await {
                debug!(ssrc = media_ssrc, "keyframe request failed: {}", err);
            }
        }
        KeyframeScope::All => {
            let report = registry
                .for_each_in_role(PeerRole::Viewer, |_, link| async move {
                    link.send_picture_loss_indication(media_ssrc).await
                })
                .await;
            debug!(
                ssrc = media_ssrc,
                delivered = report.delivered,
                failed = report.failed,
                "keyframe request broadcast"
            );
        }
    }
}
