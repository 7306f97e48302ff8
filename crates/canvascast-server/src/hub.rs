//! Process-wide broadcast service: the engine, the registry and the relay,
//! built once at startup and shared with every session.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::engine::{MediaSink, PeerConnector};
use crate::keyframe::{KeyframePolicy, KeyframeRefresher};
use crate::registry::PeerRegistry;
use crate::relay::WhiteboardRelay;
use crate::session::PeerRole;

pub struct BroadcastHub {
    connector: Arc<dyn PeerConnector>,
    registry: Arc<PeerRegistry>,
    relay: WhiteboardRelay,
}

/// Point-in-time counters exposed by `/health` and the metrics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubSnapshot {
    pub sessions: usize,
    pub producers: usize,
    pub packets_forwarded: u64,
    pub keyframe_requests: u64,
}

impl BroadcastHub {
    /// Builds the hub and starts the relay normalizer writing into `sink`.
    pub fn start(
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn MediaSink>,
        config: &ServerConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let registry = Arc::new(PeerRegistry::new());
        let keyframes = KeyframeRefresher::new(
            KeyframePolicy::new(config.keyframe_interval),
            config.keyframe_scope,
            registry.clone(),
        );
        let (relay, normalizer) = WhiteboardRelay::spawn(sink, keyframes, config.relay_queue);
        let hub = Arc::new(Self {
            connector,
            registry,
            relay,
        });
        (hub, normalizer)
    }

    pub fn connector(&self) -> &Arc<dyn PeerConnector> {
        &self.connector
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &WhiteboardRelay {
        &self.relay
    }

    pub async fn snapshot(&self) -> HubSnapshot {
        let stats = self.relay.stats();
        HubSnapshot {
            sessions: self.registry.len().await,
            producers: self.registry.count_role(PeerRole::Producer).await,
            packets_forwarded: stats.packets_forwarded(),
            keyframe_requests: stats.keyframe_requests(),
        }
    }
}
